use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presence_hw::CameraConfig;
use tracing_subscriber::EnvFilter;

mod client;
mod probe;
mod setup;

use client::DaemonClient;

#[derive(Parser, Debug)]
#[command(name = "presence", author, version, about = "Presence attendance tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download and verify the face detection model.
    Setup {
        /// Model directory (default: per-user data dir, or /var/lib/presence/models as root).
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Verify the models on disk without downloading.
    Check {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Read frames straight from the camera.
    Probe {
        /// V4L2 device path or stub:// spec.
        #[arg(long, env = "PRESENCE_CAMERA_DEVICE", default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Save the last frame as JPEG.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show daemon status.
    Status(DaemonArgs),
    /// Show the latest liveness metrics for a user.
    Metrics(DaemonArgs),
    /// List recent attendance records for a user.
    History {
        #[command(flatten)]
        daemon: DaemonArgs,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(clap::Args, Debug)]
struct DaemonArgs {
    /// Daemon address.
    #[arg(long, env = "PRESENCE_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    addr: String,
    /// User to query as (sent in the identity header).
    #[arg(long, env = "USER")]
    user: String,
    #[arg(long, env = "PRESENCE_IDENTITY_HEADER", default_value = "x-authenticated-user")]
    identity_header: String,
}

impl DaemonArgs {
    fn client(&self) -> DaemonClient {
        DaemonClient::new(&self.addr, &self.identity_header, &self.user)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Setup { model_dir } => setup::run(&setup::resolve_model_dir(model_dir)),
        Command::Check { model_dir } => setup::check(&setup::resolve_model_dir(model_dir)),
        Command::Probe {
            device,
            width,
            height,
            frames,
            output,
        } => {
            let config = CameraConfig {
                device,
                width,
                height,
                read_timeout: Duration::from_secs(2),
            };
            let report = probe::capture(config, frames)?;
            println!(
                "captured {} frame(s) at {}x{} in {} ms",
                report.frames, report.width, report.height, report.elapsed_ms
            );
            if let (Some(path), Some(frame)) = (output, report.last.as_ref()) {
                probe::save_jpeg(frame, &path)?;
                println!("saved {}", path.display());
            }
            Ok(())
        }
        Command::Status(daemon) => print_json(&daemon.client().status()?),
        Command::Metrics(daemon) => print_json(&daemon.client().metrics()?),
        Command::History { daemon, limit } => {
            let records = daemon.client().history(limit)?;
            let lines = client::format_history(&records);
            if lines.is_empty() {
                println!("No attendance recorded for {}.", daemon.user);
            }
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to format response")?;
    println!("{text}");
    Ok(())
}
