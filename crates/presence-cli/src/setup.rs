//! `presence setup` downloads the face detection model; `presence check`
//! verifies what is already on disk.

use anyhow::{bail, Context, Result};
use presence_models::{file_digest, DigestWriter, Model, REQUIRED};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub fn resolve_model_dir(model_dir: Option<PathBuf>) -> PathBuf {
    model_dir
        .or_else(|| std::env::var("PRESENCE_MODEL_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| presence_models::default_model_dir(is_root()))
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Prints a percentage each time another tenth of the body has arrived.
struct Progress<W> {
    inner: DigestWriter<W>,
    expected: Option<u64>,
    shown: u64,
}

impl<W: Write> Write for Progress<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(total) = self.expected.filter(|t| *t > 0) {
            let tenth = self.inner.written() * 10 / total;
            if tenth > self.shown {
                self.shown = tenth;
                print!("    {}%\r", tenth.min(10) * 10);
                io::stdout().flush().ok();
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Fetch `model` into `dest`. The body is hashed while it streams to a
/// `.part` file, which only replaces `dest` once the digest matches.
fn fetch(model: &Model, dest: &Path) -> Result<()> {
    let partial = dest.with_extension("part");
    println!("  fetching {} (~{})", model.file_name, model.approx_size);

    let response = ureq::get(model.url)
        .call()
        .with_context(|| format!("request for {} failed", model.url))?;
    let expected = response
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let file = fs::File::create(&partial)
        .with_context(|| format!("cannot create {}", partial.display()))?;
    let mut sink = Progress {
        inner: DigestWriter::new(file),
        expected,
        shown: 0,
    };
    io::copy(&mut response.into_body().into_reader(), &mut sink)
        .with_context(|| format!("download of {} interrupted", model.file_name))?;
    let (file, digest) = sink.inner.finish()?;
    drop(file);

    if !model.matches(&digest) {
        fs::remove_file(&partial).ok();
        bail!(
            "{} failed verification: got {digest}, expected {}",
            model.file_name,
            model.sha256
        );
    }
    println!("  {} verified", model.file_name);

    fs::rename(&partial, dest)
        .with_context(|| format!("cannot move {} into place", partial.display()))?;
    Ok(())
}

/// What to do with a model file already on disk.
#[derive(Debug, PartialEq, Eq)]
enum Existing {
    Missing,
    Valid,
    Mismatch,
    Unreadable,
}

fn inspect(model: &Model, dest: &Path) -> Existing {
    if !dest.exists() {
        return Existing::Missing;
    }
    match file_digest(dest) {
        Ok(digest) if model.matches(&digest) => Existing::Valid,
        Ok(_) => Existing::Mismatch,
        Err(_) => Existing::Unreadable,
    }
}

/// Make sure every required model in `dir` is present and intact.
pub fn run(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    println!("Models: {}", dir.display());

    let mut fetched = 0;
    for model in REQUIRED {
        let dest = model.path_in(dir);
        match inspect(model, &dest) {
            Existing::Valid => {
                println!("  {} ok", model.file_name);
                continue;
            }
            Existing::Mismatch => println!("  {} is corrupt, replacing", model.file_name),
            Existing::Unreadable => println!("  {} is unreadable, replacing", model.file_name),
            Existing::Missing => {}
        }
        fetch(model, &dest)?;
        fetched += 1;
    }

    match fetched {
        0 => println!("Nothing to fetch; the daemon can use scrfd."),
        n => println!("Fetched {n} model(s); the daemon can use scrfd."),
    }
    Ok(())
}

/// Check the models in `dir` without touching the network.
pub fn check(dir: &Path) -> Result<()> {
    println!("Models: {}", dir.display());
    for model in REQUIRED {
        let path = model.check_in(dir)?;
        println!("  {} ok ({})", model.file_name, path.display());
    }
    Ok(())
}
