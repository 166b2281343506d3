//! presence-models: the model files the daemon needs and how to tell a good
//! copy from a truncated or tampered one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// A downloadable model pinned to a SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub file_name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
    /// Rough download size, for progress messages.
    pub approx_size: &'static str,
}

/// SCRFD 10G face detector from the insightface buffalo_l pack.
// Digest matches the `oid sha256:` line of the upstream LFS pointer.
pub const DETECTION_MODEL: Model = Model {
    file_name: "det_10g.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
    sha256: "5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91",
    approx_size: "16 MB",
};

/// Everything `presence setup` fetches.
pub const REQUIRED: &[Model] = &[DETECTION_MODEL];

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{model} not found at {path}; run `presence setup`")]
    Missing { model: &'static str, path: PathBuf },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{model} at {path} has digest {actual}, expected {expected}")]
    Digest {
        model: &'static str,
        path: PathBuf,
        expected: &'static str,
        actual: String,
    },
}

impl Model {
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name)
    }

    /// Check the file at `path` against the pinned digest.
    pub fn check_file(&self, path: &Path) -> Result<(), ModelError> {
        if !path.exists() {
            return Err(ModelError::Missing {
                model: self.file_name,
                path: path.to_path_buf(),
            });
        }
        let actual = file_digest(path)?;
        if !self.matches(&actual) {
            return Err(ModelError::Digest {
                model: self.file_name,
                path: path.to_path_buf(),
                expected: self.sha256,
                actual,
            });
        }
        Ok(())
    }

    /// Check the copy inside `dir` and return its path.
    pub fn check_in(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        let path = self.path_in(dir);
        self.check_file(&path)?;
        Ok(path)
    }

    pub fn matches(&self, digest: &str) -> bool {
        digest.eq_ignore_ascii_case(self.sha256)
    }
}

/// Lower-case hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> Result<String, ModelError> {
    let io_err = |source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err)?;
    Ok(hex(hasher))
}

fn hex(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Writer that hashes everything passed through to `inner`, so a download
/// is verified without reading it back.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and return the inner writer with the hex digest.
    pub fn finish(mut self) -> io::Result<(W, String)> {
        self.inner.flush()?;
        Ok((self.inner, hex(self.hasher)))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Where models live: `/var/lib/presence/models` for root, otherwise
/// under the user's data home.
pub fn default_model_dir(is_root: bool) -> PathBuf {
    if is_root {
        PathBuf::from("/var/lib/presence/models")
    } else {
        data_home().join("presence/models")
    }
}

/// `$XDG_DATA_HOME`, or `$HOME/.local/share`.
pub fn data_home() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/share")
}
