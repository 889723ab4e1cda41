use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use once_cell::sync::Lazy;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `<hostname>:<pid>`, written into the lock file for whoever finds it taken
static OWNER: Lazy<String> = Lazy::new(|| {
    let hostname = match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname for the lock owner: {error}");
            "unknown".to_owned()
        }
    };

    format!("{hostname}:{}", std::process::id())
});

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Experiment is locked by {owner} ({path:?}), gave up after {timeout:?}")]
    Contended {
        path: PathBuf,
        owner: String,
        timeout: Duration,
    },
    #[error("Failed to lock {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to lock {path:?}: {errno}")]
    Flock { path: PathBuf, errno: Errno },
}

/// Exclusive `flock` on the experiment lock file, released on drop
#[derive(Debug)]
pub struct ExperimentLock {
    file: File,
    path: PathBuf,
}

impl ExperimentLock {
    /// Try to take the lock until `timeout` passed
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_error = |source| LockError::Io {
            path: path.to_owned(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(io_error)?;

        let start = Instant::now();

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(Errno::EWOULDBLOCK) | Err(Errno::EINTR) => {
                    if start.elapsed() >= timeout {
                        let owner = fs::read_to_string(path)
                            .map(|owner| owner.trim().to_owned())
                            .unwrap_or_default();
                        error!(code = "LOCK", path = ?path, owner = %owner, "Experiment is locked");

                        return Err(LockError::Contended {
                            path: path.to_owned(),
                            owner,
                            timeout,
                        });
                    }

                    thread::sleep(POLL_INTERVAL);
                }
                Err(errno) => {
                    return Err(LockError::Flock {
                        path: path.to_owned(),
                        errno,
                    })
                }
            }
        }

        file.set_len(0).map_err(io_error)?;
        writeln!(file, "{}", *OWNER).map_err(io_error)?;

        info!(path = ?path, owner = %*OWNER, "Acquired experiment lock");

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExperimentLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);

        match flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            Ok(()) => debug!(path = ?self.path, "Released experiment lock"),
            // closing the descriptor releases it anyway
            Err(errno) => warn!(path = ?self.path, errno = %errno, "Failed to release experiment lock"),
        }
    }
}
