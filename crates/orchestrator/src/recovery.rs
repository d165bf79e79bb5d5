//! Bounded recovery between attempts.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Stack;
use crate::error::{Error, Result};
use crate::report::RunAttempt;

/// What happens after a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryDecision {
    /// Persisted state was destroyed; start another attempt.
    Retry,

    /// Every allowed attempt was used.
    Exhausted,
}

/// Counts attempts and destroys the persisted state of failing services.
#[derive(Debug)]
pub struct RecoveryController {
    max_attempts: u32,
    attempts: u32,
    work_dir: PathBuf,
}

impl RecoveryController {
    /// Creates a controller allowing `max_attempts` attempts.
    ///
    /// # Errors
    ///
    /// Returns `Error::ZeroAttempts` if `max_attempts` is zero.
    pub fn new(max_attempts: u32, work_dir: impl Into<PathBuf>) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::ZeroAttempts);
        }

        Ok(Self {
            max_attempts,
            attempts: 0,
            work_dir: work_dir.into(),
        })
    }

    /// Consumes one attempt and returns its 1-based index.
    pub const fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Returns the number of attempts consumed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decides what follows a failed attempt.
    ///
    /// When another attempt is allowed, the persisted state of every implicated
    /// service is destroyed first. Services must already be stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be removed.
    pub async fn recover(&mut self, attempt: &RunAttempt, stack: &Stack) -> Result<RecoveryDecision> {
        if self.attempts >= self.max_attempts {
            warn!(
                attempt = attempt.index,
                "no attempts left after {} of {}", self.attempts, self.max_attempts
            );
            return Ok(RecoveryDecision::Exhausted);
        }

        for name in attempt.implicated() {
            let Some(service) = stack.service(name) else {
                continue;
            };

            for path in service.persisted_paths(&self.work_dir) {
                if destroy(&path).await? {
                    info!(service = %name, "destroyed persisted state {}", path.display());
                }
            }
        }

        info!(
            attempt = attempt.index,
            "retrying ({} of {} attempts used)", self.attempts, self.max_attempts
        );

        Ok(RecoveryDecision::Retry)
    }
}

/// Removes a file or directory tree. Returns false if nothing was there.
async fn destroy(path: &Path) -> Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::Io("failed to inspect persisted state", e)),
    };

    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io("failed to destroy persisted state", e)),
    }
}
