use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Error type shared by every operation in the crate.
///
/// Variants map one-to-one onto the failure classes callers are expected to
/// branch on: bad inputs, name/port collisions, external tool failures,
/// deadline expiry, filesystem trouble, cancellation, and lookups that came
/// up empty.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Collision(String),

    #[error("{bin} {args:?} failed with {status}:\n{output}")]
    Tool {
        bin: String,
        args: Vec<String>,
        status: ExitStatus,
        output: String,
    },

    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: String,
        timeout: Duration,
        last_error: Option<String>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }

    pub(crate) fn collision(message: impl Into<String>) -> Self {
        Error::Collision(message.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Appends the emulator log path to a timeout's description so the
    /// on-disk log survives into the failure report.
    pub(crate) fn with_log_hint(self, log_path: &Path) -> Self {
        match self {
            Error::Timeout {
                what,
                timeout,
                last_error,
            } => Error::Timeout {
                what: format!("{what}; emulator log: {}", log_path.display()),
                timeout,
                last_error,
            },
            other => other,
        }
    }
}

pub(crate) trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: context(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_the_wait() {
        let err = Error::Timeout {
            what: "device emulator-5580 to appear in the adb listing".to_string(),
            timeout: Duration::from_secs(60),
            last_error: None,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("emulator-5580"), "got: {rendered}");
        assert!(rendered.contains("60s"), "got: {rendered}");
    }

    #[test]
    fn io_context_preserves_source() {
        let result: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = result
            .io_context(|| "opening config".to_string())
            .unwrap_err();
        assert!(err.to_string().starts_with("opening config"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn log_hint_only_touches_timeouts() {
        let err = Error::precondition("empty AVD name")
            .with_log_hint(Path::new("/tmp/emulator-x-5580.log"));
        assert!(!err.to_string().contains("emulator log"));

        let err = Error::Timeout {
            what: "boot".to_string(),
            timeout: Duration::from_secs(1),
            last_error: None,
        }
        .with_log_hint(Path::new("/tmp/emulator-x-5580.log"));
        assert!(err.to_string().contains("/tmp/emulator-x-5580.log"));
    }
}
