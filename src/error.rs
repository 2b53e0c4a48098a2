//! Error taxonomy shared by every module of the crate.
//!
//! Each variant maps to one failure class:
//! - [`Error::Configuration`] - malformed or missing host / kernel-config input
//! - [`Error::RunningEnvironment`] - a required tool or directory is absent
//! - [`Error::InitramfsInstall`] - an initramfs build precondition is not met
//! - [`Error::Command`] - an external process failed
//!
//! None of them is retried.

use std::io;

/// Core error type for boot-builder.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("running environment error: {0}")]
    RunningEnvironment(String),

    #[error("initramfs install error: {0}")]
    InitramfsInstall(String),

    #[error("{program} failed ({status}): {message}\n{output}")]
    Command {
        program: String,
        status: String,
        message: String,
        output: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn environment(msg: impl Into<String>) -> Self {
        Error::RunningEnvironment(msg.into())
    }

    pub fn initramfs(msg: impl Into<String>) -> Self {
        Error::InitramfsInstall(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io {
            context: "I/O failure".to_string(),
            source,
        }
    }
}

/// Attach a human readable context to an `io::Result`.
pub trait IoResultExt<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Io {
            context: f().into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_context_is_rendered() {
        let res: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = res.with_context(|| "reading /boot/grub/grub.cfg").unwrap_err();
        assert_eq!(err.to_string(), "reading /boot/grub/grub.cfg: gone");
    }

    #[test]
    fn taxonomy_messages() {
        assert_eq!(
            Error::config("CONFIG_FAT_DEFAULT_CODEPAGE is missing").to_string(),
            "configuration error: CONFIG_FAT_DEFAULT_CODEPAGE is missing"
        );
        assert!(matches!(
            Error::environment("no /boot"),
            Error::RunningEnvironment(_)
        ));
    }
}
