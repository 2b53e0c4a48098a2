//! Synchronous external process execution.
//!
//! Every external tool is run through [`Cmd`], which captures stdout and
//! stderr and maps the exit status into a [`CmdResult`]. Nothing is
//! streamed or run in the background.
//!
//! # Example
//!
//! ```rust,ignore
//! use boot_builder::process::Cmd;
//!
//! let result = Cmd::new("ldd")
//!     .arg("--")
//!     .arg_path(binary)
//!     .allow_fail()
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// Delay applied after a child is observed to have been killed by a signal.
///
/// When the whole process group receives SIGINT/SIGTERM the child usually
/// dies first. Sleeping here gives our own signal handling the chance to
/// run before the failure is reported as an application error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub delay: Duration,
}

impl SettlePolicy {
    pub const DEFAULT: SettlePolicy = SettlePolicy {
        delay: Duration::from_secs(1),
    };

    pub const NONE: SettlePolicy = SettlePolicy {
        delay: Duration::ZERO,
    };

    fn settle(&self, result: &CmdResult) {
        if result.terminated_by_signal() && !self.delay.is_zero() {
            debug!(delay = ?self.delay, "child terminated by signal, settling");
            std::thread::sleep(self.delay);
        }
    }
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Captured outcome of a finished process.
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit codes above 128 are how shells report a signalled child.
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some() || self.code.is_some_and(|c| c > 128)
    }

    fn status_description(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("signal {}", sig),
            (None, None) => "unknown status".to_string(),
        }
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Builder for a single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
    settle: SettlePolicy,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            dir: None,
            error_msg: None,
            allow_fail: false,
            settle: SettlePolicy::default(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Run the command with `dir` as working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    /// Message used when the command fails (e.g. an install hint).
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn settle_policy(mut self, policy: SettlePolicy) -> Self {
        self.settle = policy;
        self
    }

    fn display_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    pub fn run(self) -> Result<CmdResult> {
        let name = self.display_name();
        debug!(
            "running {} {}",
            name,
            self.args
                .iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .with_context(|| format!("failed to execute {}", name))?;

        let result = CmdResult {
            code: output.status.code(),
            signal: output.status.signal(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        self.settle.settle(&result);

        if !result.success() && !self.allow_fail {
            let message = self
                .error_msg
                .clone()
                .unwrap_or_else(|| "command returned failure".to_string());
            warn!("{} failed: {}", name, message);
            return Err(Error::Command {
                program: name,
                status: result.status_description(),
                message,
                output: result.combined_output(),
            });
        }

        Ok(result)
    }

    /// Run and report only whether the command exited successfully.
    pub fn test_success(self) -> bool {
        self.allow_fail().run().map(|r| r.success()).unwrap_or(false)
    }
}

/// Run a command line through `/bin/sh -c`.
pub fn shell(cmd: &str) -> Result<CmdResult> {
    Cmd::new("/bin/sh").arg("-c").arg(cmd).run()
}
