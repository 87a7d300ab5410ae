//! Synchronous external-command execution.
//!
//! The core drives the host exclusively through CLI tools (`ip`, `bridge`,
//! `ovs-vsctl`, the routing daemon's control tool) rather than netlink
//! sockets. [`CommandRunner`] is the seam: production code uses
//! [`SystemRunner`], tests use [`RecordingRunner`].

use std::process::Command as StdCommand;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command failed: {args:?} (exit {exit:?}): {stderr}")]
    CommandFailed {
        args: Vec<String>,
        exit: Option<i32>,
        stderr: String,
    },
    #[error("malformed command output for {args:?}: {source}")]
    CommandOutputMalformed {
        args: Vec<String>,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error running {args:?}: {source}")]
    Io {
        args: Vec<String>,
        #[source]
        source: std::io::Error,
    },
}

/// Options for a single invocation.
#[derive(Clone, Debug, Default)]
pub struct RunOpts {
    /// Fail with [`Error::CommandFailed`] on non-zero exit. Defaults to true.
    pub check: bool,
    /// Capture and return stdout.
    pub capture: bool,
}

impl RunOpts {
    pub fn checked() -> Self {
        RunOpts {
            check: true,
            capture: false,
        }
    }

    pub fn capture() -> Self {
        RunOpts {
            check: true,
            capture: true,
        }
    }
}

/// Abstraction over "run this external program", so managers can be tested
/// without a real kernel/daemon underneath them.
pub trait CommandRunner {
    /// Runs `args[0] args[1..]`. Returns captured stdout when `opts.capture`
    /// is set, `None` otherwise.
    fn run(&self, args: &[&str], opts: RunOpts) -> Result<Option<String>, Error>;

    /// Runs the command and parses stdout as JSON.
    fn run_json(&self, args: &[&str]) -> Result<serde_json::Value, Error> {
        let stdout = self.run(args, RunOpts::capture())?.unwrap_or_default();
        serde_json::from_str(&stdout).map_err(|source| Error::CommandOutputMalformed {
            args: args.iter().map(|s| s.to_string()).collect(),
            source,
        })
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, args: &[&str], opts: RunOpts) -> Result<Option<String>, Error> {
        (**self).run(args, opts)
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for std::rc::Rc<T> {
    fn run(&self, args: &[&str], opts: RunOpts) -> Result<Option<String>, Error> {
        (**self).run(args, opts)
    }
}

/// Production [`CommandRunner`] backed by `std::process::Command`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, args: &[&str], opts: RunOpts) -> Result<Option<String>, Error> {
        let owned_args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        tracing::debug!(args = ?owned_args, "executing command");

        let (program, rest) = args.split_first().expect("run() called with empty args");
        let output = StdCommand::new(program)
            .args(rest)
            .output()
            .map_err(|source| Error::Io {
                args: owned_args.clone(),
                source,
            })?;

        if opts.check && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::CommandFailed {
                args: owned_args,
                exit: output.status.code(),
                stderr,
            });
        }

        if opts.capture {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }
}

/// Test double that records every invocation and returns a scripted response
/// for the next call.
#[cfg(any(test, feature = "test-util"))]
pub mod mocks {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct Invocation {
        pub args: Vec<String>,
    }

    #[derive(Default)]
    pub struct RecordingRunner {
        invocations: RefCell<Vec<Invocation>>,
        responses: RefCell<VecDeque<String>>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a canned stdout response for the next `capture`d call.
        pub fn push_response(&self, json: impl Into<String>) {
            self.responses.borrow_mut().push_back(json.into());
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.invocations.borrow().clone()
        }

        pub fn calls_matching(&self, prefix: &[&str]) -> Vec<Invocation> {
            self.invocations
                .borrow()
                .iter()
                .filter(|inv| inv.args.len() >= prefix.len() && inv.args[..prefix.len()] == *prefix)
                .cloned()
                .collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, args: &[&str], opts: RunOpts) -> Result<Option<String>, Error> {
            self.invocations.borrow_mut().push(Invocation {
                args: args.iter().map(|s| s.to_string()).collect(),
            });
            if opts.capture {
                let resp = self.responses.borrow_mut().pop_front().unwrap_or_else(|| "[]".to_string());
                Ok(Some(resp))
            } else {
                Ok(None)
            }
        }
    }
}
