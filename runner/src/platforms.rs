//! Batch platforms jobs are submitted to.
//!
//! A platform only knows about submissions: it receives rendered scripts, hands
//! out ids, reports the state of ids it was given and tells whether a job left its
//! completion marker behind. Everything about jobs and packages stays with the run
//! loop.

pub mod local;
pub mod slurm;

use crate::{
    config::{ExperimentPaths, PlatformConfig, PlatformKind},
    job::Wallclock,
};
use std::{
    collections::HashMap,
    fmt::Debug,
    io::{Read, Write},
    path::Path,
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("{command} failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Unexpected output of {command}: {output:?}")]
    Output { command: String, output: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Platform {platform} does not support {operation}")]
    Unsupported {
        platform: String,
        operation: &'static str,
    },
}

/// Limits the packager works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub max_processors: u32,
    pub max_waiting_jobs: usize,
    pub total_jobs: usize,
    pub max_wallclock: Wallclock,
    pub allows_wrapping: bool,
    pub allows_hold: bool,
}

/// State of a submission as the platform sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Queuing,
    Running,
    Held,
    /// ended successfully from the scheduler's point of view
    Completed,
    Failed,
    /// the platform no longer knows the id
    Vanished,
}

impl RemoteStatus {
    /// The submission will not run again, completion markers decide the outcome
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Vanished)
    }
}

/// A rendered package ready to be handed to a platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub name: String,
    /// body without shebang, the platform adds its own header
    pub script: String,
    pub hold: bool,
    pub wallclock: Wallclock,
    pub processors: u32,
    pub nodes: u32,
    /// megabytes
    pub memory: Option<u64>,
    pub queue: Option<String>,
}

/// Submission ids mapped to their state. Ids the platform did not report are absent.
pub type StatusReport = HashMap<String, RemoteStatus>;

/// Calls are made from the platform worker pool, one platform per thread at a time
pub trait Platform: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Directory on the platform holding scripts, logs and completion markers
    fn remote_dir(&self) -> &Path;

    /// Returns the submission id
    fn submit(&self, submission: &Submission) -> Result<String, PlatformError>;

    /// One call for every id of the platform
    fn check_status(&self, ids: &[String]) -> Result<StatusReport, PlatformError>;

    fn cancel(&self, ids: &[String]) -> Result<(), PlatformError>;

    /// Let a held submission start
    fn release(&self, id: &str) -> Result<(), PlatformError>;

    fn completion_marker(&self, job: &str) -> Result<bool, PlatformError>;

    /// Copy the logs of `job` into `destination`, returns the number of files copied
    fn fetch_logs(&self, job: &str, destination: &Path) -> Result<usize, PlatformError>;

    /// Drop and re-establish whatever connection the platform keeps
    fn reset_connection(&self) -> Result<(), PlatformError>;
}

/// Instantiate the configured back-end of platform `name`
pub fn load(
    name: &str,
    config: &PlatformConfig,
    paths: &ExperimentPaths,
) -> Result<Box<dyn Platform>, PlatformError> {
    debug!(platform = %name, kind = ?config.kind, "Loading platform");

    Ok(match config.kind {
        PlatformKind::Local => Box::new(local::LocalPlatform::load(name, config, paths)?),
        PlatformKind::Slurm => Box::new(slurm::SlurmPlatform::load(name, config, paths)?),
    })
}

/// Output of a command run through `run_command`
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, optionally feeding `stdin`, and kill it once `timeout`
/// passed. `prefix` is prepended verbatim, e.g. `ssh login1`.
pub(crate) fn run_command(
    prefix: &[String],
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, PlatformError> {
    let mut line: Vec<&str> = prefix.iter().map(String::as_str).collect();
    line.push(program);
    line.extend(args.iter().map(String::as_str));
    let rendered = line.join(" ");

    let spawn_error = |source| PlatformError::Spawn {
        command: rendered.clone(),
        source,
    };

    trace!(command = %rendered, "Running platform command");

    let mut child = Command::new(line[0])
        .args(&line[1..])
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;

    // drained on their own threads so a chatty command cannot fill the pipe and stall
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).map_err(spawn_error)?;
    }

    let status = match child.wait_timeout(timeout).map_err(spawn_error)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();

            return Err(PlatformError::Timeout {
                command: rendered,
                timeout,
            });
        }
    };

    let collect = |reader: Option<thread::JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };

    Ok(CommandOutput {
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        let _ = pipe.read_to_string(&mut buffer);
        buffer
    })
}

/// `run_command`, turning a non-zero exit into an error
pub(crate) fn run_checked(
    prefix: &[String],
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<String, PlatformError> {
    let output = run_command(prefix, program, args, stdin, timeout)?;

    if output.success {
        Ok(output.stdout)
    } else {
        Err(PlatformError::Command {
            command: format!("{program} {}", args.join(" ")),
            status: "non-zero exit status".to_owned(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_capture_output() {
        let output = run_checked(&[], "echo", &["hello".into()], None, Duration::from_secs(5)).unwrap();
        assert_eq!(output, "hello\n");

        let output = run_checked(&[], "cat", &[], Some(b"piped"), Duration::from_secs(5)).unwrap();
        assert_eq!(output, "piped");
    }

    #[test]
    fn failing_commands_are_errors() {
        let error = run_checked(&[], "false", &[], None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(error, PlatformError::Command { .. }));

        let error = run_checked(&[], "sleep", &["5".into()], None, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(error, PlatformError::Timeout { .. }));
    }

    #[test]
    fn prefix_is_prepended() {
        let output = run_checked(
            &["env".to_string()],
            "echo",
            &["through".into(), "prefix".into()],
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(output, "through prefix\n");
    }
}
