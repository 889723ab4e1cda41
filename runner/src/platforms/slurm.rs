use super::{run_checked, run_command, Capabilities, Platform, PlatformError, RemoteStatus, StatusReport, Submission};
use crate::{
    config::{ExperimentPaths, PlatformConfig},
    script,
};
use std::{
    fmt::Write,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Submits through `sbatch` and polls with `sacct`, either on this machine or
/// through `command_prefix` (e.g. `ssh login1`). Scripts, logs and markers live in
/// `scratch`, which must be visible to the compute nodes.
#[derive(Debug)]
pub struct SlurmPlatform {
    name: String,
    capabilities: Capabilities,
    remote_dir: PathBuf,
    prefix: Vec<String>,
    queue: Option<String>,
    timeout: Duration,
}

impl SlurmPlatform {
    pub fn load(name: &str, config: &PlatformConfig, paths: &ExperimentPaths) -> Result<Self, PlatformError> {
        let remote_dir = config
            .parameter_str("scratch")
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.tmp().join(name));

        let platform = Self {
            name: name.to_owned(),
            capabilities: config.capabilities(),
            remote_dir,
            prefix: config
                .parameter_str("command_prefix")
                .map(|prefix| prefix.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
            queue: config.queue.clone(),
            timeout: config
                .parameter_u64("timeout")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
        };

        platform.make_remote_dir()?;
        Ok(platform)
    }

    fn is_remote(&self) -> bool {
        !self.prefix.is_empty()
    }

    fn remote_path(&self, file: &str) -> String {
        self.remote_dir.join(file).to_string_lossy().into_owned()
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String, PlatformError> {
        run_checked(&self.prefix, program, args, None, self.timeout)
    }

    fn make_remote_dir(&self) -> Result<(), PlatformError> {
        if self.is_remote() {
            self.run("mkdir", &["-p".into(), self.remote_dir.to_string_lossy().into_owned()])?;
        } else {
            fs::create_dir_all(&self.remote_dir)?;
        }

        Ok(())
    }

    fn write_file(&self, file: &str, contents: &str) -> Result<(), PlatformError> {
        if self.is_remote() {
            run_checked(
                &self.prefix,
                "sh",
                &["-c".into(), format!("cat > '{}'", self.remote_path(file))],
                Some(contents.as_bytes()),
                self.timeout,
            )?;
        } else {
            fs::write(self.remote_dir.join(file), contents)?;
        }

        Ok(())
    }

    /// `#SBATCH` header for `submission`
    pub fn header(&self, submission: &Submission) -> String {
        let mut header = String::new();
        let wallclock = submission.wallclock.minutes();

        // writing to a String cannot fail
        let _ = writeln!(header, "#SBATCH --job-name={}", submission.name);
        let _ = writeln!(header, "#SBATCH --output={}", self.remote_path(&format!("{}.out", submission.name)));
        let _ = writeln!(header, "#SBATCH --error={}", self.remote_path(&format!("{}.err", submission.name)));
        let _ = writeln!(header, "#SBATCH --time={:02}:{:02}:00", wallclock / 60, wallclock % 60);
        let _ = writeln!(header, "#SBATCH --ntasks={}", submission.processors.max(1));

        if submission.nodes > 0 {
            let _ = writeln!(header, "#SBATCH --nodes={}", submission.nodes);
        }
        if let Some(memory) = submission.memory {
            let _ = writeln!(header, "#SBATCH --mem={memory}M");
        }
        if let Some(queue) = submission.queue.as_ref().or(self.queue.as_ref()) {
            let _ = writeln!(header, "#SBATCH --partition={queue}");
        }

        header
    }

    /// Map an `sacct` state to what the run loop needs to know
    pub fn parse_state(state: &str) -> Option<RemoteStatus> {
        // e.g. "CANCELLED by 1000"
        let state = state.split_whitespace().next()?;

        Some(match state {
            "PENDING" | "REQUEUED" | "CONFIGURING" | "RESIZING" | "SUSPENDED" => RemoteStatus::Queuing,
            "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => RemoteStatus::Running,
            "REQUEUE_HOLD" | "REQUEUE_FED" | "SPECIAL_EXIT" => RemoteStatus::Held,
            "COMPLETED" => RemoteStatus::Completed,
            "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
            | "BOOT_FAIL" | "DEADLINE" | "REVOKED" => RemoteStatus::Failed,
            _ => return None,
        })
    }

    /// Parse `sacct -n -X -P -o JobID,State` output. Every requested id gets an
    /// answer: ids sacct does not list have vanished and unknown states count as failed.
    pub fn parse_report(output: &str, ids: &[String]) -> StatusReport {
        let mut report: StatusReport = output
            .lines()
            .filter_map(|line| {
                let (id, state) = line.trim().split_once('|')?;

                let status = Self::parse_state(state).unwrap_or_else(|| {
                    warn!(id = %id, state = %state, "Unknown Slurm state, treating it as failed");
                    RemoteStatus::Failed
                });

                Some((id.to_owned(), status))
            })
            .collect();

        for id in ids {
            report.entry(id.clone()).or_insert_with(|| {
                debug!(id = %id, "Slurm does not list the job anymore");
                RemoteStatus::Vanished
            });
        }

        report
    }
}

impl Platform for SlurmPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn remote_dir(&self) -> &Path {
        &self.remote_dir
    }

    #[instrument(skip(self, submission), fields(platform = %self.name, package = %submission.name), level = "debug")]
    fn submit(&self, submission: &Submission) -> Result<String, PlatformError> {
        let file = format!("{}.cmd", submission.name);
        self.write_file(
            &file,
            &format!("#!/bin/bash\n{}\n{}", self.header(submission), submission.script),
        )?;

        let mut args = vec!["--parsable".to_owned()];
        if submission.hold {
            args.push("--hold".to_owned());
        }
        args.push(self.remote_path(&file));

        let output = self.run("sbatch", &args)?;

        // "<id>" or "<id>;<cluster>"
        let id = output
            .lines()
            .next()
            .and_then(|line| line.split(';').next())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| PlatformError::Output {
                command: "sbatch".to_owned(),
                output: output.clone(),
            })?;

        info!(platform = %self.name, package = %submission.name, id = %id, hold = submission.hold, "Submitted to Slurm");

        Ok(id.to_owned())
    }

    fn check_status(&self, ids: &[String]) -> Result<StatusReport, PlatformError> {
        if ids.is_empty() {
            return Ok(StatusReport::new());
        }

        let output = self.run(
            "sacct",
            &[
                "-n".into(),
                "-X".into(),
                "-P".into(),
                "-o".into(),
                "JobID,State".into(),
                "-j".into(),
                ids.join(","),
            ],
        )?;

        Ok(Self::parse_report(&output, ids))
    }

    fn cancel(&self, ids: &[String]) -> Result<(), PlatformError> {
        if !ids.is_empty() {
            self.run("scancel", ids)?;
        }

        Ok(())
    }

    fn release(&self, id: &str) -> Result<(), PlatformError> {
        self.run("scontrol", &["release".into(), id.to_owned()])?;
        debug!(platform = %self.name, id = %id, "Released held submission");

        Ok(())
    }

    fn completion_marker(&self, job: &str) -> Result<bool, PlatformError> {
        let marker = script::marker_name(job);

        if self.is_remote() {
            let output = run_command(&self.prefix, "test", &["-e".into(), self.remote_path(&marker)], None, self.timeout)?;
            Ok(output.success)
        } else {
            Ok(self.remote_dir.join(marker).exists())
        }
    }

    fn fetch_logs(&self, job: &str, destination: &Path) -> Result<usize, PlatformError> {
        fs::create_dir_all(destination)?;
        let mut copied = 0;

        for extension in ["out", "err"] {
            let file = format!("{job}.{extension}");
            let target = destination.join(&file);

            if self.is_remote() {
                let output = run_command(&self.prefix, "cat", &[self.remote_path(&file)], None, self.timeout)?;
                if output.success {
                    fs::write(&target, output.stdout)?;
                    copied += 1;
                }
            } else {
                let source = self.remote_dir.join(&file);
                if source.exists() && source != target {
                    fs::copy(&source, &target)?;
                    copied += 1;
                }
            }
        }

        Ok(copied)
    }

    fn reset_connection(&self) -> Result<(), PlatformError> {
        if self.is_remote() {
            self.run("true", &[])?;
            debug!(platform = %self.name, "Connection answered again");
        }

        Ok(())
    }
}
