use super::{Capabilities, Platform, PlatformError, RemoteStatus, StatusReport, Submission};
use crate::{
    config::{ExperimentPaths, PlatformConfig},
    script,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::FairMutex;
use std::{
    collections::HashMap,
    fs::{self, File},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// Grace period between SIGTERM and SIGKILL on cancel
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Runs packages as detached processes on the machine of the run loop
#[derive(Debug)]
pub struct LocalPlatform {
    name: String,
    capabilities: Capabilities,
    remote_dir: PathBuf,
    // children started by this process; after a restart only the pid is known
    children: FairMutex<HashMap<String, Child>>,
}

impl LocalPlatform {
    pub fn load(name: &str, config: &PlatformConfig, paths: &ExperimentPaths) -> Result<Self, PlatformError> {
        let remote_dir = config
            .parameter_str("scratch")
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.tmp().join(name));

        Self::new(name, config.capabilities(), remote_dir)
    }

    pub fn new(name: &str, capabilities: Capabilities, remote_dir: PathBuf) -> Result<Self, PlatformError> {
        fs::create_dir_all(&remote_dir)?;

        Ok(Self {
            name: name.to_owned(),
            capabilities,
            remote_dir,
            children: FairMutex::new(HashMap::new()),
        })
    }

    fn parse_pid(id: &str) -> Result<Pid, PlatformError> {
        id.parse::<i32>()
            .map(Pid::from_raw)
            .map_err(|_| PlatformError::Output {
                command: "local submission".to_owned(),
                output: id.to_owned(),
            })
    }
}

impl Platform for LocalPlatform {
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
        if submission.hold {
            return Err(PlatformError::Unsupported {
                platform: self.name.clone(),
                operation: "held submissions",
            });
        }

        let script = self.remote_dir.join(format!("{}.cmd", submission.name));
        fs::write(&script, format!("#!/bin/bash\n{}", submission.script))?;

        let stdout = File::create(self.remote_dir.join(format!("{}.out", submission.name)))?;
        let stderr = File::create(self.remote_dir.join(format!("{}.err", submission.name)))?;

        let child = Command::new("bash")
            .arg(&script)
            .current_dir(&self.remote_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // own process group, cancel signals the whole tree
            .process_group(0)
            .spawn()
            .map_err(|source| PlatformError::Spawn {
                command: format!("bash {script:?}"),
                source,
            })?;

        let id = child.id().to_string();
        info!(platform = %self.name, package = %submission.name, id = %id, "Started local package");
        self.children.lock().insert(id.clone(), child);

        Ok(id)
    }

    fn check_status(&self, ids: &[String]) -> Result<StatusReport, PlatformError> {
        let mut children = self.children.lock();
        let mut report = StatusReport::new();

        for id in ids {
            let status = match children.get_mut(id) {
                Some(child) => match child.try_wait()? {
                    Some(exit) => {
                        children.remove(id);

                        if exit.success() {
                            RemoteStatus::Completed
                        } else {
                            RemoteStatus::Failed
                        }
                    }
                    None => RemoteStatus::Running,
                },
                // started by an earlier run loop, all that is left is asking the kernel
                None => match kill(Self::parse_pid(id)?, None) {
                    Ok(()) => RemoteStatus::Running,
                    Err(_) => RemoteStatus::Vanished,
                },
            };

            trace!(platform = %self.name, id = %id, status = ?status, "Polled local package");
            report.insert(id.clone(), status);
        }

        Ok(report)
    }

    fn cancel(&self, ids: &[String]) -> Result<(), PlatformError> {
        let mut children = self.children.lock();

        for id in ids {
            let pid = Self::parse_pid(id)?;

            if let Err(error) = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGTERM) {
                debug!(id = %id, error = %error, "Package was not running anymore");
            }

            if let Some(mut child) = children.remove(id) {
                if child.wait_timeout(CANCEL_GRACE)?.is_none() {
                    warn!(id = %id, "Package ignored SIGTERM, killing it");
                    child.kill()?;
                    child.wait()?;
                }
            }
        }

        Ok(())
    }

    fn release(&self, _id: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported {
            platform: self.name.clone(),
            operation: "releasing held submissions",
        })
    }

    fn completion_marker(&self, job: &str) -> Result<bool, PlatformError> {
        Ok(self.remote_dir.join(script::marker_name(job)).exists())
    }

    fn fetch_logs(&self, job: &str, destination: &Path) -> Result<usize, PlatformError> {
        fs::create_dir_all(destination)?;
        let mut copied = 0;

        for extension in ["out", "err"] {
            let file = format!("{job}.{extension}");
            let source = self.remote_dir.join(&file);
            let target = destination.join(&file);

            if source.exists() && source != target {
                fs::copy(&source, &target)?;
                copied += 1;
            }
        }

        Ok(copied)
    }

    fn reset_connection(&self) -> Result<(), PlatformError> {
        trace!(platform = %self.name, "Local platform keeps no connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Wallclock;
    use std::{thread, time::Instant};

    fn platform(dir: &Path) -> LocalPlatform {
        let capabilities = Capabilities {
            max_processors: 4,
            max_waiting_jobs: 4,
            total_jobs: 4,
            max_wallclock: Wallclock(60),
            allows_wrapping: true,
            allows_hold: false,
        };

        LocalPlatform::new("local", capabilities, dir.join("remote")).unwrap()
    }

    fn submission(name: &str, script: &str) -> Submission {
        Submission {
            name: name.to_owned(),
            script: script.to_owned(),
            hold: false,
            wallclock: Wallclock(1),
            processors: 1,
            nodes: 0,
            memory: None,
            queue: None,
        }
    }

    fn wait_until_finished(platform: &LocalPlatform, id: &str) -> RemoteStatus {
        let start = Instant::now();

        loop {
            let status = platform.check_status(&[id.to_owned()]).unwrap()[id];
            if status.is_finished() || start.elapsed() > Duration::from_secs(10) {
                return status;
            }

            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn runs_packages_and_leaves_markers() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());

        let id = platform
            .submit(&submission("t000_INI", "echo hello\ntouch t000_INI_COMPLETED\n"))
            .unwrap();

        assert_eq!(wait_until_finished(&platform, &id), RemoteStatus::Completed);
        assert!(platform.completion_marker("t000_INI").unwrap());
        assert!(!platform.completion_marker("t000_SIM").unwrap());

        let logs = dir.path().join("logs");
        assert_eq!(platform.fetch_logs("t000_INI", &logs).unwrap(), 2);
        assert_eq!(fs::read_to_string(logs.join("t000_INI.out")).unwrap(), "hello\n");
    }

    #[test]
    fn reports_failures_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());

        let id = platform.submit(&submission("t000_SIM", "exit 3\n")).unwrap();
        assert_eq!(wait_until_finished(&platform, &id), RemoteStatus::Failed);

        // above the kernel's pid limit
        let report = platform.check_status(&["2147483646".to_owned()]).unwrap();
        assert_eq!(report["2147483646"], RemoteStatus::Vanished);
    }

    #[test]
    fn cancels_running_packages() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());

        let id = platform.submit(&submission("t000_LONG", "sleep 30\n")).unwrap();
        assert_eq!(
            platform.check_status(&[id.clone()]).unwrap()[&id],
            RemoteStatus::Running
        );

        platform.cancel(&[id.clone()]).unwrap();
        assert!(platform.check_status(&[id.clone()]).unwrap()[&id].is_finished());
    }

    #[test]
    fn refuses_held_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());

        let mut held = submission("t000_HELD", "true\n");
        held.hold = true;

        assert!(matches!(
            platform.submit(&held),
            Err(PlatformError::Unsupported { .. })
        ));
    }
}
