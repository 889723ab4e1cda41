use super::*;
use crate::{
    builder,
    config::ExperimentConfig,
    job::Wallclock,
    platforms::{Capabilities, StatusReport},
};
use parking_lot::FairMutex;
use std::{path::Path, sync::Arc};
use tempfile::TempDir;

/// What the scripted platform does with the submissions it receives
#[derive(Debug, Default)]
struct State {
    next_id: u32,
    submissions: Vec<(String, Submission, Vec<String>)>,
    pending: HashMap<String, Vec<String>>,
    held: HashSet<String>,
    released: Vec<String>,
    cancelled: Vec<String>,
    markers: HashSet<String>,
    // job -> runs that fail before it succeeds
    failures: HashMap<String, u32>,
    // job -> polls reporting RUNNING before it finishes
    slow: HashMap<String, u32>,
    unreachable_polls: u32,
    rejections: u32,
    // answer polls with an empty report
    mute: bool,
}

/// In-memory platform: every submission finishes on its first poll unless told otherwise
#[derive(Debug)]
struct ScriptedPlatform {
    dir: PathBuf,
    state: Arc<FairMutex<State>>,
}

/// Job names in the order the wrapper script runs them
fn jobs_of(script: &str) -> Vec<String> {
    script
        .lines()
        .filter_map(|line| line.trim().strip_prefix("run_job "))
        .filter_map(|call| call.split_whitespace().nth(1))
        .map(str::to_owned)
        .collect()
}

impl Platform for ScriptedPlatform {
    fn name(&self) -> &str {
        "hpc"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_processors: 1024,
            max_waiting_jobs: 20,
            total_jobs: 20,
            max_wallclock: Wallclock(48 * 60),
            allows_wrapping: true,
            allows_hold: true,
        }
    }

    fn remote_dir(&self) -> &Path {
        &self.dir
    }

    fn submit(&self, submission: &Submission) -> Result<String, PlatformError> {
        let mut state = self.state.lock();

        if state.rejections > 0 {
            state.rejections -= 1;
            return Err(PlatformError::Command {
                command: "sbatch".into(),
                status: "exit status: 1".into(),
                stderr: "queue is full".into(),
            });
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        let jobs = jobs_of(&submission.script);

        if submission.hold {
            state.held.insert(id.clone());
        }
        state.pending.insert(id.clone(), jobs.clone());
        state.submissions.push((id.clone(), submission.clone(), jobs));

        Ok(id)
    }

    fn check_status(&self, ids: &[String]) -> Result<StatusReport, PlatformError> {
        let mut state = self.state.lock();

        if state.unreachable_polls > 0 {
            state.unreachable_polls -= 1;
            return Err(PlatformError::Timeout {
                command: "sacct".into(),
                timeout: Duration::from_secs(60),
            });
        }

        let mut report = StatusReport::new();
        if state.mute {
            return Ok(report);
        }

        for id in ids {
            if state.held.contains(id) {
                report.insert(id.clone(), RemoteStatus::Held);
                continue;
            }

            let Some(jobs) = state.pending.get(id).cloned() else {
                report.insert(id.clone(), RemoteStatus::Vanished);
                continue;
            };

            let slow = jobs.iter().find(|job| state.slow.get(*job).copied().unwrap_or_default() > 0);
            if let Some(job) = slow.cloned() {
                if let Some(polls) = state.slow.get_mut(&job) {
                    *polls -= 1;
                }
                report.insert(id.clone(), RemoteStatus::Running);
                continue;
            }

            state.pending.remove(id);
            let mut status = RemoteStatus::Completed;

            // jobs run in script order, the first failure ends the package
            for job in jobs {
                match state.failures.get_mut(&job) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        status = RemoteStatus::Failed;
                        break;
                    }
                    _ => {
                        state.markers.insert(job);
                    }
                }
            }

            report.insert(id.clone(), status);
        }

        Ok(report)
    }

    fn cancel(&self, ids: &[String]) -> Result<(), PlatformError> {
        let mut state = self.state.lock();

        for id in ids {
            state.held.remove(id);
            state.pending.remove(id);
            state.cancelled.push(id.clone());
        }

        Ok(())
    }

    fn release(&self, id: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        state.held.remove(id);
        state.released.push(id.to_owned());

        Ok(())
    }

    fn completion_marker(&self, job: &str) -> Result<bool, PlatformError> {
        Ok(self.state.lock().markers.contains(job))
    }

    fn fetch_logs(&self, _job: &str, _destination: &Path) -> Result<usize, PlatformError> {
        Ok(0)
    }

    fn reset_connection(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

fn experiment(platform: &str, sim: &str, tail: &str) -> String {
    format!(
        r#"
experiment:
  id: t000
  start_dates: ["20000101"]
  members: [fc0]
  num_chunks: 3
runner:
  sleep: 0
  max_platform_failures: 3
platforms:
  hpc:
    kind: slurm
{platform}
jobs:
  INI:
    running: member
    script: "true"
  SIM:
    running: chunk
    dependencies: INI SIM-1
    script: "true"
{sim}
{tail}
"#
    )
}

const INI: &str = "t000_20000101_fc0_INI";
const SIM_1: &str = "t000_20000101_fc0_1_SIM";
const SIM_2: &str = "t000_20000101_fc0_2_SIM";
const SIM_3: &str = "t000_20000101_fc0_3_SIM";
const INI_FC1: &str = "t000_20000101_fc1_INI";

struct Harness {
    _dir: TempDir,
    paths: ExperimentPaths,
    config: ExperimentConfig,
    state: Arc<FairMutex<State>>,
}

impl Harness {
    fn new(raw: &str, state: State) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = ExperimentPaths::new(dir.path(), "t000");
        paths.create_dirs().unwrap();
        let config = ExperimentConfig::parse(raw, paths.root.clone()).unwrap();

        Self {
            _dir: dir,
            paths,
            config,
            state: Arc::new(FairMutex::new(state)),
        }
    }

    fn graph(&self) -> JobGraph {
        builder::build(&self.config).unwrap()
    }

    fn engine(&self, graph: JobGraph) -> Engine {
        let storage = StorageAdapters::load(&self.config.runner.storage, &self.paths).unwrap();
        let platform = ScriptedPlatform {
            dir: self.paths.tmp().join("hpc"),
            state: self.state.clone(),
        };
        let platforms = BTreeMap::from([("hpc".to_owned(), Box::new(platform) as Box<dyn Platform>)]);

        Engine::new(self.paths.clone(), self.config.clone(), graph, storage, platforms).unwrap()
    }

    fn status(engine: &Engine, name: &str) -> JobStatus {
        engine.graph().get(name).unwrap().status()
    }
}

#[test]
fn chain_runs_to_completion_and_is_saved() {
    let harness = Harness::new(&experiment("", "", ""), State::default());
    let mut engine = harness.engine(harness.graph());

    let outcome = engine.run().unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(outcome.exit_status(), 0);

    let graph = engine.close().unwrap();
    assert_eq!(graph.count(JobStatus::Completed), 4);

    let state = harness.state.lock();
    let order = state.submissions.iter().map(|(_, _, jobs)| jobs.concat()).collect_vec();
    assert_eq!(order, vec![INI, SIM_1, SIM_2, SIM_3]);

    let storage = StorageAdapters::load(&harness.config.runner.storage, &harness.paths).unwrap();
    assert_eq!(storage.load_graph().unwrap(), graph);
}

#[test]
fn failed_job_is_retried() {
    let harness = Harness::new(
        &experiment("", "    retrials: 1", ""),
        State {
            failures: HashMap::from([(SIM_2.to_owned(), 1)]),
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    assert_eq!(engine.run().unwrap(), RunOutcome::Completed);

    let sim = engine.graph().get(SIM_2).unwrap();
    assert_eq!(sim.fail_count, 1);
    assert_eq!(sim.retrials, 0);
    assert_eq!(
        harness
            .state
            .lock()
            .submissions
            .iter()
            .filter(|(_, submission, _)| submission.name == SIM_2)
            .count(),
        2
    );
}

#[test]
fn exhausted_retrials_fail_the_run() {
    let harness = Harness::new(
        &experiment("", "    retrials: 1", ""),
        State {
            failures: HashMap::from([(SIM_1.to_owned(), 5)]),
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    let outcome = engine.run().unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Failed {
            jobs: vec![SIM_1.to_owned()]
        }
    );
    assert_eq!(outcome.exit_status(), 1);

    // retrials = 1 means two runs in total
    assert_eq!(engine.graph().get(SIM_1).unwrap().fail_count, 2);
    assert_eq!(Harness::status(&engine, SIM_2), JobStatus::Waiting);
    assert_eq!(Harness::status(&engine, INI), JobStatus::Completed);
}

#[test]
fn unreachable_platform_marks_jobs_unknown() {
    let harness = Harness::new(
        &experiment("", "", ""),
        State {
            unreachable_polls: 1,
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    assert_eq!(engine.iterate().unwrap().submitted, 1);
    assert_eq!(Harness::status(&engine, INI), JobStatus::Submitted);

    engine.iterate().unwrap();
    assert_eq!(Harness::status(&engine, INI), JobStatus::Unknown);

    // reachable again, the marker settles it
    engine.iterate().unwrap();
    assert_eq!(Harness::status(&engine, INI), JobStatus::Completed);
    assert_eq!(Harness::status(&engine, SIM_1), JobStatus::Submitted);
}

#[test]
fn persistent_communication_failures_are_fatal() {
    let harness = Harness::new(
        &experiment("", "", ""),
        State {
            unreachable_polls: 100,
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    let error = engine.run().unwrap_err();

    assert!(matches!(error, EngineError::Unreachable { failures: 3, .. }));
    assert_eq!(error.code(), "PLATFORM_UNREACHABLE");
    assert_eq!(error.exit_status(), 2);
}

#[test]
fn rejected_package_stays_ready() {
    let harness = Harness::new(
        &experiment("", "", ""),
        State {
            rejections: 1,
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    let iteration = engine.iterate().unwrap();
    assert_eq!(iteration.rejected, 1);
    assert_eq!(iteration.submitted, 0);

    let ini = engine.graph().get(INI).unwrap();
    assert_eq!(ini.status(), JobStatus::Ready);
    assert!(!ini.packed);
    assert!(ini.id.is_none());

    assert_eq!(engine.iterate().unwrap().submitted, 1);
    assert_eq!(Harness::status(&engine, INI), JobStatus::Submitted);
}

#[test]
fn vertical_wrapper_is_one_submission() {
    let wrappers = r#"wrappers:
  sims:
    type: vertical
    jobs_in_wrapper: ["SIM"]"#;
    let harness = Harness::new(&experiment("", "", wrappers), State::default());
    let mut engine = harness.engine(harness.graph());

    // INI goes out alone, completes, then the chain is wrapped
    engine.iterate().unwrap();
    engine.iterate().unwrap();

    for name in [SIM_1, SIM_2, SIM_3] {
        assert_eq!(Harness::status(&engine, name), JobStatus::Submitted);
    }

    let storage = StorageAdapters::load(&harness.config.runner.storage, &harness.paths).unwrap();
    let records = storage.load_packages().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].jobs, vec![SIM_1, SIM_2, SIM_3]);

    assert_eq!(engine.run().unwrap(), RunOutcome::Completed);
    assert_eq!(harness.state.lock().submissions.len(), 2);

    // finished wrappers leave the index at the next checkpoint
    assert!(storage.load_packages().unwrap().is_empty());
}

#[test]
fn strict_wrapper_deadlock_is_fatal() {
    let wrappers = r#"wrappers:
  sims:
    type: vertical
    policy: strict
    min_wrapped: 5
    jobs_in_wrapper: ["SIM"]"#;
    let harness = Harness::new(&experiment("", "", wrappers), State::default());
    let mut engine = harness.engine(harness.graph());

    let error = engine.run().unwrap_err();

    assert_eq!(error.code(), "DEADLOCK");
    assert!(matches!(
        error,
        EngineError::Deadlock(PackagingError::Deadlock { ref wrapper, .. }) if wrapper == "sims"
    ));
}

#[test]
fn flexible_wrapper_deadlock_submits_jobs_alone() {
    let wrappers = r#"wrappers:
  sims:
    type: vertical
    min_wrapped: 5
    jobs_in_wrapper: ["SIM"]"#;
    let harness = Harness::new(&experiment("", "", wrappers), State::default());
    let mut engine = harness.engine(harness.graph());

    assert_eq!(engine.run().unwrap(), RunOutcome::Completed);
    assert_eq!(harness.state.lock().submissions.len(), 4);
}

#[test]
fn hold_mode_submits_ahead_and_releases() {
    let harness = Harness::new(
        &experiment("    allows_hold: true", "", ""),
        State {
            slow: HashMap::from([(INI.to_owned(), 1)]),
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    engine.iterate().unwrap();
    engine.iterate().unwrap();

    // INI still running, its child went out held
    assert_eq!(Harness::status(&engine, INI), JobStatus::Running);
    assert_eq!(Harness::status(&engine, SIM_1), JobStatus::Held);

    engine.iterate().unwrap();
    assert_eq!(Harness::status(&engine, INI), JobStatus::Completed);
    assert_eq!(Harness::status(&engine, SIM_1), JobStatus::Queuing);

    assert_eq!(engine.run().unwrap(), RunOutcome::Completed);

    let state = harness.state.lock();
    let held = state
        .submissions
        .iter()
        .filter(|(_, submission, _)| submission.hold)
        .count();
    assert_eq!(held, 3);
    assert_eq!(state.released.len(), 3);
}

#[test]
fn held_children_of_failed_jobs_are_cancelled() {
    let harness = Harness::new(
        &experiment("    allows_hold: true", "", ""),
        State {
            slow: HashMap::from([(INI.to_owned(), 1)]),
            failures: HashMap::from([(INI.to_owned(), 1)]),
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    let outcome = engine.run().unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Failed {
            jobs: vec![INI.to_owned()]
        }
    );
    assert_eq!(harness.state.lock().cancelled, vec!["2".to_owned()]);

    let sim = engine.graph().get(SIM_1).unwrap();
    assert_eq!(sim.status(), JobStatus::Waiting);
    assert!(sim.id.is_none());
}

#[test]
fn blocked_jobs_without_failures_stall() {
    let harness = Harness::new(&experiment("", "", ""), State::default());
    let mut graph = harness.graph();
    let sim = graph.id_of(SIM_1).unwrap();
    graph.force_status(sim, JobStatus::Suspended);

    let mut engine = harness.engine(graph);
    let error = engine.run().unwrap_err();

    assert!(matches!(error, EngineError::Stalled { active: 3 }));
    assert_eq!(error.code(), "STALLED");
    assert_eq!(Harness::status(&engine, INI), JobStatus::Completed);
}

#[test]
fn fatal_rejection_keeps_accepted_submissions() {
    let raw = experiment("", "", "")
        .replace("members: [fc0]", "members: [fc0, fc1]")
        .replace("max_platform_failures: 3", "max_platform_failures: 1");
    let harness = Harness::new(
        &raw,
        State {
            rejections: 1,
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    let error = engine.run().unwrap_err();
    assert_eq!(error.code(), "PLATFORM_UNREACHABLE");

    let storage = StorageAdapters::load(&harness.config.runner.storage, &harness.paths).unwrap();
    let saved = storage.load_graph().unwrap();
    let jobs = [INI, INI_FC1].map(|name| saved.get(name).unwrap());

    let accepted = jobs.iter().filter(|job| job.status() == JobStatus::Submitted).collect_vec();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].id.as_deref(), Some("1"));
    assert_eq!(harness.state.lock().submissions[0].2, vec![accepted[0].name.clone()]);

    let rejected = jobs.iter().filter(|job| job.status() == JobStatus::Ready).collect_vec();
    assert_eq!(rejected.len(), 1);
    assert!(!rejected[0].packed);
    assert!(rejected[0].id.is_none());
}

#[test]
fn stale_packing_is_cleared_on_start() {
    let harness = Harness::new(&experiment("", "", ""), State::default());
    let mut graph = harness.graph();
    let ini = graph.id_of(INI).unwrap();
    graph.job_mut(ini).packed = true;

    let mut engine = harness.engine(graph);
    assert!(!engine.graph().get(INI).unwrap().packed);

    assert_eq!(engine.iterate().unwrap().submitted, 1);
    assert_eq!(Harness::status(&engine, INI), JobStatus::Submitted);
}

#[test]
fn unknown_job_missing_from_report_fails() {
    let harness = Harness::new(
        &experiment("", "", ""),
        State {
            unreachable_polls: 1,
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    engine.iterate().unwrap();
    engine.iterate().unwrap();
    assert_eq!(Harness::status(&engine, INI), JobStatus::Unknown);

    harness.state.lock().mute = true;
    engine.iterate().unwrap();

    let ini = engine.graph().get(INI).unwrap();
    assert_eq!(ini.fail_count, 1);
    assert_ne!(ini.status(), JobStatus::Unknown);
}

#[test]
fn silent_jobs_fail_after_bounded_polls() {
    let harness = Harness::new(
        &experiment("", "", ""),
        State {
            mute: true,
            ..State::default()
        },
    );
    let mut engine = harness.engine(harness.graph());

    assert_eq!(engine.iterate().unwrap().submitted, 1);

    for _ in 1..SILENT_POLLS {
        engine.iterate().unwrap();
        assert_eq!(Harness::status(&engine, INI), JobStatus::Submitted);
        assert_eq!(engine.graph().get(INI).unwrap().fail_count, 0);
    }

    engine.iterate().unwrap();
    assert_eq!(engine.graph().get(INI).unwrap().fail_count, 1);
}
