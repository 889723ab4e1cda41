//! Operator commands. Everything that changes an experiment holds its lock;
//! `status` only reads the last checkpoint.

use crate::{
    builder,
    config::{ConfigErrors, ExperimentConfig, ExperimentPaths},
    database::StorageAdapters,
    engine::{Engine, EngineError, RunOutcome},
    graph::JobGraph,
    job::JobStatus,
    platforms,
    sync::{signals, ExperimentLock},
};
use globset::{Glob, GlobMatcher};
use std::{fmt, time::Duration};
use tracing::{error, info, instrument, warn};

fn lock(paths: &ExperimentPaths, config: &ExperimentConfig) -> Result<ExperimentLock, EngineError> {
    Ok(ExperimentLock::acquire(
        &paths.lock(),
        Duration::from_secs(config.runner.lock_timeout),
    )?)
}

fn matcher(pattern: &str) -> Result<GlobMatcher, EngineError> {
    Ok(Glob::new(pattern)
        .map_err(ConfigErrors::from)?
        .compile_matcher())
}

/// Expand the configuration into a job graph and save it
#[instrument(skip(paths), fields(expid = %paths.expid))]
pub fn create(paths: &ExperimentPaths, force: bool) -> Result<JobGraph, EngineError> {
    let config = ExperimentConfig::load(&paths.config())?;
    paths.create_dirs().map_err(|source| EngineError::Io {
        path: paths.root.clone(),
        source,
    })?;

    let _lock = lock(paths, &config)?;
    let storage = StorageAdapters::load(&config.runner.storage, paths)?;

    if storage.exists()? && !force {
        return Err(EngineError::AlreadyCreated(paths.expid.clone()));
    }

    let graph = builder::build(&config)?;
    storage.save(&graph, &[])?;
    storage.close()?;

    info!(jobs = graph.len(), edges = graph.edges().len(), "Created job graph");

    Ok(graph)
}

/// Run the experiment until it is done, failed or interrupted
pub fn run(paths: &ExperimentPaths) -> Result<RunOutcome, EngineError> {
    let config = ExperimentConfig::load(&paths.config())?;
    let _lock = lock(paths, &config)?;
    signals::install();

    let mut engine = Engine::load(paths.clone())?;
    let outcome = engine.run();

    if let Err(error) = engine.close() {
        error!(code = error.code(), "Failed to close storage: {error}");
    }

    outcome
}

/// Per-status counts and optionally the jobs matching a glob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub expid: String,
    pub counts: Vec<(JobStatus, usize)>,
    pub jobs: Vec<JobLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLine {
    pub name: String,
    pub status: JobStatus,
    pub id: Option<String>,
    pub fail_count: u32,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.expid)?;

        for (status, count) in self.counts.iter().filter(|(_, count)| *count > 0) {
            writeln!(f, "  {:<10} {count}", status.as_str())?;
        }

        if !self.jobs.is_empty() {
            writeln!(f)?;
        }

        for job in self.jobs.iter() {
            write!(f, "{:<40} {:<10}", job.name, job.status.as_str())?;
            if let Some(id) = &job.id {
                write!(f, " {id}")?;
            }
            if job.fail_count > 0 {
                write!(f, " (failed {}x)", job.fail_count)?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

/// Read the last checkpoint without taking the lock
pub fn status(paths: &ExperimentPaths, filter: Option<&str>) -> Result<Summary, EngineError> {
    let config = ExperimentConfig::load(&paths.config())?;
    let storage = StorageAdapters::load(&config.runner.storage, paths)?;
    let graph = storage.load_graph()?;
    storage.close()?;

    let jobs = match filter {
        Some(pattern) => {
            let matcher = matcher(pattern)?;

            graph
                .iter()
                .filter(|(_, job)| matcher.is_match(&job.name))
                .map(|(_, job)| JobLine {
                    name: job.name.clone(),
                    status: job.status(),
                    id: job.id.clone(),
                    fail_count: job.fail_count,
                })
                .collect()
        }
        None => Vec::new(),
    };

    Ok(Summary {
        expid: graph.expid().to_owned(),
        counts: JobStatus::ALL
            .into_iter()
            .map(|status| (status, graph.count(status)))
            .collect(),
        jobs,
    })
}

/// Force every job matching `pattern` into `status`. Returns the changed jobs.
#[instrument(skip(paths), fields(expid = %paths.expid))]
pub fn set_status(paths: &ExperimentPaths, pattern: &str, status: JobStatus) -> Result<Vec<String>, EngineError> {
    let config = ExperimentConfig::load(&paths.config())?;
    let _lock = lock(paths, &config)?;
    let storage = StorageAdapters::load(&config.runner.storage, paths)?;
    let mut graph = storage.load_graph()?;
    let matcher = matcher(pattern)?;

    let matching: Vec<_> = graph
        .iter()
        .filter(|(_, job)| matcher.is_match(&job.name))
        .map(|(id, _)| id)
        .collect();

    if matching.is_empty() {
        warn!(pattern = %pattern, "No job matches");
    }

    let mut changed = Vec::new();
    for id in matching {
        let previous = graph.force_status(id, status);

        if previous != status {
            let name = graph.job(id).name.clone();
            info!(job = %name, from = %previous, to = %status, "Status set");
            changed.push(name);
        }
    }

    storage.save(&graph, &storage.load_packages()?)?;
    storage.close()?;

    Ok(changed)
}

/// Result of `recovery`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub completed: Vec<String>,
    pub reset: Vec<String>,
}

/// Trust completion markers over the stored state: jobs that left one become
/// COMPLETED, other in-flight jobs go back to READY or WAITING
#[instrument(skip(paths), fields(expid = %paths.expid))]
pub fn recovery(paths: &ExperimentPaths) -> Result<Recovery, EngineError> {
    let config = ExperimentConfig::load(&paths.config())?;
    let _lock = lock(paths, &config)?;
    let storage = StorageAdapters::load(&config.runner.storage, paths)?;
    let mut graph = storage.load_graph()?;
    let mut recovery = Recovery::default();

    for (name, platform_config) in config.platforms.iter() {
        let platform = platforms::load(name, platform_config, paths)?;

        let candidates: Vec<_> = graph
            .iter()
            .filter(|(_, job)| job.platform() == name && job.status() != JobStatus::Completed)
            .map(|(id, _)| id)
            .collect();

        for id in candidates {
            let job_name = graph.job(id).name.clone();

            if platform.completion_marker(&job_name)? {
                graph.force_status(id, JobStatus::Completed);
                recovery.completed.push(job_name);
            } else if graph.status(id).is_in_flight() {
                let target = if graph.parents_satisfied(id) {
                    JobStatus::Ready
                } else {
                    JobStatus::Waiting
                };

                graph.force_status(id, target);
                recovery.reset.push(job_name);
            }
        }
    }

    graph.clear_stale_packing();

    // nothing is in flight anymore
    storage.save(&graph, &[])?;
    storage.close()?;

    info!(
        completed = recovery.completed.len(),
        reset = recovery.reset.len(),
        "Recovered job graph"
    );

    Ok(recovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CONFIG: &str = r#"
experiment:
  id: t000
  start_dates: ["20000101"]
  members: [fc0]
  num_chunks: 2
runner:
  lock_timeout: 0
platforms:
  local:
    kind: local
jobs:
  INI:
    running: member
    script: "true"
  SIM:
    running: chunk
    dependencies: INI SIM-1
    script: "true"
"#;

    fn experiment() -> (tempfile::TempDir, ExperimentPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ExperimentPaths::new(dir.path(), "t000");
        paths.create_dirs().unwrap();
        fs::write(paths.config(), CONFIG).unwrap();

        (dir, paths)
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let (_dir, paths) = experiment();

        assert_eq!(create(&paths, false).unwrap().len(), 3);

        let error = create(&paths, false).unwrap_err();
        assert!(matches!(error, EngineError::AlreadyCreated(_)));
        assert_eq!(error.exit_status(), 2);

        assert!(create(&paths, true).is_ok());
    }

    #[test]
    fn status_reads_the_checkpoint() {
        let (_dir, paths) = experiment();
        create(&paths, false).unwrap();

        let summary = status(&paths, Some("*_SIM")).unwrap();

        assert_eq!(summary.expid, "t000");
        // INI has no parents and is ready right away
        assert!(summary.counts.contains(&(JobStatus::Ready, 1)));
        assert!(summary.counts.contains(&(JobStatus::Waiting, 2)));
        assert_eq!(summary.jobs.len(), 2);
        assert!(summary.to_string().contains("t000_20000101_fc0_1_SIM"));
    }

    #[test]
    fn set_status_matches_globs() {
        let (_dir, paths) = experiment();
        create(&paths, false).unwrap();

        let changed = set_status(&paths, "*_SIM", JobStatus::Suspended).unwrap();
        assert_eq!(changed.len(), 2);

        // already suspended
        assert!(set_status(&paths, "*_1_SIM", JobStatus::Suspended).unwrap().is_empty());

        let summary = status(&paths, None).unwrap();
        assert!(summary.counts.contains(&(JobStatus::Suspended, 2)));
        assert!(summary.jobs.is_empty());
    }

    #[test]
    fn set_status_waits_for_the_lock() {
        let (_dir, paths) = experiment();
        create(&paths, false).unwrap();

        let _held = ExperimentLock::acquire(&paths.lock(), Duration::ZERO).unwrap();
        let error = set_status(&paths, "*", JobStatus::Completed).unwrap_err();

        assert_eq!(error.code(), "LOCK");
    }

    #[test]
    fn recovery_trusts_completion_markers() {
        let (_dir, paths) = experiment();
        create(&paths, false).unwrap();
        set_status(&paths, "*_INI", JobStatus::Running).unwrap();
        set_status(&paths, "*_1_SIM", JobStatus::Queuing).unwrap();

        let remote = paths.tmp().join("local");
        fs::create_dir_all(&remote).unwrap();
        fs::write(remote.join("t000_20000101_fc0_INI_COMPLETED"), "").unwrap();

        let recovery = recovery(&paths).unwrap();

        assert_eq!(recovery.completed, vec!["t000_20000101_fc0_INI"]);
        assert_eq!(recovery.reset, vec!["t000_20000101_fc0_1_SIM"]);

        let summary = status(&paths, Some("*")).unwrap();
        let statuses: Vec<_> = summary.jobs.iter().map(|job| job.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Completed, JobStatus::Ready, JobStatus::Waiting]
        );
    }
}
