//! The run loop of an experiment.
//!
//! One control thread owns the job graph. Every iteration polls the platforms,
//! applies what they reported, promotes jobs whose dependencies are met, packages
//! ready jobs per platform, submits the packages and checkpoints the graph. Calls
//! to platforms fan out over a bounded thread pool, one platform per task, and
//! their results are merged back on the control thread.

#[cfg(test)]
mod engine_test;

use crate::{
    builder::BuildError,
    config::{ConfigErrors, ExperimentConfig, ExperimentPaths},
    database::{ConnectionError, PackageRecord, StorageAdapters},
    graph::{
        transitions::{Observation, Transition},
        JobGraph,
    },
    job::{JobId, JobStatus},
    packager::{policy::WrapperPolicy, Package, Packager, PackagingError},
    platforms::{self, Platform, PlatformError, RemoteStatus, Submission},
    script::{self, ScriptError},
    sync::{signals, LockError},
};
use itertools::Itertools;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Failed to build the job graph: {0}")]
    Build(#[from] BuildError),
    #[error("Failed to render a job script: {0}")]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("Failed to set up a platform: {0}")]
    Platform(#[from] PlatformError),
    #[error("Platform {platform} failed {failures} times in a row, last error: {source}")]
    Unreachable {
        platform: String,
        failures: u32,
        source: PlatformError,
    },
    #[error(transparent)]
    Deadlock(#[from] PackagingError),
    #[error("Storage failure: {0}")]
    Storage(#[from] ConnectionError),
    #[error("No job can make progress, {active} jobs are still active")]
    Stalled { active: usize },
    #[error("Failed to start the platform worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Experiment {0} already has a job graph, use --force to replace it")]
    AlreadyCreated(String),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl EngineError {
    /// Stable machine readable code of the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Build(_) | Self::Script(_) | Self::Pool(_) | Self::AlreadyCreated(_) => {
                "CONFIG"
            }
            Self::Lock(_) => "LOCK",
            Self::Platform(_) | Self::Unreachable { .. } => "PLATFORM_UNREACHABLE",
            Self::Deadlock(_) => "DEADLOCK",
            Self::Storage(_) | Self::Io { .. } => "STORAGE",
            Self::Stalled { .. } => "STALLED",
        }
    }

    pub fn exit_status(&self) -> u8 {
        2
    }
}

/// How a run ended when no fatal error occurred
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing is active and nothing failed
    Completed,
    /// The loop stopped with terminally failed jobs
    Failed { jobs: Vec<String> },
    /// A stop was requested; `failed` lists jobs that had failed by then
    Interrupted { failed: Vec<String> },
}

impl RunOutcome {
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::Failed { .. } => 1,
            Self::Interrupted { failed } if failed.is_empty() => 0,
            Self::Interrupted { .. } => 1,
        }
    }
}

/// What a single iteration did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Iteration {
    pub transitions: usize,
    pub promoted: usize,
    pub released: usize,
    pub submitted: usize,
    pub rejected: usize,
}

impl Iteration {
    fn changed(&self) -> bool {
        self.transitions + self.promoted + self.released + self.submitted + self.rejected > 0
    }
}

/// Polls in a row a platform may leave an in-flight job out of its report before
/// the job counts as failed
const SILENT_POLLS: u32 = 3;

/// In-flight job as handed to a platform worker
#[derive(Debug, Clone)]
struct Tracked {
    job: JobId,
    name: String,
    submission: String,
    status: JobStatus,
}

pub struct Engine {
    paths: ExperimentPaths,
    config: ExperimentConfig,
    // re-read every iteration when set
    config_file: Option<PathBuf>,
    policies: Vec<WrapperPolicy>,
    graph: JobGraph,
    storage: StorageAdapters,
    platforms: BTreeMap<String, Box<dyn Platform>>,
    pool: ThreadPool,
    // consecutive communication failures per platform
    failures: HashMap<String, u32>,
    // wrappers with at least one job in flight
    packages: Vec<PackageRecord>,
    // in-flight jobs left out of consecutive platform reports
    silent: HashMap<JobId, u32>,
}

/// Answer of one platform to a poll
#[derive(Debug, Default)]
struct PlatformPoll {
    observations: Vec<(JobId, Observation)>,
    /// jobs the platform said nothing about
    silent: Vec<JobId>,
}

impl Engine {
    pub fn new(
        paths: ExperimentPaths,
        config: ExperimentConfig,
        mut graph: JobGraph,
        storage: StorageAdapters,
        platforms: BTreeMap<String, Box<dyn Platform>>,
    ) -> Result<Self, EngineError> {
        let threads = config.runner.workers.unwrap_or(platforms.len()).max(1);
        debug!("Starting platform pool with {threads} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("platform-{index}"))
            .build()?;

        for (_, job) in graph.iter() {
            if job.status().is_active() && !platforms.contains_key(job.platform()) {
                warn!(job = %job.name, platform = %job.platform(), "Job runs on a platform that is not configured");
            }
        }

        let stale = graph.clear_stale_packing();
        if stale > 0 {
            warn!(jobs = stale, "Cleared packing of jobs that were never submitted");
        }

        Ok(Self {
            policies: WrapperPolicy::load_all(&config.wrappers)?,
            packages: storage.load_packages()?,
            paths,
            config,
            config_file: None,
            graph,
            storage,
            platforms,
            pool,
            failures: HashMap::new(),
            silent: HashMap::new(),
        })
    }

    /// Engine over the stored graph of the experiment at `paths`
    pub fn load(paths: ExperimentPaths) -> Result<Self, EngineError> {
        let config_file = paths.config();
        let config = ExperimentConfig::load(&config_file)?;
        let storage = StorageAdapters::load(&config.runner.storage, &paths)?;
        let graph = storage.load_graph()?;

        let platforms = config
            .platforms
            .iter()
            .map(|(name, platform)| Ok((name.clone(), platforms::load(name, platform, &paths)?)))
            .collect::<Result<BTreeMap<_, _>, PlatformError>>()?;

        Ok(Self::new(paths, config, graph, storage, platforms)?.with_reload(config_file))
    }

    /// Pick up changed tunables from `path` at the start of every iteration
    pub fn with_reload(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Loop until no job is active, a stop is requested or a fatal error occurs
    #[instrument(skip(self), fields(expid = %self.graph.expid()), level = "info")]
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        info!(
            jobs = self.graph.len(),
            active = self.graph.active_count(),
            platforms = self.platforms.len(),
            "Starting run loop"
        );

        let outcome = loop {
            if let Err(error) = self.iterate() {
                error!(code = error.code(), "Run loop failed: {error}");

                if let Err(save_error) = self.checkpoint() {
                    error!(error = ?save_error, "Failed to save the job graph after a fatal error");
                }

                return Err(error);
            }

            if !self.graph.has_active() {
                break self.final_outcome();
            }

            if signals::stop_requested() {
                warn!(active = self.graph.active_count(), "Stop requested, leaving the run loop");
                break RunOutcome::Interrupted {
                    failed: self.failed_jobs(),
                };
            }

            if self.is_stalled() {
                let failed = self.failed_jobs();

                if failed.is_empty() {
                    let error = EngineError::Stalled {
                        active: self.graph.active_count(),
                    };
                    error!(code = error.code(), "{error}");
                    self.checkpoint()?;

                    return Err(error);
                }

                warn!(active = self.graph.active_count(), "Remaining jobs depend on failed jobs");
                break RunOutcome::Failed { jobs: failed };
            }

            self.sleep();
        };

        self.checkpoint()?;

        match &outcome {
            RunOutcome::Completed => info!("All jobs completed"),
            RunOutcome::Failed { jobs } => {
                error!(code = "JOB_FAILED", jobs = ?jobs, "Run finished with failed jobs")
            }
            RunOutcome::Interrupted { .. } => info!("Run loop interrupted, state saved"),
        }

        Ok(outcome)
    }

    /// One pass of poll, advance, package, submit and checkpoint
    pub fn iterate(&mut self) -> Result<Iteration, EngineError> {
        self.reload();

        let mut iteration = Iteration::default();

        let finished = self.poll()?;
        iteration.transitions = finished.len();
        self.fetch_logs(&finished);

        iteration.released = self.release();
        iteration.promoted = self.graph.update_readiness(&self.hold_platforms()).len();

        let packages = self.package()?;
        let (submitted, rejected) = self.submit(packages)?;
        iteration.submitted = submitted;
        iteration.rejected = rejected;

        if iteration.changed() {
            self.checkpoint()?;
        }

        debug!(
            transitions = iteration.transitions,
            promoted = iteration.promoted,
            released = iteration.released,
            submitted = iteration.submitted,
            rejected = iteration.rejected,
            "Iteration done"
        );

        Ok(iteration)
    }

    /// Hand the graph back and close the storage
    pub fn close(self) -> Result<JobGraph, EngineError> {
        self.storage.close()?;
        Ok(self.graph)
    }

    fn reload(&mut self) {
        let Some(path) = &self.config_file else {
            return;
        };

        let config = match ExperimentConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                warn!(error = %error, "Keeping previous configuration, reload failed");
                return;
            }
        };

        match WrapperPolicy::load_all(&config.wrappers) {
            Ok(policies) => {
                if config.runner != self.config.runner {
                    info!(sleep = config.runner.sleep, "Runner settings changed");
                }

                self.config = config;
                self.policies = policies;
                self.apply_retrials();
            }
            Err(error) => warn!(error = %error, "Keeping previous configuration, wrappers are invalid"),
        }
    }

    /// Retrials left are what the section allows minus the failures already seen
    fn apply_retrials(&mut self) {
        for id in self.graph.ids() {
            let job = self.graph.job(id);
            if !job.status().is_active() {
                continue;
            }

            let Some(section) = self.config.jobs.get(&job.section) else {
                continue;
            };

            let left = section
                .retrials
                .unwrap_or(self.config.experiment.retrials)
                .saturating_sub(job.fail_count);

            if left != job.retrials {
                debug!(job = %job.name, retrials = left, "Retrials changed");
                self.graph.job_mut(id).retrials = left;
            }
        }
    }

    fn hold_platforms(&self) -> HashSet<String> {
        self.config
            .platforms
            .iter()
            .filter(|(name, platform)| platform.allows_hold && self.platforms.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Ask every platform about its in-flight jobs and apply the answers.
    /// Returns the jobs that reached a terminal state or went back for a retry.
    #[instrument(skip(self), level = "debug")]
    fn poll(&mut self) -> Result<Vec<JobId>, EngineError> {
        let mut tracked: BTreeMap<String, Vec<Tracked>> = BTreeMap::new();

        for id in self.graph.in_flight(None) {
            let job = self.graph.job(id);

            match &job.id {
                Some(submission) => tracked.entry(job.platform().to_owned()).or_default().push(Tracked {
                    job: id,
                    name: job.name.clone(),
                    submission: submission.clone(),
                    status: job.status(),
                }),
                None => warn!(job = %job.name, "In-flight job has no submission id"),
            }
        }

        let work: Vec<(&str, &dyn Platform, Vec<Tracked>)> = tracked
            .into_iter()
            .filter_map(|(name, jobs)| {
                let (name, platform) = self.platforms.get_key_value(&name)?;
                Some((name.as_str(), platform.as_ref(), jobs))
            })
            .collect();

        let results: Vec<(String, Vec<Tracked>, Result<PlatformPoll, PlatformError>)> =
            self.pool.install(|| {
                work.into_par_iter()
                    .map(|(name, platform, jobs)| {
                        let result = poll_platform(platform, &jobs);
                        (name.to_owned(), jobs, result)
                    })
                    .collect()
            });

        let mut finished = Vec::new();
        let mut fatal = None;

        for (platform, jobs, result) in results {
            let observations = match result {
                Ok(answer) => {
                    self.platform_answered(&platform);
                    self.settle_silent(answer)
                }
                Err(error) => {
                    if let Err(escalated) = self.platform_failed(&platform, error) {
                        fatal.get_or_insert(escalated);
                    }
                    jobs.iter().map(|job| (job.job, Observation::Unreachable)).collect()
                }
            };

            for (id, observation) in observations {
                let transition = self.graph.observe(id, observation);

                if let Transition::Moved { from, to } = transition {
                    trace!(job = %self.graph.job(id).name, from = %from, to = %to, "Status changed");
                }

                if transition.is_terminal() {
                    finished.push(id);
                }
            }
        }

        self.silent.retain(|id, _| self.graph.status(*id).is_in_flight());

        match fatal {
            Some(error) => Err(error),
            None => Ok(finished),
        }
    }

    /// Count the jobs a platform left out of its report. Past `SILENT_POLLS` in a
    /// row they are observed as finished without a marker.
    fn settle_silent(&mut self, answer: PlatformPoll) -> Vec<(JobId, Observation)> {
        let mut observations = answer.observations;

        for (id, _) in observations.iter() {
            self.silent.remove(id);
        }

        for id in answer.silent {
            let polls = {
                let polls = self.silent.entry(id).or_default();
                *polls += 1;
                *polls
            };

            if polls >= SILENT_POLLS {
                warn!(job = %self.graph.job(id).name, polls = polls, "Platform stopped reporting the job");
                self.silent.remove(&id);
                observations.push((id, Observation::Finished { marker: false }));
            } else {
                debug!(job = %self.graph.job(id).name, polls = polls, "Job missing from the platform report");
            }
        }

        observations
    }

    fn platform_answered(&mut self, platform: &str) {
        if let Some(failures) = self.failures.remove(platform) {
            info!(platform = %platform, failures = failures, "Platform answers again");
        }
    }

    /// Count a communication failure, fatal once the configured bound is reached
    fn platform_failed(&mut self, platform: &str, error: PlatformError) -> Result<(), EngineError> {
        let failures = self.failures.entry(platform.to_owned()).or_default();
        *failures += 1;
        let failures = *failures;

        if failures >= self.config.runner.max_platform_failures {
            return Err(EngineError::Unreachable {
                platform: platform.to_owned(),
                failures,
                source: error,
            });
        }

        warn!(
            platform = %platform,
            failures = failures,
            bound = self.config.runner.max_platform_failures,
            "Platform call failed: {error}"
        );

        if let Some(remote) = self.platforms.get(platform) {
            if let Err(error) = remote.reset_connection() {
                debug!(platform = %platform, "Reconnecting failed: {error}");
            }
        }

        Ok(())
    }

    fn fetch_logs(&self, finished: &[JobId]) {
        if !self.config.runner.fetch_logs || finished.is_empty() {
            return;
        }

        let destination = self.paths.logs();
        let by_platform = finished
            .iter()
            .map(|id| self.graph.job(*id))
            .into_group_map_by(|job| job.platform().to_owned());

        let work: Vec<(&dyn Platform, Vec<String>)> = by_platform
            .into_iter()
            .filter_map(|(platform, jobs)| {
                Some((
                    self.platforms.get(&platform)?.as_ref(),
                    jobs.into_iter().map(|job| job.name.clone()).collect(),
                ))
            })
            .collect();

        self.pool.install(|| {
            work.par_iter().for_each(|(platform, jobs)| {
                for job in jobs {
                    match platform.fetch_logs(job, &destination) {
                        Ok(files) => trace!(job = %job, files = files, "Fetched logs"),
                        Err(error) => warn!(job = %job, platform = %platform.name(), "Failed to fetch logs: {error}"),
                    }
                }
            })
        });
    }

    /// Release held submissions whose outside parents are all done. Held submissions
    /// downstream of a terminally failed job are cancelled and their jobs wait again.
    fn release(&mut self) -> usize {
        let mut released = 0;
        let doomed = self.doomed();

        for platform in self.hold_platforms() {
            let Some(remote) = self.platforms.get(&platform) else {
                continue;
            };

            let orphaned = self
                .graph
                .held(Some(&platform))
                .into_iter()
                .filter(|id| doomed.contains(id))
                .filter_map(|id| self.graph.job(id).id.clone())
                .unique()
                .collect_vec();

            for submission in orphaned {
                match remote.cancel(&[submission.clone()]) {
                    Ok(()) => {
                        let members = self
                            .graph
                            .held(Some(&platform))
                            .into_iter()
                            .filter(|id| self.graph.job(*id).id.as_deref() == Some(submission.as_str()))
                            .collect_vec();

                        warn!(platform = %platform, id = %submission, jobs = members.len(), "Cancelled held submission, a parent failed");

                        for id in members {
                            self.graph.force_status(id, JobStatus::Waiting);
                        }
                    }
                    Err(error) => warn!(platform = %platform, id = %submission, "Failed to cancel: {error}"),
                }
            }

            for (submission, members) in self.graph.releasable(&platform) {
                match remote.release(&submission) {
                    Ok(()) => {
                        info!(platform = %platform, id = %submission, jobs = members.len(), "Released held submission");

                        for id in members {
                            self.graph.set_status(id, JobStatus::Queuing);
                        }
                        released += 1;
                    }
                    Err(error) => warn!(platform = %platform, id = %submission, "Failed to release: {error}"),
                }
            }
        }

        released
    }

    /// Descendants of terminally failed jobs, they cannot run anymore
    fn doomed(&self) -> HashSet<JobId> {
        let mut doomed = HashSet::new();
        let mut queue = self.graph.failed();

        while let Some(id) = queue.pop() {
            for child in self.graph.job(id).children.iter() {
                if doomed.insert(*child) {
                    queue.push(*child);
                }
            }
        }

        doomed
    }

    /// Run the packager once per platform, plus a deadlock pass when nothing moves
    #[instrument(skip(self), level = "debug")]
    fn package(&mut self) -> Result<Vec<Package>, EngineError> {
        let mut packages = Vec::new();
        let mut deferred = Vec::new();

        for (name, platform) in self.config.platforms.iter() {
            if !self.platforms.contains_key(name) {
                continue;
            }

            let capabilities = platform.capabilities();
            let packager = Packager::new(name, &capabilities, &self.policies);

            let capacity = packager.capacity(&self.graph);
            let output = packager.package(&mut self.graph, false, capacity);
            let left = capacity.saturating_sub(output.packages.len());
            packages.extend(output.packages);

            if capabilities.allows_hold && left > 0 {
                packages.extend(packager.package(&mut self.graph, true, left).packages);
            }

            if !output.deferred.is_empty() {
                deferred.push((name.clone(), output.deferred));
            }
        }

        if packages.is_empty() && self.graph.in_flight_count() == 0 {
            for (name, jobs) in deferred {
                let Some(platform) = self.config.platforms.get(&name) else {
                    continue;
                };

                let capabilities = platform.capabilities();
                let packager = Packager::new(&name, &capabilities, &self.policies);
                let capacity = packager.capacity(&self.graph);

                match packager.resolve_deadlock(&mut self.graph, &jobs, capacity) {
                    Ok(resolved) => packages.extend(resolved),
                    Err(error) => {
                        for package in packages.iter() {
                            self.unpack(package);
                        }
                        return Err(error.into());
                    }
                }
            }
        }

        Ok(packages)
    }

    /// Submit every package; a package is accepted or rejected as a whole.
    /// Returns the number of accepted and rejected packages.
    #[instrument(skip(self, packages), fields(packages = packages.len()), level = "debug")]
    fn submit(&mut self, packages: Vec<Package>) -> Result<(usize, usize), EngineError> {
        if packages.is_empty() {
            return Ok((0, 0));
        }

        let mut by_platform: BTreeMap<String, Vec<(Package, Submission)>> = BTreeMap::new();
        let mut rendered = Ok(());

        for package in packages.iter() {
            let Some(platform) = self.platforms.get(&package.platform) else {
                continue;
            };

            match script::submission(&self.config, &self.graph, package, platform.remote_dir()) {
                Ok(submission) => by_platform
                    .entry(package.platform.clone())
                    .or_default()
                    .push((package.clone(), submission)),
                Err(error) => {
                    rendered = Err(error);
                    break;
                }
            }
        }

        // nothing goes out unless every package could be rendered
        if let Err(error) = rendered {
            for package in packages.iter() {
                self.unpack(package);
            }
            return Err(error.into());
        }

        for package in packages.iter() {
            if !self.platforms.contains_key(&package.platform) {
                self.unpack(package);
            }
        }

        let work: Vec<(&str, &dyn Platform, Vec<(Package, Submission)>)> = by_platform
            .into_iter()
            .filter_map(|(name, packages)| {
                let (name, platform) = self.platforms.get_key_value(&name)?;
                Some((name.as_str(), platform.as_ref(), packages))
            })
            .collect();

        let results: Vec<(String, Vec<(Package, Result<String, PlatformError>)>)> = self.pool.install(|| {
            work.into_par_iter()
                .map(|(name, platform, packages)| {
                    let results = packages
                        .into_iter()
                        .map(|(package, submission)| {
                            let result = platform.submit(&submission);
                            (package, result)
                        })
                        .collect();

                    (name.to_owned(), results)
                })
                .collect()
        });

        let (mut submitted, mut rejected) = (0, 0);
        let mut fatal = None;

        // every answer is applied before an error escalates, accepted work must be tracked
        for (platform, results) in results {
            for (package, result) in results {
                match result {
                    Ok(id) => {
                        self.platform_answered(&platform);
                        if let Err(error) = self.accept(&package, id) {
                            fatal.get_or_insert(error);
                        }
                        submitted += 1;
                    }
                    Err(error) => {
                        warn!(platform = %platform, package = %package.name, jobs = package.jobs.len(), "Submission rejected");
                        self.unpack(&package);
                        rejected += 1;
                        if let Err(escalated) = self.platform_failed(&platform, error) {
                            fatal.get_or_insert(escalated);
                        }
                    }
                }
            }
        }

        match fatal {
            Some(error) => Err(error),
            None => Ok((submitted, rejected)),
        }
    }

    fn accept(&mut self, package: &Package, id: String) -> Result<(), EngineError> {
        let status = if package.hold {
            JobStatus::Held
        } else {
            JobStatus::Submitted
        };

        for job in &package.jobs {
            self.graph.job_mut(*job).id = Some(id.clone());
            self.graph.set_status(*job, status);
        }

        info!(
            platform = %package.platform,
            package = %package.name,
            id = %id,
            topology = %package.topology,
            jobs = package.jobs.len(),
            hold = package.hold,
            "Submitted package"
        );

        if package.is_wrapper() {
            let record = PackageRecord {
                name: package.name.clone(),
                platform: package.platform.clone(),
                jobs: package
                    .jobs
                    .iter()
                    .map(|job| self.graph.job(*job).name.clone())
                    .collect(),
            };

            self.storage.record_package(&record)?;
            self.packages.retain(|existing| existing.name != record.name);
            self.packages.push(record);
        }

        Ok(())
    }

    /// The package was not submitted, its jobs stay where they were
    fn unpack(&mut self, package: &Package) {
        for job in &package.jobs {
            self.graph.job_mut(*job).packed = false;
        }
    }

    fn checkpoint(&mut self) -> Result<(), EngineError> {
        let graph = &self.graph;
        self.packages.retain(|record| {
            record
                .jobs
                .iter()
                .any(|name| graph.get(name).map_or(false, |job| job.status().is_in_flight()))
        });

        self.storage.save(&self.graph, &self.packages)?;
        trace!(jobs = self.graph.len(), packages = self.packages.len(), "Checkpoint written");

        Ok(())
    }

    /// Jobs remain but none is in flight, ready or prepared
    fn is_stalled(&self) -> bool {
        self.graph.has_active()
            && self.graph.in_flight_count() == 0
            && self.graph.count(JobStatus::Ready) == 0
            && self.graph.count(JobStatus::Prepared) == 0
    }

    fn failed_jobs(&self) -> Vec<String> {
        self.graph
            .failed()
            .into_iter()
            .map(|id| self.graph.job(id).name.clone())
            .collect()
    }

    fn final_outcome(&self) -> RunOutcome {
        let failed = self.failed_jobs();

        if failed.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed { jobs: failed }
        }
    }

    fn sleep(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.runner.sleep);

        while !signals::stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            thread::sleep((deadline - now).min(Duration::from_millis(200)));
        }
    }
}

/// Status of every tracked job of one platform. Completion markers are only looked
/// for where a job may have finished.
fn poll_platform(platform: &dyn Platform, jobs: &[Tracked]) -> Result<PlatformPoll, PlatformError> {
    let ids = jobs.iter().map(|job| job.submission.clone()).unique().collect_vec();
    let report = platform.check_status(&ids)?;
    let mut answer = PlatformPoll::default();

    for job in jobs {
        let remote = report.get(&job.submission).copied();

        let may_be_done = match remote {
            Some(status) => status == RemoteStatus::Running || status.is_finished(),
            None => true,
        };
        let marker = may_be_done && platform.completion_marker(&job.name)?;

        let observation = match remote {
            _ if marker => Observation::Finished { marker: true },
            Some(RemoteStatus::Queuing) => Observation::Queuing,
            Some(RemoteStatus::Running) => Observation::Running,
            Some(RemoteStatus::Held) => Observation::Held,
            Some(_) => Observation::Finished { marker: false },
            // lost track of it earlier and the platform has no answer either
            None if job.status == JobStatus::Unknown => Observation::Finished { marker: false },
            None => {
                answer.silent.push(job.job);
                continue;
            }
        };

        answer.observations.push((job.job, observation));
    }

    Ok(answer)
}
