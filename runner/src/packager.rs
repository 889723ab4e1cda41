//! Turns ready jobs into submission units.
//!
//! A run of the packager looks at a single platform. It computes how many
//! submissions the platform still accepts, splits the candidates into wrapper
//! groups and plain jobs, builds packages for every group according to its
//! topology and drops the ones that do not meet the group's minimums. Jobs of
//! dropped packages are reported back as deferred so the run loop can detect a
//! deadlock and resolve it according to the group's policy.

mod horizontal;
mod hybrid;
pub mod policy;
mod vertical;


use self::policy::{PolicyMode, WrapperKind, WrapperPolicy};
use crate::{
    graph::JobGraph,
    job::{Job, JobId, JobStatus, Wallclock},
    platforms::Capabilities,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    fmt,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PackagingError {
    #[error("Wrapper {wrapper} cannot complete a package while nothing else runs (jobs: {jobs:?})")]
    Deadlock { wrapper: String, jobs: Vec<String> },
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    Simple,
    Vertical,
    Horizontal,
    VerticalHorizontal,
    HorizontalVertical,
}

impl From<WrapperKind> for Topology {
    fn from(kind: WrapperKind) -> Self {
        match kind {
            WrapperKind::Vertical => Self::Vertical,
            WrapperKind::Horizontal => Self::Horizontal,
            WrapperKind::VerticalHorizontal => Self::VerticalHorizontal,
            WrapperKind::HorizontalVertical => Self::HorizontalVertical,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "SIMPLE",
            Self::Vertical => "VERTICAL",
            Self::Horizontal => "HORIZONTAL",
            Self::VerticalHorizontal => "VERTICAL_HORIZONTAL",
            Self::HorizontalVertical => "HORIZONTAL_VERTICAL",
        })
    }
}

/// Execution order of the jobs inside a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Job(JobId),
    Sequential(Vec<Layout>),
    Parallel(Vec<Layout>),
}

impl Layout {
    pub fn sequential(ids: &[JobId]) -> Self {
        Self::Sequential(ids.iter().copied().map(Self::Job).collect())
    }

    pub fn parallel(ids: &[JobId]) -> Self {
        Self::Parallel(ids.iter().copied().map(Self::Job).collect())
    }

    /// Jobs in execution order, lanes and levels flattened left to right
    pub fn jobs(&self) -> Vec<JobId> {
        let mut jobs = Vec::new();
        self.collect(&mut jobs);
        jobs
    }

    fn collect(&self, jobs: &mut Vec<JobId>) {
        match self {
            Self::Job(id) => jobs.push(*id),
            Self::Sequential(steps) | Self::Parallel(steps) => {
                steps.iter().for_each(|step| step.collect(jobs))
            }
        }
    }

    pub fn wallclock(&self, graph: &JobGraph) -> Wallclock {
        match self {
            Self::Job(id) => graph.job(*id).resources.wallclock,
            Self::Sequential(steps) => steps
                .iter()
                .fold(Wallclock::default(), |total, step| total.saturating_add(step.wallclock(graph))),
            Self::Parallel(steps) => steps
                .iter()
                .map(|step| step.wallclock(graph))
                .max()
                .unwrap_or_default(),
        }
    }

    pub fn processors(&self, graph: &JobGraph) -> u32 {
        match self {
            Self::Job(id) => graph.job(*id).resources.processors,
            Self::Sequential(steps) => steps
                .iter()
                .map(|step| step.processors(graph))
                .max()
                .unwrap_or_default(),
            Self::Parallel(steps) => steps.iter().map(|step| step.processors(graph)).sum(),
        }
    }

    /// Jobs running side by side at the widest point
    pub fn width(&self) -> usize {
        match self {
            Self::Job(_) => 1,
            Self::Sequential(steps) => steps.iter().map(Layout::width).max().unwrap_or_default(),
            Self::Parallel(steps) => steps.iter().map(Layout::width).sum(),
        }
    }

    /// Jobs running one after the other along the longest path
    pub fn length(&self) -> usize {
        match self {
            Self::Job(_) => 1,
            Self::Sequential(steps) => steps.iter().map(Layout::length).sum(),
            Self::Parallel(steps) => steps.iter().map(Layout::length).max().unwrap_or_default(),
        }
    }
}

/// One submission: a single job or a wrapper of several
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub platform: String,
    pub topology: Topology,
    pub layout: Layout,
    pub jobs: Vec<JobId>,
    pub wallclock: Wallclock,
    pub processors: u32,
    /// submitted held, released once every outside parent completed
    pub hold: bool,
}

impl Package {
    pub fn simple(graph: &JobGraph, id: JobId, hold: bool) -> Self {
        let job = graph.job(id);

        Self {
            name: job.name.clone(),
            platform: job.platform().to_owned(),
            topology: Topology::Simple,
            layout: Layout::Job(id),
            jobs: vec![id],
            wallclock: job.resources.wallclock,
            processors: job.resources.processors,
            hold,
        }
    }

    pub fn wrapped(graph: &JobGraph, topology: Topology, layout: Layout, hold: bool) -> Self {
        let jobs = layout.jobs();
        let first = graph.job(jobs[0]);
        let suffix = first
            .name
            .strip_prefix(graph.expid())
            .map(|rest| rest.trim_start_matches('_'))
            .unwrap_or(&first.name);

        Self {
            name: format!("{}_{topology}_{suffix}", graph.expid()),
            platform: first.platform().to_owned(),
            topology,
            wallclock: layout.wallclock(graph),
            processors: layout.processors(graph),
            layout,
            jobs,
            hold,
        }
    }

    pub fn is_wrapper(&self) -> bool {
        self.topology != Topology::Simple
    }
}

#[derive(Debug, Default)]
pub struct PackagerOutput {
    pub packages: Vec<Package>,
    /// eligible jobs held back because their package was below the wrapper minimums
    pub deferred: Vec<JobId>,
}

/// Ordering of candidates: priority descending, section rank, name
pub(crate) fn sort_key(job: &Job) -> (Reverse<i32>, u32, &str) {
    (Reverse(job.priority), job.rank, job.name.as_str())
}

/// Per-section job counts of the package being built
#[derive(Debug, Default, Clone)]
pub(crate) struct SectionCounts(HashMap<String, usize>);

impl SectionCounts {
    pub fn allows(&self, policy: &WrapperPolicy, section: &str) -> bool {
        self.0.get(section).copied().unwrap_or_default() < policy.section_limit(section)
    }

    pub fn add(&mut self, section: &str) {
        *self.0.entry(section.to_owned()).or_default() += 1;
    }
}

/// What the topology builders need to know about the current run
pub(crate) struct Context<'a> {
    pub graph: &'a JobGraph,
    pub platform: &'a str,
    pub capabilities: &'a Capabilities,
    pub policy: &'a WrapperPolicy,
    pub hold: bool,
    pub depths: &'a [usize],
}

impl<'a> Context<'a> {
    /// Wallclock no package of this group may exceed
    pub fn ceiling(&self) -> Wallclock {
        self.policy.max_wallclock.min(self.capabilities.max_wallclock)
    }

    pub fn max_processors(&self) -> u32 {
        self.capabilities.max_processors
    }

    /// A job that may join a package as a follower of jobs already in it
    pub fn can_follow(&self, id: JobId, taken: &HashSet<JobId>, members: &HashSet<JobId>) -> bool {
        let job = self.graph.job(id);

        !taken.contains(&id)
            && !members.contains(&id)
            && !job.packed
            && job.platform() == self.platform
            && self.policy.matches(&job.section)
            && matches!(
                job.status(),
                JobStatus::Waiting | JobStatus::Ready | JobStatus::Prepared
            )
            && job.parents.iter().all(|parent| {
                let status = self.graph.status(*parent);

                members.contains(parent)
                    || status.satisfies_dependency()
                    || (self.hold && status.is_in_flight() && status != JobStatus::Unknown)
            })
    }

    pub fn sort(&self, ids: &mut [JobId]) {
        ids.sort_by(|a, b| sort_key(self.graph.job(*a)).cmp(&sort_key(self.graph.job(*b))));
    }
}

/// Packages the eligible jobs of one platform
#[derive(Debug)]
pub struct Packager<'a> {
    platform: &'a str,
    capabilities: &'a Capabilities,
    policies: &'a [WrapperPolicy],
}

impl<'a> Packager<'a> {
    pub fn new(platform: &'a str, capabilities: &'a Capabilities, policies: &'a [WrapperPolicy]) -> Self {
        Self {
            platform,
            capabilities,
            policies,
        }
    }

    /// Submissions the platform still accepts. A package in flight counts once.
    pub fn capacity(&self, graph: &JobGraph) -> usize {
        let queued = graph.units(
            self.platform,
            &[JobStatus::Submitted, JobStatus::Queuing, JobStatus::Held],
        );
        let in_flight = graph.units(
            self.platform,
            &[
                JobStatus::Submitted,
                JobStatus::Queuing,
                JobStatus::Held,
                JobStatus::Running,
                JobStatus::Unknown,
            ],
        );

        self.capabilities
            .max_waiting_jobs
            .saturating_sub(queued)
            .min(self.capabilities.total_jobs.saturating_sub(in_flight))
    }

    /// Wrapper group a job belongs to, if any
    pub fn policy_for(&self, job: &Job) -> Option<&'a WrapperPolicy> {
        if !self.capabilities.allows_wrapping {
            return None;
        }

        self.policies.iter().find(|policy| policy.matches(&job.section))
    }

    /// Build at most `limit` packages out of the READY (or, with `hold`, PREPARED)
    /// jobs of the platform and mark their jobs as packed
    #[instrument(skip(self, graph), fields(platform = %self.platform), level = "debug")]
    pub fn package(&self, graph: &mut JobGraph, hold: bool, limit: usize) -> PackagerOutput {
        let mut output = PackagerOutput::default();

        if limit == 0 {
            return output;
        }

        let mut candidates = if hold {
            graph.prepared(Some(self.platform))
        } else {
            graph.ready(Some(self.platform))
        };
        candidates.retain(|id| !graph.job(*id).packed);

        if candidates.is_empty() {
            return output;
        }

        let view: &JobGraph = graph;
        let candidate_key = move |id: &JobId| {
            let job = view.job(*id);
            (if hold { job.distance_weight } else { 0 }, sort_key(job))
        };
        candidates.sort_by(|a, b| candidate_key(a).cmp(&candidate_key(b)));

        // group members keep the order of the candidates
        let mut groups: Vec<(&WrapperPolicy, Vec<JobId>)> =
            self.policies.iter().map(|policy| (policy, Vec::new())).collect();
        let mut simple = Vec::new();

        for id in candidates.iter().copied() {
            match self.policy_for(view.job(id)) {
                Some(policy) => {
                    if let Some((_, members)) = groups.iter_mut().find(|(group, _)| std::ptr::eq(*group, policy)) {
                        members.push(id);
                    }
                }
                None => simple.push(id),
            }
        }

        let depths = view.depths();
        let mut taken = HashSet::new();

        for (policy, members) in groups.into_iter().filter(|(_, members)| !members.is_empty()) {
            let context = Context {
                graph: view,
                platform: self.platform,
                capabilities: self.capabilities,
                policy,
                hold,
                depths: &depths,
            };

            self.wrap_group(&context, &members, &mut taken, &mut output);
        }

        output
            .packages
            .extend(simple.into_iter().map(|id| Package::simple(view, id, hold)));

        output.packages.sort_by(|a, b| {
            candidate_key(&a.jobs[0]).cmp(&candidate_key(&b.jobs[0]))
        });

        if output.packages.len() > limit {
            debug!(
                packages = output.packages.len(),
                limit = limit,
                "Truncated packages to platform capacity"
            );
            output.packages.truncate(limit);
        }

        for package in output.packages.iter() {
            for id in package.jobs.iter() {
                graph.job_mut(*id).packed = true;
            }
        }

        if !output.packages.is_empty() {
            info!(
                platform = %self.platform,
                packages = output.packages.len(),
                jobs = output.packages.iter().map(|package| package.jobs.len()).sum::<usize>(),
                deferred = output.deferred.len(),
                hold = hold,
                "Built packages"
            );
        }

        output
    }

    /// Build packages of one wrapper group until its candidates are used up
    fn wrap_group(
        &self,
        context: &Context,
        members: &[JobId],
        taken: &mut HashSet<JobId>,
        output: &mut PackagerOutput,
    ) {
        let policy = context.policy;
        let graph = context.graph;

        loop {
            let remaining = members
                .iter()
                .copied()
                .filter(|id| !taken.contains(id))
                .collect_vec();

            if remaining.is_empty() {
                break;
            }

            let layout = match policy.kind {
                WrapperKind::Vertical => vertical::build(context, remaining[0], taken),
                WrapperKind::Horizontal => horizontal::build(context, &remaining, taken),
                WrapperKind::VerticalHorizontal => hybrid::vertical_horizontal(context, &remaining, taken),
                WrapperKind::HorizontalVertical => hybrid::horizontal_vertical(context, &remaining, taken),
            };

            let package = Package::wrapped(graph, policy.kind.into(), layout, context.hold);
            taken.extend(package.jobs.iter().copied());

            if policy.accepts(&package, graph) {
                debug!(
                    wrapper = %policy.name,
                    package = %package.name,
                    jobs = package.jobs.len(),
                    wallclock = %package.wallclock,
                    processors = package.processors,
                    "Accepted package"
                );
                output.packages.push(package);
                continue;
            }

            let eligible = if context.hold {
                JobStatus::Prepared
            } else {
                JobStatus::Ready
            };

            for id in package.jobs.iter().copied().filter(|id| graph.status(*id) == eligible) {
                if policy.mode == PolicyMode::Mixed && graph.job(id).fail_count > 0 {
                    output.packages.push(Package::simple(graph, id, context.hold));
                } else {
                    output.deferred.push(id);
                }
            }
        }
    }

    /// Nothing is in flight and no package was built: submit deferred jobs one by one
    /// where the policy allows it
    pub fn resolve_deadlock(
        &self,
        graph: &mut JobGraph,
        deferred: &[JobId],
        limit: usize,
    ) -> Result<Vec<Package>, PackagingError> {
        let mut packages = Vec::new();

        for (policy, jobs) in deferred
            .iter()
            .copied()
            .filter_map(|id| self.policy_for(graph.job(id)).map(|policy| (policy, id)))
            .into_group_map_by(|(policy, _)| policy.name.clone())
            .into_values()
            .filter_map(|entries| {
                let policy = entries.first()?.0;
                Some((policy, entries.into_iter().map(|(_, id)| id).collect_vec()))
            })
            .sorted_by(|(a, _), (b, _)| a.name.cmp(&b.name))
        {
            if policy.mode != PolicyMode::Flexible {
                return Err(PackagingError::Deadlock {
                    wrapper: policy.name.clone(),
                    jobs: jobs.iter().map(|id| graph.job(*id).name.clone()).collect(),
                });
            }

            warn!(
                wrapper = %policy.name,
                jobs = jobs.len(),
                "Wrapper cannot be completed, submitting its jobs individually"
            );

            packages.extend(
                jobs.into_iter()
                    .map(|id| Package::simple(graph, id, graph.status(id) == JobStatus::Prepared)),
            );
        }

        packages.sort_by(|a, b| sort_key(graph.job(a.jobs[0])).cmp(&sort_key(graph.job(b.jobs[0]))));
        packages.truncate(limit);

        for package in packages.iter() {
            graph.job_mut(package.jobs[0]).packed = true;
        }

        Ok(packages)
    }
}
