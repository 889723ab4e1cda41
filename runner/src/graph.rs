pub mod transitions;

use crate::job::{Job, JobId, JobStatus};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

pub use transitions::{Observation, Transition};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("Job {0} already exists")]
    DuplicateName(String),
    #[error("Edge references unknown job {0}")]
    UnknownJob(String),
}

/// Arena holding every job of an experiment together with the edges between them.
///
/// Jobs are addressed by their `JobId` (the arena index); parents and children are
/// stored as ids, so no job ever owns another. Every status change goes through
/// `set_status`, which keeps the per-status index current so the queries used by
/// the packager and the run loop never scan the whole arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphSnapshot", into = "GraphSnapshot")]
pub struct JobGraph {
    expid: String,
    jobs: Vec<Job>,
    names: HashMap<String, JobId>,
    by_status: HashMap<JobStatus, BTreeSet<JobId>>,
}

/// Serialized form: jobs in arena order plus the edge list by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub expid: String,
    pub jobs: Vec<Job>,
    pub edges: Vec<(String, String)>,
}

impl JobGraph {
    pub fn new(expid: impl Into<String>) -> Self {
        Self {
            expid: expid.into(),
            jobs: Vec::new(),
            names: HashMap::new(),
            by_status: HashMap::new(),
        }
    }

    pub fn expid(&self) -> &str {
        &self.expid
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn add_job(&mut self, mut job: Job) -> Result<JobId, GraphError> {
        if self.names.contains_key(&job.name) {
            return Err(GraphError::DuplicateName(job.name));
        }

        let id = self.jobs.len();
        job.parents.clear();
        job.children.clear();

        self.names.insert(job.name.clone(), id);
        self.by_status.entry(job.status()).or_default().insert(id);
        self.jobs.push(job);

        Ok(id)
    }

    /// Returns false for self edges and edges that already exist
    pub fn add_edge(&mut self, parent: JobId, child: JobId) -> bool {
        if parent == child {
            return false;
        }

        let inserted = self.jobs[parent].children.insert(child);
        self.jobs[child].parents.insert(parent);
        inserted
    }

    pub fn remove_edge(&mut self, parent: JobId, child: JobId) {
        self.jobs[parent].children.remove(&child);
        self.jobs[child].parents.remove(&parent);
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id]
    }

    pub fn job_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.jobs[id]
    }

    pub fn id_of(&self, name: &str) -> Option<JobId> {
        self.names.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Job> {
        self.id_of(name).map(|id| &self.jobs[id])
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobId, &Job)> {
        self.jobs.iter().enumerate()
    }

    pub fn ids(&self) -> std::ops::Range<JobId> {
        0..self.jobs.len()
    }

    pub fn status(&self, id: JobId) -> JobStatus {
        self.jobs[id].status()
    }

    /// Move a job to `status`, returning the previous one
    pub fn set_status(&mut self, id: JobId, status: JobStatus) -> JobStatus {
        let previous = self.jobs[id].replace_status(status);

        if previous != status {
            if let Some(set) = self.by_status.get_mut(&previous) {
                set.remove(&id);
            }
            self.by_status.entry(status).or_default().insert(id);

            debug!(
                job = %self.jobs[id].name,
                from = %previous,
                to = %status,
                "Status transition"
            );
        }

        previous
    }

    /// Ids currently in `status`, in arena order
    pub fn with_status(&self, status: JobStatus) -> impl Iterator<Item = JobId> + '_ {
        self.by_status
            .get(&status)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).map_or(0, BTreeSet::len)
    }

    fn with_status_on<'a>(
        &'a self,
        statuses: &'a [JobStatus],
        platform: Option<&'a str>,
    ) -> impl Iterator<Item = JobId> + 'a {
        statuses
            .iter()
            .flat_map(move |status| self.with_status(*status))
            .filter(move |id| platform.map_or(true, |name| self.jobs[*id].platform() == name))
    }

    pub fn ready(&self, platform: Option<&str>) -> Vec<JobId> {
        self.with_status_on(&[JobStatus::Ready], platform).collect()
    }

    pub fn prepared(&self, platform: Option<&str>) -> Vec<JobId> {
        self.with_status_on(&[JobStatus::Prepared], platform).collect()
    }

    pub fn running(&self, platform: Option<&str>) -> Vec<JobId> {
        self.with_status_on(&[JobStatus::Running], platform).collect()
    }

    pub fn queued(&self, platform: Option<&str>) -> Vec<JobId> {
        self.with_status_on(&[JobStatus::Queuing, JobStatus::Submitted], platform)
            .collect()
    }

    pub fn held(&self, platform: Option<&str>) -> Vec<JobId> {
        self.with_status_on(&[JobStatus::Held], platform).collect()
    }

    pub fn in_flight(&self, platform: Option<&str>) -> Vec<JobId> {
        self.with_status_on(
            &[
                JobStatus::Submitted,
                JobStatus::Queuing,
                JobStatus::Running,
                JobStatus::Held,
                JobStatus::Unknown,
            ],
            platform,
        )
        .collect()
    }

    pub fn completed(&self) -> Vec<JobId> {
        self.with_status(JobStatus::Completed).collect()
    }

    pub fn failed(&self) -> Vec<JobId> {
        self.with_status(JobStatus::Failed).collect()
    }

    pub fn active_count(&self) -> usize {
        self.jobs.len()
            - self.count(JobStatus::Completed)
            - self.count(JobStatus::Failed)
            - self.count(JobStatus::Skipped)
    }

    pub fn has_active(&self) -> bool {
        self.active_count() > 0
    }

    pub fn in_flight_count(&self) -> usize {
        [
            JobStatus::Submitted,
            JobStatus::Queuing,
            JobStatus::Running,
            JobStatus::Held,
            JobStatus::Unknown,
        ]
        .into_iter()
        .map(|status| self.count(status))
        .sum()
    }

    /// Number of distinct submissions among jobs in `statuses` on `platform`.
    /// A package shares one platform id, so it counts once.
    pub fn units(&self, platform: &str, statuses: &[JobStatus]) -> usize {
        let mut ids = HashSet::new();
        let mut anonymous = 0;

        for id in self.with_status_on(statuses, Some(platform)) {
            match &self.jobs[id].id {
                Some(platform_id) => {
                    ids.insert(platform_id.as_str());
                }
                None => anonymous += 1,
            }
        }

        ids.len() + anonymous
    }

    pub fn parents_satisfied(&self, id: JobId) -> bool {
        self.jobs[id]
            .parents
            .iter()
            .all(|parent| self.jobs[*parent].status().satisfies_dependency())
    }

    pub fn edges(&self) -> Vec<(String, String)> {
        self.jobs
            .iter()
            .flat_map(|job| {
                job.children
                    .iter()
                    .map(|child| (job.name.clone(), self.jobs[*child].name.clone()))
            })
            .collect()
    }

    /// Kahn's algorithm over the whole arena
    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_some()
    }

    pub fn topological_order(&self) -> Option<Vec<JobId>> {
        let order = self.partial_order();
        (order.len() == self.jobs.len()).then_some(order)
    }

    /// Jobs on a cycle or downstream of one, empty for a DAG
    pub fn cyclic_jobs(&self) -> Vec<JobId> {
        let mut ordered = vec![false; self.jobs.len()];
        for id in self.partial_order() {
            ordered[id] = true;
        }

        self.ids().filter(|id| !ordered[*id]).collect()
    }

    fn partial_order(&self) -> Vec<JobId> {
        let mut in_degree = self.jobs.iter().map(|job| job.parents.len()).collect_vec();
        let mut queue: VecDeque<JobId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.jobs.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);

            for child in &self.jobs[id].children {
                in_degree[*child] -= 1;
                if in_degree[*child] == 0 {
                    queue.push_back(*child);
                }
            }
        }

        order
    }

    /// Longest distance from a root for every job
    pub fn depths(&self) -> Vec<usize> {
        let mut depths = vec![0; self.jobs.len()];

        if let Some(order) = self.topological_order() {
            for id in order {
                for child in &self.jobs[id].children {
                    depths[*child] = depths[*child].max(depths[id] + 1);
                }
            }
        }

        depths
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            expid: self.expid.clone(),
            jobs: self.jobs.clone(),
            edges: self.edges(),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, GraphError> {
        let mut graph = JobGraph::new(snapshot.expid);

        for job in snapshot.jobs {
            graph.add_job(job)?;
        }

        for (parent, child) in snapshot.edges {
            let parent_id = graph.id_of(&parent).ok_or(GraphError::UnknownJob(parent))?;
            let child_id = graph.id_of(&child).ok_or(GraphError::UnknownJob(child))?;
            graph.add_edge(parent_id, child_id);
        }

        trace!(jobs = graph.len(), "Rebuilt graph from snapshot");

        Ok(graph)
    }
}

impl PartialEq for JobGraph {
    fn eq(&self, other: &Self) -> bool {
        self.expid == other.expid && self.jobs == other.jobs
    }
}

impl From<JobGraph> for GraphSnapshot {
    fn from(graph: JobGraph) -> Self {
        graph.snapshot()
    }
}

impl TryFrom<GraphSnapshot> for JobGraph {
    type Error = GraphError;

    fn try_from(snapshot: GraphSnapshot) -> Result<Self, Self::Error> {
        JobGraph::from_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(length: usize) -> JobGraph {
        let mut graph = JobGraph::new("t000");
        let mut previous = None;

        for index in 0..length {
            let id = graph
                .add_job(Job::new(format!("t000_{index}_SIM"), "SIM".into()))
                .unwrap();
            if let Some(parent) = previous {
                graph.add_edge(parent, id);
            }
            previous = Some(id);
        }

        graph
    }

    #[test]
    fn status_index_follows_transitions() {
        let mut graph = chain(3);
        assert_eq!(graph.count(JobStatus::Waiting), 3);

        graph.set_status(0, JobStatus::Ready);
        graph.set_status(1, JobStatus::Queuing);
        graph.set_status(2, JobStatus::Submitted);

        assert_eq!(graph.ready(None), vec![0]);
        assert_eq!(graph.queued(None), vec![1, 2]);
        assert_eq!(graph.count(JobStatus::Waiting), 0);
        assert_eq!(graph.in_flight_count(), 2);

        graph.set_status(0, JobStatus::Completed);
        assert!(graph.ready(None).is_empty());
        assert_eq!(graph.completed(), vec![0]);
        assert_eq!(graph.active_count(), 2);
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut graph = chain(1);
        assert_eq!(
            graph.add_job(Job::new("t000_0_SIM".into(), "SIM".into())),
            Err(GraphError::DuplicateName("t000_0_SIM".into()))
        );
    }

    #[test]
    fn detects_cycles_and_depths() {
        let mut graph = chain(3);
        assert!(graph.is_acyclic());
        assert_eq!(graph.depths(), vec![0, 1, 2]);

        graph.add_edge(2, 0);
        assert!(!graph.is_acyclic());
        assert_eq!(graph.cyclic_jobs(), vec![0, 1, 2]);
    }

    #[test]
    fn units_count_packages_once() {
        let mut graph = chain(3);
        for id in graph.ids() {
            graph.job_mut(id).resources.platform = "local".into();
            graph.set_status(id, JobStatus::Queuing);
        }
        graph.job_mut(0).id = Some("42".into());
        graph.job_mut(1).id = Some("42".into());
        graph.job_mut(2).id = Some("43".into());

        assert_eq!(graph.units("local", &[JobStatus::Queuing]), 2);
        assert_eq!(graph.units("remote", &[JobStatus::Queuing]), 0);
    }

    #[test]
    fn snapshot_round_trip_is_lossless() {
        let mut graph = chain(4);
        graph.set_status(0, JobStatus::Completed);
        graph.set_status(1, JobStatus::Running);
        graph.job_mut(1).id = Some("1234".into());
        graph.job_mut(2).fail_count = 2;
        graph.job_mut(2).retrials = 1;

        let json = serde_json::to_string(&graph).unwrap();
        let restored: JobGraph = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, graph);
        assert_eq!(restored.edges(), graph.edges());
        assert_eq!(restored.running(None), vec![1]);
    }
}
