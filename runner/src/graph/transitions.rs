//! Status transitions driven by platform reports and by dependency progress.

use super::JobGraph;
use crate::job::{JobId, JobStatus};
use std::collections::HashSet;
use tracing::{error, info, warn};

/// What the run loop learnt about a single submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Queuing,
    Running,
    Held,
    /// The platform no longer runs the job; `marker` tells whether it left its
    /// completion marker behind
    Finished { marker: bool },
    /// The platform could not be asked this iteration
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Moved { from: JobStatus, to: JobStatus },
    /// Failed, but will be submitted again
    Retried { fail_count: u32, retrials_left: u32 },
    /// Failed with no retrials left
    Exhausted { fail_count: u32 },
}

impl Transition {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Moved {
                to: JobStatus::Completed,
                ..
            } | Self::Retried { .. }
                | Self::Exhausted { .. }
        )
    }
}

impl JobGraph {
    /// Apply a platform observation to an in-flight job
    pub fn observe(&mut self, id: JobId, observation: Observation) -> Transition {
        let current = self.status(id);

        if !current.is_in_flight() {
            return Transition::Unchanged;
        }

        let target = match observation {
            Observation::Finished { marker: true } => JobStatus::Completed,
            Observation::Finished { marker: false } => return self.record_failure(id),
            Observation::Unreachable => JobStatus::Unknown,
            // held jobs stay held until released, the queue reports them as pending
            Observation::Queuing if current == JobStatus::Held => JobStatus::Held,
            Observation::Queuing => JobStatus::Queuing,
            Observation::Running => JobStatus::Running,
            Observation::Held => JobStatus::Held,
        };

        if target == current {
            return Transition::Unchanged;
        }

        self.set_status(id, target);

        if target == JobStatus::Completed {
            let job = self.job_mut(id);
            job.packed = false;
            info!(job = %job.name, "Job completed");
        }

        Transition::Moved {
            from: current,
            to: target,
        }
    }

    /// A run ended without its completion marker
    pub fn record_failure(&mut self, id: JobId) -> Transition {
        let parents_done = self.parents_satisfied(id);
        let job = self.job_mut(id);

        job.fail_count += 1;
        job.packed = false;
        let fail_count = job.fail_count;

        if job.retrials > 0 {
            job.retrials -= 1;
            let retrials_left = job.retrials;

            warn!(
                job = %job.name,
                fail_count = fail_count,
                retrials_left = retrials_left,
                "Job failed, retrying"
            );

            self.set_status(id, JobStatus::Failed);
            self.set_status(
                id,
                if parents_done {
                    JobStatus::Ready
                } else {
                    JobStatus::Waiting
                },
            );

            Transition::Retried {
                fail_count,
                retrials_left,
            }
        } else {
            error!(
                code = "JOB_FAILED",
                job = %job.name,
                fail_count = fail_count,
                "Job failed and has no retrials left"
            );

            self.set_status(id, JobStatus::Failed);

            Transition::Exhausted { fail_count }
        }
    }

    /// Promote waiting jobs whose parents are done. On platforms in `hold_platforms`,
    /// waiting jobs whose unfinished parents are all in flight become PREPARED.
    /// Returns the jobs that changed status.
    pub fn update_readiness(&mut self, hold_platforms: &HashSet<String>) -> Vec<JobId> {
        let mut changed = Vec::new();

        let candidates: Vec<JobId> = self
            .with_status(JobStatus::Waiting)
            .chain(self.with_status(JobStatus::Prepared))
            .collect();

        for id in candidates {
            let current = self.status(id);

            let target = if self.parents_satisfied(id) {
                JobStatus::Ready
            } else if hold_platforms.contains(self.job(id).platform()) && self.parents_in_progress(id) {
                JobStatus::Prepared
            } else {
                JobStatus::Waiting
            };

            if target == JobStatus::Prepared {
                let weight = self.unfinished_parents(id);
                self.job_mut(id).distance_weight = weight;
            }

            if target != current {
                self.set_status(id, target);
                changed.push(id);
            }
        }

        changed
    }

    /// Every parent is either done or already submitted
    fn parents_in_progress(&self, id: JobId) -> bool {
        let parents = &self.job(id).parents;

        !parents.is_empty()
            && parents.iter().all(|parent| {
                let status = self.status(*parent);
                status.satisfies_dependency() || (status.is_in_flight() && status != JobStatus::Unknown)
            })
    }

    fn unfinished_parents(&self, id: JobId) -> u32 {
        self.job(id)
            .parents
            .iter()
            .filter(|parent| !self.status(**parent).satisfies_dependency())
            .count() as u32
    }

    /// Held jobs on `platform` whose parents outside their own submission are done,
    /// grouped by submission id
    pub fn releasable(&self, platform: &str) -> Vec<(String, Vec<JobId>)> {
        let mut groups: Vec<(String, Vec<JobId>)> = Vec::new();

        for id in self.held(Some(platform)) {
            let Some(platform_id) = self.job(id).id.clone() else {
                continue;
            };

            match groups.iter_mut().find(|(existing, _)| *existing == platform_id) {
                Some((_, members)) => members.push(id),
                None => groups.push((platform_id, vec![id])),
            }
        }

        groups.retain(|(platform_id, members)| {
            members.iter().all(|member| {
                self.job(*member).parents.iter().all(|parent| {
                    self.status(*parent).satisfies_dependency()
                        || self.job(*parent).id.as_deref() == Some(platform_id.as_str())
                })
            })
        });

        groups
    }

    /// Operator override, bypasses the automatic rules
    pub fn force_status(&mut self, id: JobId, status: JobStatus) -> JobStatus {
        let job = self.job_mut(id);
        job.packed = false;
        if !status.is_in_flight() {
            job.id = None;
        }

        self.set_status(id, status)
    }

    /// A package only lives within one iteration. Jobs packed but not in flight
    /// belong to a package that never went out. Returns how many were cleared.
    pub fn clear_stale_packing(&mut self) -> usize {
        let mut cleared = 0;

        for id in self.ids() {
            let in_flight = self.status(id).is_in_flight();
            let job = self.job_mut(id);

            if job.packed && !in_flight {
                job.packed = false;
                cleared += 1;
            }
        }

        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn graph_with_parent() -> JobGraph {
        let mut graph = JobGraph::new("t000");
        for name in ["t000_1_SIM", "t000_2_SIM"] {
            let mut job = Job::new(name.into(), "SIM".into());
            job.resources.platform = "hpc".into();
            graph.add_job(job).unwrap();
        }
        graph.add_edge(0, 1);
        graph
    }

    #[test]
    fn packing_outside_flight_is_stale() {
        let mut graph = graph_with_parent();
        graph.set_status(0, JobStatus::Ready);
        graph.job_mut(0).packed = true;
        graph.set_status(1, JobStatus::Submitted);
        graph.job_mut(1).packed = true;

        assert_eq!(graph.clear_stale_packing(), 1);
        assert!(!graph.job(0).packed);
        assert!(graph.job(1).packed);
    }

    #[test]
    fn marker_completes_from_unknown() {
        let mut graph = graph_with_parent();
        graph.set_status(0, JobStatus::Unknown);

        assert_eq!(
            graph.observe(0, Observation::Finished { marker: true }),
            Transition::Moved {
                from: JobStatus::Unknown,
                to: JobStatus::Completed
            }
        );
        assert_eq!(graph.status(0), JobStatus::Completed);
    }

    #[test]
    fn retries_until_exhausted() {
        let mut graph = graph_with_parent();
        graph.job_mut(0).retrials = 2;

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            graph.set_status(0, JobStatus::Submitted);
            outcomes.push(graph.observe(0, Observation::Finished { marker: false }));
        }

        assert_eq!(
            outcomes,
            vec![
                Transition::Retried {
                    fail_count: 1,
                    retrials_left: 1
                },
                Transition::Retried {
                    fail_count: 2,
                    retrials_left: 0
                },
                Transition::Exhausted { fail_count: 3 },
            ]
        );
        assert_eq!(graph.status(0), JobStatus::Failed);
        assert_eq!(graph.job(0).fail_count, 3);
        assert!(graph.failed().contains(&0));
    }

    #[test]
    fn readiness_requires_completed_parents() {
        let mut graph = graph_with_parent();
        let none = HashSet::new();

        assert_eq!(graph.update_readiness(&none), vec![0]);
        assert_eq!(graph.status(1), JobStatus::Waiting);

        graph.set_status(0, JobStatus::Running);
        assert!(graph.update_readiness(&none).is_empty());

        graph.set_status(0, JobStatus::Completed);
        assert_eq!(graph.update_readiness(&none), vec![1]);
        assert_eq!(graph.status(1), JobStatus::Ready);
    }

    #[test]
    fn hold_platforms_prepare_children_of_running_jobs() {
        let mut graph = graph_with_parent();
        let hold: HashSet<String> = ["hpc".to_string()].into();

        graph.set_status(0, JobStatus::Queuing);
        graph.job_mut(0).id = Some("77".into());
        graph.update_readiness(&hold);

        assert_eq!(graph.status(1), JobStatus::Prepared);
        assert_eq!(graph.job(1).distance_weight, 1);

        graph.set_status(1, JobStatus::Held);
        graph.job_mut(1).id = Some("78".into());
        assert!(graph.releasable("hpc").is_empty());

        graph.set_status(0, JobStatus::Completed);
        assert_eq!(graph.releasable("hpc"), vec![("78".to_string(), vec![1])]);
    }

    #[test]
    fn held_jobs_ignore_pending_reports() {
        let mut graph = graph_with_parent();
        graph.set_status(1, JobStatus::Held);

        assert_eq!(graph.observe(1, Observation::Queuing), Transition::Unchanged);
        assert_eq!(graph.observe(1, Observation::Running).changed(), true);
    }
}
