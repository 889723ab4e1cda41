use super::{Context, Layout, SectionCounts};
use crate::job::{Job, JobId, Wallclock};
use std::collections::HashSet;

/// Chain of jobs starting at `head`, each one a child of the previous
pub(super) fn build(context: &Context, head: JobId, taken: &HashSet<JobId>) -> Layout {
    let policy = context.policy;
    let mut counts = SectionCounts::default();
    counts.add(&context.graph.job(head).section);

    let chain = chain(
        context,
        head,
        taken,
        &mut counts,
        policy.max_wrapped_v.min(policy.max_wrapped),
        context.max_processors(),
    );

    Layout::sequential(&chain)
}

/// Follow wrappable children of `head` on the same date and member while the
/// chain stays below `max_length`, the wallclock ceiling and `processor_limit`.
/// The head is expected to be counted in `counts` already.
pub(super) fn chain(
    context: &Context,
    head: JobId,
    taken: &HashSet<JobId>,
    counts: &mut SectionCounts,
    max_length: usize,
    processor_limit: u32,
) -> Vec<JobId> {
    let graph = context.graph;
    let ceiling = context.ceiling();
    let first = graph.job(head);

    let mut chain = vec![head];
    let mut members: HashSet<JobId> = HashSet::from([head]);
    let mut wallclock: Wallclock = first.resources.wallclock;

    while chain.len() < max_length {
        let last = chain[chain.len() - 1];

        let next = graph
            .job(last)
            .children
            .iter()
            .copied()
            .filter(|child| {
                let job = graph.job(*child);

                context.can_follow(*child, taken, &members)
                    && job.date == first.date
                    && job.member == first.member
                    && job.resources.processors <= processor_limit
                    && wallclock.saturating_add(job.resources.wallclock) <= ceiling
                    && counts.allows(context.policy, &job.section)
            })
            .min_by(|a, b| chain_key(graph.job(*a)).cmp(&chain_key(graph.job(*b))));

        let Some(child) = next else {
            break;
        };

        let job = graph.job(child);
        wallclock = wallclock.saturating_add(job.resources.wallclock);
        counts.add(&job.section);
        members.insert(child);
        chain.push(child);
    }

    chain
}

fn chain_key(job: &Job) -> (Option<u32>, Option<u32>, &str) {
    (job.chunk, job.split, job.name.as_str())
}
