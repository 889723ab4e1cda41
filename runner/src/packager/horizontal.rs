use super::{policy::Balance, Context, Layout, SectionCounts};
use crate::job::JobId;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Jobs of the same depth as the first remaining candidate, side by side
pub(super) fn build(context: &Context, remaining: &[JobId], taken: &HashSet<JobId>) -> Layout {
    let mut counts = SectionCounts::default();
    Layout::parallel(&select(context, remaining, taken, &mut counts))
}

/// Horizontal selection shared with the hybrid topologies. Always contains the
/// first remaining candidate.
pub(super) fn select(
    context: &Context,
    remaining: &[JobId],
    taken: &HashSet<JobId>,
    counts: &mut SectionCounts,
) -> Vec<JobId> {
    let policy = context.policy;
    let depth = context.depths[remaining[0]];

    let bucket = remaining
        .iter()
        .copied()
        .filter(|id| context.depths[*id] == depth && !taken.contains(id))
        .collect();

    pick(
        context,
        balance(context, bucket),
        counts,
        policy.max_wrapped_h.min(policy.max_wrapped),
        true,
    )
}

/// Greedily take jobs in `ordered` while the width, processor and per-section
/// limits hold. With `force_first` the first job is taken regardless.
pub(super) fn pick(
    context: &Context,
    ordered: Vec<JobId>,
    counts: &mut SectionCounts,
    width: usize,
    force_first: bool,
) -> Vec<JobId> {
    let ceiling = context.ceiling();
    let mut selected = Vec::new();
    let mut processors = 0u32;

    for id in ordered {
        if selected.len() >= width {
            break;
        }

        let job = context.graph.job(id);
        let fits = processors.saturating_add(job.resources.processors) <= context.max_processors()
            && counts.allows(context.policy, &job.section)
            && job.resources.wallclock <= ceiling;

        if fits || (force_first && selected.is_empty()) {
            processors = processors.saturating_add(job.resources.processors);
            counts.add(&job.section);
            selected.push(id);
        }
    }

    selected
}

/// Reorder according to the group's balance: `fill` keeps the candidate order,
/// `round_robin` alternates between sections in order of first appearance
pub(super) fn balance(context: &Context, ids: Vec<JobId>) -> Vec<JobId> {
    match context.policy.balance {
        Balance::Fill => ids,
        Balance::RoundRobin => {
            let mut by_section: IndexMap<&str, Vec<JobId>> = IndexMap::new();
            for id in ids {
                by_section
                    .entry(context.graph.job(id).section.as_str())
                    .or_default()
                    .push(id);
            }

            let longest = by_section.values().map(Vec::len).max().unwrap_or_default();

            (0..longest)
                .flat_map(|round| {
                    by_section
                        .values()
                        .filter_map(move |ids| ids.get(round).copied())
                })
                .collect()
        }
    }
}
