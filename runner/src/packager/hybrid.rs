use super::{horizontal, vertical, Context, Layout, SectionCounts};
use crate::job::{JobId, Wallclock};
use itertools::Itertools;
use std::collections::HashSet;

/// Lanes running side by side, each one a vertical chain
pub(super) fn vertical_horizontal(context: &Context, remaining: &[JobId], taken: &HashSet<JobId>) -> Layout {
    let graph = context.graph;
    let policy = context.policy;
    let mut counts = SectionCounts::default();

    let heads = horizontal::select(context, remaining, taken, &mut counts);

    let mut used = taken.clone();
    used.extend(heads.iter().copied());

    let mut lane_processors = heads
        .iter()
        .map(|id| graph.job(*id).resources.processors)
        .collect_vec();
    let mut total_jobs = heads.len();
    let mut lanes = Vec::with_capacity(heads.len());

    for (index, head) in heads.iter().copied().enumerate() {
        let others: u32 = lane_processors
            .iter()
            .enumerate()
            .filter(|(lane, _)| *lane != index)
            .map(|(_, processors)| *processors)
            .sum();

        let max_length = policy
            .max_wrapped_v
            .min(policy.max_wrapped.saturating_sub(total_jobs) + 1);

        let lane = vertical::chain(
            context,
            head,
            &used,
            &mut counts,
            max_length,
            context.max_processors().saturating_sub(others),
        );

        lane_processors[index] = lane
            .iter()
            .map(|id| graph.job(*id).resources.processors)
            .max()
            .unwrap_or_default();
        total_jobs += lane.len() - 1;
        used.extend(lane.iter().copied());
        lanes.push(Layout::sequential(&lane));
    }

    Layout::Parallel(lanes)
}

/// Levels running one after the other, each one a horizontal selection among the
/// children of the previous level
pub(super) fn horizontal_vertical(context: &Context, remaining: &[JobId], taken: &HashSet<JobId>) -> Layout {
    let graph = context.graph;
    let policy = context.policy;
    let ceiling = context.ceiling();
    let mut counts = SectionCounts::default();

    let first = horizontal::select(context, remaining, taken, &mut counts);

    let mut members: HashSet<JobId> = first.iter().copied().collect();
    let mut used = taken.clone();
    used.extend(first.iter().copied());

    let mut wallclock = level_wallclock(context, &first);
    let mut total_jobs = first.len();
    let mut levels = vec![first];

    while levels.len() < policy.max_wrapped_v && total_jobs < policy.max_wrapped {
        let previous = &levels[levels.len() - 1];

        let mut next = previous
            .iter()
            .flat_map(|id| graph.job(*id).children.iter().copied())
            .unique()
            .filter(|child| context.can_follow(*child, &used, &members))
            .collect_vec();
        context.sort(&mut next);

        // counts only change once the level is known to fit
        let mut level_counts = counts.clone();
        let level = horizontal::pick(
            context,
            horizontal::balance(context, next),
            &mut level_counts,
            policy.max_wrapped_h.min(policy.max_wrapped - total_jobs),
            false,
        );

        if level.is_empty() {
            break;
        }

        let level_time = level_wallclock(context, &level);
        if wallclock.saturating_add(level_time) > ceiling {
            break;
        }

        wallclock = wallclock.saturating_add(level_time);
        counts = level_counts;
        total_jobs += level.len();
        members.extend(level.iter().copied());
        used.extend(level.iter().copied());
        levels.push(level);
    }

    Layout::Sequential(levels.iter().map(|level| Layout::parallel(level)).collect())
}

fn level_wallclock(context: &Context, level: &[JobId]) -> Wallclock {
    level
        .iter()
        .map(|id| context.graph.job(*id).resources.wallclock)
        .max()
        .unwrap_or_default()
}
