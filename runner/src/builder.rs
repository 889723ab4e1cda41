pub mod dependency;
pub mod range;

use self::{dependency::Dependency, range::Selector};
use crate::{
    calendar::{self, CalendarError, DateFormat},
    config::{ConfigErrors, ExperimentConfig, SectionConfig},
    graph::{GraphError, JobGraph},
    job::{self, Job, JobId, Resources, Running, SyncMode, Wallclock},
};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use itertools::{iproduct, Itertools};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Wallclock of jobs whose section does not request one
pub const DEFAULT_WALLCLOCK: Wallclock = Wallclock(60);

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("Dependencies form a cycle through {0}")]
    Cycle(String),
}

/// Position of a job in the experiment grid. Date and member are indices into the
/// configured lists, chunk is the chunk number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Coord {
    date: Option<usize>,
    member: Option<usize>,
    chunk: Option<u32>,
}

/// Jobs of one section by coordinate. Synchronized jobs sit under several
/// coordinates; the inner list holds one id per split.
#[derive(Debug)]
struct SectionJobs {
    running: Running,
    splits: Option<u32>,
    coords: BTreeMap<Coord, Vec<JobId>>,
}

/// Expands the job template of an experiment into a `JobGraph`
pub struct GraphBuilder<'a> {
    config: &'a ExperimentConfig,
    dates: Vec<NaiveDateTime>,
    date_format: DateFormat,
    chunks: Vec<u32>,
    graph: JobGraph,
    sections: IndexMap<String, SectionJobs>,
}

pub fn build(config: &ExperimentConfig) -> Result<JobGraph, BuildError> {
    GraphBuilder::new(config)?.build()
}

impl<'a> GraphBuilder<'a> {
    pub fn new(config: &'a ExperimentConfig) -> Result<Self, BuildError> {
        let dates = config.start_dates()?;

        Ok(Self {
            config,
            date_format: calendar::date_format_for(&dates),
            dates,
            chunks: config.chunks().collect(),
            graph: JobGraph::new(config.experiment.id.clone()),
            sections: IndexMap::new(),
        })
    }

    #[instrument(skip(self), fields(expid = %self.config.experiment.id), level = "info")]
    pub fn build(mut self) -> Result<JobGraph, BuildError> {
        let config = self.config;

        for (name, section) in config.jobs.iter() {
            let jobs = self.create_jobs(name, section)?;
            debug!(section = %name, coordinates = jobs.coords.len(), "Created jobs");
            self.sections.insert(name.clone(), jobs);
        }

        let mut edges = 0;
        for (name, section) in config.jobs.iter() {
            for (parent, child) in self.resolve_dependencies(name, section)? {
                if self.graph.add_edge(parent, child) {
                    edges += 1;
                }
            }
        }

        let cyclic = self.graph.cyclic_jobs();
        if let Some(first) = cyclic.first() {
            return Err(BuildError::Cycle(self.graph.job(*first).name.clone()));
        }

        let ready = self.graph.update_readiness(&HashSet::new()).len();

        info!(
            jobs = self.graph.len(),
            edges = edges,
            ready = ready,
            "Built job graph"
        );

        Ok(self.graph)
    }

    fn create_jobs(&mut self, name: &str, section: &SectionConfig) -> Result<SectionJobs, BuildError> {
        let excluded_members = parse_exclusions(section.excluded_members.as_deref())?;
        let excluded_chunks = parse_exclusions(section.excluded_chunks.as_deref())?;

        let members = (0..self.config.experiment.members.len())
            .filter(|index| !excluded_members.contains(&(*index as u32)))
            .collect_vec();

        let mut coords = BTreeMap::new();

        match section.running {
            Running::Once => {
                coords.insert(Coord::default(), self.add_jobs(name, section, Coord::default())?);
            }
            Running::Date => {
                for date in by_frequency(0..self.dates.len(), section.frequency) {
                    let coord = Coord {
                        date: Some(date),
                        ..Default::default()
                    };
                    coords.insert(coord, self.add_jobs(name, section, coord)?);
                }
            }
            Running::Member => {
                for date in 0..self.dates.len() {
                    for member in by_frequency(members.iter().copied(), section.frequency) {
                        let coord = Coord {
                            date: Some(date),
                            member: Some(member),
                            chunk: None,
                        };
                        coords.insert(coord, self.add_jobs(name, section, coord)?);
                    }
                }
            }
            Running::Chunk => {
                let delay = section.delay.unwrap_or(0);
                let chunks = by_frequency(
                    self.chunks
                        .iter()
                        .copied()
                        .filter(|chunk| *chunk > delay && !excluded_chunks.contains(chunk)),
                    section.frequency,
                );

                match section.synchronize {
                    None => {
                        for (date, member, chunk) in iproduct!(0..self.dates.len(), members.iter().copied(), chunks) {
                            let coord = Coord {
                                date: Some(date),
                                member: Some(member),
                                chunk: Some(chunk),
                            };
                            coords.insert(coord, self.add_jobs(name, section, coord)?);
                        }
                    }
                    Some(SyncMode::Date) => {
                        for chunk in chunks {
                            let ids = self.add_jobs(
                                name,
                                section,
                                Coord {
                                    chunk: Some(chunk),
                                    ..Default::default()
                                },
                            )?;

                            for (date, member) in iproduct!(0..self.dates.len(), members.iter().copied()) {
                                let coord = Coord {
                                    date: Some(date),
                                    member: Some(member),
                                    chunk: Some(chunk),
                                };
                                coords.insert(coord, ids.clone());
                            }
                        }
                    }
                    Some(SyncMode::Member) => {
                        for (date, chunk) in iproduct!(0..self.dates.len(), chunks) {
                            let ids = self.add_jobs(
                                name,
                                section,
                                Coord {
                                    date: Some(date),
                                    member: None,
                                    chunk: Some(chunk),
                                },
                            )?;

                            for member in members.iter().copied() {
                                let coord = Coord {
                                    date: Some(date),
                                    member: Some(member),
                                    chunk: Some(chunk),
                                };
                                coords.insert(coord, ids.clone());
                            }
                        }
                    }
                }
            }
        }

        Ok(SectionJobs {
            running: section.running,
            splits: section.splits,
            coords,
        })
    }

    /// Create the jobs of one coordinate, one per split
    fn add_jobs(&mut self, name: &str, section: &SectionConfig, coord: Coord) -> Result<Vec<JobId>, BuildError> {
        let config = self.config;
        let experiment = &config.experiment;
        let platform = config
            .platform_of(section)
            .ok_or_else(|| ConfigErrors::UnknownPlatform(name.to_owned()))?;
        let platform_config = config
            .platforms
            .get(platform)
            .ok_or_else(|| ConfigErrors::UnknownPlatform(platform.to_owned()))?;
        let platform_queue = platform_config.queue.clone();
        // the default never asks for more than the platform grants
        let default_wallclock = DEFAULT_WALLCLOCK.min(platform_config.max_wallclock);

        let date = coord.date.map(|index| self.dates[index]);
        let date_label = date.map(|date| calendar::format_date(&date, self.date_format));
        let member = coord.member.map(|index| experiment.members[index].clone());

        let splits = match section.splits {
            Some(count) => (1..=count).map(Some).collect_vec(),
            None => vec![None],
        };

        let mut ids = Vec::with_capacity(splits.len());

        for split in splits {
            let mut job = Job::new(
                job::job_name(
                    &experiment.id,
                    date_label.as_deref(),
                    member.as_deref(),
                    coord.chunk,
                    split,
                    name,
                ),
                name.to_owned(),
            );

            job.job_type = section.job_type;
            job.date = date;
            job.member = member.clone();
            job.chunk = coord.chunk;
            job.split = split;
            job.splits = section.splits;
            job.priority = section.priority;
            job.rank = section.rank.unwrap_or_default();
            job.frequency = section.frequency;
            job.delay = section.delay;
            job.synchronize = section.synchronize;
            job.running = section.running;
            job.dependencies = section
                .dependencies
                .entries()
                .into_iter()
                .map(|(expr, _)| expr)
                .collect();
            job.retrials = section.retrials.unwrap_or(experiment.retrials);
            job.resources = Resources {
                processors: section.processors,
                tasks: section.tasks,
                threads: section.threads,
                nodes: section.nodes,
                memory: section.memory,
                wallclock: section.wallclock.unwrap_or(default_wallclock),
                platform: platform.to_owned(),
                queue: section.queue.clone().or_else(|| platform_queue.clone()),
            };

            ids.push(self.graph.add_job(job)?);
        }

        Ok(ids)
    }

    /// Edges (parent, child) for every dependency of `name`
    fn resolve_dependencies(&self, name: &str, section: &SectionConfig) -> Result<Vec<(JobId, JobId)>, BuildError> {
        let mut edges = Vec::new();
        let child = &self.sections[name];

        for (expr, filter) in section.dependencies.entries() {
            let dependency = Dependency::new(&expr, &filter)?;
            let parent = self
                .sections
                .get(&dependency.expr.section)
                .ok_or_else(|| ConfigErrors::UnknownSection(dependency.expr.section.clone()))?;

            for (coord, child_ids) in child.coords.iter() {
                let parent_coords = self.parent_coords(&dependency, parent.running, coord);

                for (child_index, child_id) in child_ids.iter().enumerate() {
                    let child_split = child.splits.map(|_| child_index as u32 + 1);

                    for parent_ids in parent_coords.iter().filter_map(|coord| parent.coords.get(coord)) {
                        for (parent_index, parent_id) in parent_ids.iter().enumerate() {
                            let parent_split = parent.splits.map(|_| parent_index as u32 + 1);

                            if splits_match(&dependency.splits, child_split, parent_split) && parent_id != child_id {
                                edges.push((*parent_id, *child_id));
                            }
                        }
                    }
                }
            }
        }

        Ok(edges)
    }

    /// Coordinates of the parent section reached from `child`. Axes the parent does
    /// not run on stay empty; the offset moves along the parent's own running axis.
    fn parent_coords(&self, dependency: &Dependency, running: Running, child: &Coord) -> Vec<Coord> {
        let offset = dependency.expr.offset;
        let offset_on = |axis: Running| if running == axis { offset } else { 0 };

        let all_dates = (0..self.dates.len() as i64).collect_vec();
        let all_members = (0..self.config.experiment.members.len() as i64).collect_vec();
        let all_chunks = self.chunks.iter().map(|chunk| i64::from(*chunk)).collect_vec();

        let dates = match running {
            Running::Once => vec![None],
            _ => select(
                &dependency.dates,
                child.date.map(|date| date as i64),
                offset_on(Running::Date),
                &all_dates,
            )
            .into_iter()
            .map(|date| Some(date as usize))
            .collect(),
        };

        let members = match running {
            Running::Member | Running::Chunk => select(
                &dependency.members,
                child.member.map(|member| member as i64),
                offset_on(Running::Member),
                &all_members,
            )
            .into_iter()
            .map(|member| Some(member as usize))
            .collect(),
            _ => vec![None],
        };

        let chunks = match running {
            Running::Chunk => select(
                &dependency.chunks,
                child.chunk.map(i64::from),
                offset_on(Running::Chunk),
                &all_chunks,
            )
            .into_iter()
            .map(|chunk| Some(chunk as u32))
            .collect(),
            _ => vec![None],
        };

        iproduct!(dates, members, chunks)
            .map(|(date, member, chunk)| Coord { date, member, chunk })
            .collect()
    }
}

/// Values of one axis selected by `selector`. A natural selection follows the
/// child's own value shifted by `offset` and falls back to every value when the
/// child has no coordinate on this axis.
fn select(selector: &Selector, natural: Option<i64>, offset: i64, all: &[i64]) -> Vec<i64> {
    match selector {
        Selector::All => all.to_vec(),
        Selector::Indices(indices) => all
            .iter()
            .copied()
            .filter(|value| u32::try_from(*value).map_or(false, |value| indices.contains(&value)))
            .collect(),
        Selector::Natural => match natural {
            Some(value) => {
                let target = value + offset;
                if all.contains(&target) {
                    vec![target]
                } else {
                    Vec::new()
                }
            }
            None => all.to_vec(),
        },
    }
}

fn splits_match(selector: &Selector, child: Option<u32>, parent: Option<u32>) -> bool {
    let Some(parent) = parent else {
        return true;
    };

    match selector {
        Selector::All => true,
        Selector::Indices(indices) => indices.contains(&parent),
        Selector::Natural => child.map_or(true, |child| child == parent),
    }
}

/// Keep every `frequency`-th item (1-based) and always the last one
fn by_frequency<T, I: IntoIterator<Item = T>>(items: I, frequency: u32) -> Vec<T> {
    let items = items.into_iter().collect_vec();
    let total = items.len();
    let frequency = frequency.max(1) as usize;

    items
        .into_iter()
        .enumerate()
        .filter(|(index, _)| (index + 1) % frequency == 0 || index + 1 == total)
        .map(|(_, item)| item)
        .collect()
}

fn parse_exclusions(expr: Option<&str>) -> Result<BTreeSet<u32>, ConfigErrors> {
    expr.map_or(Ok(BTreeSet::new()), range::parse_indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::path::PathBuf;

    fn config(jobs: &str) -> ExperimentConfig {
        config_with(r#"["19900101"]"#, "[fc0]", 3, jobs)
    }

    fn config_with(dates: &str, members: &str, chunks: u32, jobs: &str) -> ExperimentConfig {
        let raw = format!(
            "experiment:\n  id: a000\n  start_dates: {dates}\n  members: {members}\n  num_chunks: {chunks}\n\
             platforms:\n  local:\n    kind: local\njobs:\n{jobs}"
        );

        ExperimentConfig::parse(&raw, PathBuf::new()).unwrap()
    }

    fn names(graph: &JobGraph) -> Vec<String> {
        graph.iter().map(|(_, job)| job.name.clone()).collect()
    }

    fn parents(graph: &JobGraph, name: &str) -> Vec<String> {
        let job = graph.get(name).unwrap();
        job.parents
            .iter()
            .map(|parent| graph.job(*parent).name.clone())
            .collect()
    }

    #[test]
    fn independent_chunks_are_all_ready() {
        let graph = build(&config("  SIM:\n    running: chunk\n    script: run\n")).unwrap();

        assert_eq!(
            names(&graph),
            vec!["a000_19900101_fc0_1_SIM", "a000_19900101_fc0_2_SIM", "a000_19900101_fc0_3_SIM"]
        );
        assert_eq!(graph.count(JobStatus::Ready), 3);
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn previous_chunk_dependency_forms_a_chain() {
        let graph = build(&config(
            "  SIM:\n    running: chunk\n    script: run\n    dependencies: SIM-1\n",
        ))
        .unwrap();

        assert!(parents(&graph, "a000_19900101_fc0_1_SIM").is_empty());
        assert_eq!(
            parents(&graph, "a000_19900101_fc0_2_SIM"),
            vec!["a000_19900101_fc0_1_SIM"]
        );
        assert_eq!(
            parents(&graph, "a000_19900101_fc0_3_SIM"),
            vec!["a000_19900101_fc0_2_SIM"]
        );
        assert_eq!(graph.ready(None), vec![0]);
        assert_eq!(graph.count(JobStatus::Waiting), 2);
    }

    #[test]
    fn default_wallclock_fits_the_platform() {
        let raw = "experiment:\n  id: a000\n  start_dates: [\"19900101\"]\n  members: [fc0]\n  num_chunks: 1\n\
                   platforms:\n  local:\n    kind: local\n    max_wallclock: \"00:30\"\n\
                   jobs:\n  SIM:\n    running: chunk\n    script: run\n  POST:\n    running: chunk\n    script: run\n    wallclock: \"00:20\"\n";
        let graph = build(&ExperimentConfig::parse(raw, PathBuf::new()).unwrap()).unwrap();

        let wallclock = |name: &str| graph.get(name).unwrap().resources.wallclock;
        assert_eq!(wallclock("a000_19900101_fc0_1_SIM"), Wallclock(30));
        assert_eq!(wallclock("a000_19900101_fc0_1_POST"), Wallclock(20));
    }

    #[test]
    fn building_is_deterministic() {
        let jobs = "  INI:\n    running: member\n    script: a\n  SIM:\n    running: chunk\n    script: b\n    dependencies: INI SIM-1\n  POST:\n    running: chunk\n    script: c\n    synchronize: date\n    dependencies: SIM\n";
        let config = config_with(r#"["19900101", "19910101"]"#, "[fc0, fc1]", 4, jobs);

        let first = build(&config).unwrap();
        let second = build(&config).unwrap();

        assert_eq!(names(&first), names(&second));
        assert_eq!(first.edges(), second.edges());
        assert!(first.is_acyclic());
    }

    #[test]
    fn synchronized_jobs_are_shared() {
        let jobs = "  SIM:\n    running: chunk\n    script: b\n  POST:\n    running: chunk\n    script: c\n    synchronize: date\n    dependencies: SIM\n  MEAN:\n    running: chunk\n    script: d\n    synchronize: member\n    dependencies: SIM\n";
        let graph = build(&config_with(r#"["19900101", "19910101"]"#, "[fc0, fc1]", 2, jobs)).unwrap();

        assert_eq!(graph.len(), 8 + 2 + 4);
        assert_eq!(
            parents(&graph, "a000_1_POST"),
            vec![
                "a000_19900101_fc0_1_SIM",
                "a000_19900101_fc1_1_SIM",
                "a000_19910101_fc0_1_SIM",
                "a000_19910101_fc1_1_SIM"
            ]
        );
        assert_eq!(
            parents(&graph, "a000_19910101_2_MEAN"),
            vec!["a000_19910101_fc0_2_SIM", "a000_19910101_fc1_2_SIM"]
        );
    }

    #[test]
    fn frequency_delay_and_exclusions() {
        let jobs = "  SIM:\n    running: chunk\n    script: b\n    frequency: 2\n    delay: 1\n    excluded_members: \"1\"\n  CLEAN:\n    running: chunk\n    script: c\n    excluded_chunks: \"[1:3]\"\n";
        let graph = build(&config_with(r#"["19900101"]"#, "[fc0, fc1]", 6, jobs)).unwrap();

        let sims = graph
            .iter()
            .filter(|(_, job)| job.section == "SIM")
            .map(|(_, job)| (job.member.clone().unwrap(), job.chunk.unwrap()))
            .collect_vec();
        // chunks 2..=6 remain after the delay; every second one plus the last
        assert_eq!(
            sims,
            vec![("fc0".to_string(), 3), ("fc0".to_string(), 5), ("fc0".to_string(), 6)]
        );

        let cleans = graph
            .iter()
            .filter(|(_, job)| job.section == "CLEAN")
            .map(|(_, job)| job.chunk.unwrap())
            .collect_vec();
        assert_eq!(cleans, vec![4, 5, 6, 4, 5, 6]);
    }

    #[test]
    fn missing_parents_are_pruned() {
        let jobs = "  SIM:\n    running: chunk\n    script: b\n    frequency: 2\n  POST:\n    running: chunk\n    script: c\n    dependencies: SIM\n";
        let graph = build(&config_with(r#"["19900101"]"#, "[fc0]", 4, jobs)).unwrap();

        assert!(parents(&graph, "a000_19900101_fc0_1_POST").is_empty());
        assert_eq!(
            parents(&graph, "a000_19900101_fc0_2_POST"),
            vec!["a000_19900101_fc0_2_SIM"]
        );
        assert_eq!(graph.status(graph.id_of("a000_19900101_fc0_1_POST").unwrap()), JobStatus::Ready);
    }

    #[test]
    fn splits_map_one_to_one() {
        let jobs = "  SIM:\n    running: once\n    script: b\n    splits: 2\n  POST:\n    running: once\n    script: c\n    splits: 2\n    dependencies: SIM\n  REPORT:\n    running: once\n    script: d\n    dependencies: POST\n";
        let graph = build(&config(jobs)).unwrap();

        assert_eq!(parents(&graph, "a000_2_POST"), vec!["a000_2_SIM"]);
        assert_eq!(parents(&graph, "a000_REPORT"), vec!["a000_1_POST", "a000_2_POST"]);
    }

    #[test]
    fn selectors_widen_dependencies() {
        let jobs = "  SIM:\n    running: chunk\n    script: b\n  POST:\n    running: member\n    script: c\n    dependencies:\n      SIM:\n        chunks: \"[2:3]\"\n";
        let graph = build(&config(jobs)).unwrap();

        assert_eq!(
            parents(&graph, "a000_19900101_fc0_POST"),
            vec!["a000_19900101_fc0_2_SIM", "a000_19900101_fc0_3_SIM"]
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let jobs = "  A:\n    running: once\n    script: a\n    dependencies: B\n  B:\n    running: once\n    script: b\n    dependencies: A\n";
        assert!(matches!(build(&config(jobs)), Err(BuildError::Cycle(_))));
    }

    #[test]
    fn frequency_keeps_last_item() {
        assert_eq!(by_frequency(1..=5, 2), vec![2, 4, 5]);
        assert_eq!(by_frequency(1..=4, 2), vec![2, 4]);
        assert_eq!(by_frequency(1..=3, 1), vec![1, 2, 3]);
    }
}
