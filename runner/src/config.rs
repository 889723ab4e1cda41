use crate::{
    builder::{dependency::DependencyExpr, range},
    calendar::{self, Calendar, CalendarError, ChunkUnit},
    job::{JobType, Running, SyncMode, Wallclock},
    packager::policy::{Balance, PolicyMode, WrapperKind},
    platforms::Capabilities,
};
use chrono::NaiveDateTime;
use globset::Glob;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("Invalid range expression '{0}'")]
    InvalidRange(String),
    #[error("Invalid dependency expression '{0}'")]
    InvalidDependency(String),
    #[error("Section {0} is not defined")]
    UnknownSection(String),
    #[error("Platform {0} is not defined")]
    UnknownPlatform(String),
    #[error("Configuration failed its preflight checks, see the log for details")]
    Preflight,
}

/// Full description of an experiment, read from `<experiment>/conf/experiment.yml`
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSection,
    #[serde(default)]
    pub runner: RunnerConfig,
    pub platforms: BTreeMap<String, PlatformConfig>,
    // declaration order is the default section rank
    pub jobs: IndexMap<String, SectionConfig>,
    #[serde(default)]
    pub wrappers: BTreeMap<String, WrapperConfig>,

    // directory relative script files are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub id: String,
    #[serde(default)]
    pub start_dates: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default = "default_one")]
    pub chunk_size: u32,
    #[serde(default)]
    pub chunk_unit: ChunkUnit,
    #[serde(default)]
    pub num_chunks: u32,
    #[serde(default = "default_one")]
    pub chunk_ini: u32,
    #[serde(default)]
    pub calendar: Calendar,
    #[serde(default)]
    pub retrials: u32,
    pub default_platform: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// seconds between two iterations
    #[serde(default = "default_sleep")]
    pub sleep: u64,
    /// consecutive failed polls of one platform before giving up
    #[serde(default = "default_max_platform_failures")]
    pub max_platform_failures: u32,
    /// seconds to wait for the experiment lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    /// size of the platform I/O pool, defaults to one thread per platform
    pub workers: Option<usize>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_true")]
    pub fetch_logs: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sleep: default_sleep(),
            max_platform_failures: default_max_platform_failures(),
            lock_timeout: default_lock_timeout(),
            workers: None,
            storage: StorageConfig::default(),
            fetch_logs: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum StorageConfig {
    #[default]
    #[serde(rename = "file")]
    File,
    #[serde(rename = "sqlite")]
    SQLite { path: Option<PathBuf> },
    #[serde(rename = "duckdb")]
    DuckDB { path: Option<PathBuf> },
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Local,
    Slurm,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    #[serde(default = "default_max_processors")]
    pub max_processors: u32,
    #[serde(default = "default_job_limit")]
    pub max_waiting_jobs: usize,
    #[serde(default = "default_job_limit")]
    pub total_jobs: usize,
    #[serde(default = "default_max_wallclock")]
    pub max_wallclock: Wallclock,
    #[serde(default = "default_true")]
    pub allows_wrapping: bool,
    #[serde(default)]
    pub allows_hold: bool,
    pub queue: Option<String>,

    // back-end specific settings, e.g. `scratch`, `command_prefix`, `timeout` for slurm
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl PlatformConfig {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_processors: self.max_processors,
            max_waiting_jobs: self.max_waiting_jobs,
            total_jobs: self.total_jobs,
            max_wallclock: self.max_wallclock,
            allows_wrapping: self.allows_wrapping,
            allows_hold: self.allows_hold,
        }
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameter.get(key).and_then(serde_yaml::Value::as_str)
    }

    pub fn parameter_u64(&self, key: &str) -> Option<u64> {
        self.parameter.get(key).and_then(serde_yaml::Value::as_u64)
    }
}

/// Dependencies of a section, either `"INI SIM-1"`, a list of expressions or a map
/// from expression to coordinate selectors
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(untagged)]
pub enum Dependencies {
    Inline(String),
    List(Vec<String>),
    Detailed(IndexMap<String, Option<DependencyFilter>>),
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl Dependencies {
    /// Expressions in declaration order together with their selectors
    pub fn entries(&self) -> Vec<(String, DependencyFilter)> {
        match self {
            Self::Inline(line) => line
                .split_whitespace()
                .map(|expr| (expr.to_owned(), DependencyFilter::default()))
                .collect(),
            Self::List(list) => list
                .iter()
                .map(|expr| (expr.trim().to_owned(), DependencyFilter::default()))
                .collect(),
            Self::Detailed(map) => map
                .iter()
                .map(|(expr, filter)| (expr.trim().to_owned(), filter.clone().unwrap_or_default()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Selectors restricting which parent coordinates a dependency reaches.
/// Each is `natural`, `all`/`any` or an index list such as `[0:2],4`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DependencyFilter {
    pub dates: Option<String>,
    pub members: Option<String>,
    pub chunks: Option<String>,
    pub splits: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SectionConfig {
    #[serde(default)]
    pub running: Running,
    /// path of the job template, relative to the experiment directory
    pub file: Option<PathBuf>,
    /// inline job template, used when no `file` is given
    pub script: Option<String>,
    #[serde(default, rename = "type")]
    pub job_type: JobType,
    pub platform: Option<String>,
    pub queue: Option<String>,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default = "default_one")]
    pub frequency: u32,
    pub delay: Option<u32>,
    pub synchronize: Option<SyncMode>,
    pub splits: Option<u32>,
    pub excluded_members: Option<String>,
    pub excluded_chunks: Option<String>,
    pub retrials: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    pub rank: Option<u32>,
    #[serde(default = "default_one")]
    pub processors: u32,
    #[serde(default)]
    pub tasks: u32,
    #[serde(default = "default_one")]
    pub threads: u32,
    #[serde(default)]
    pub nodes: u32,
    pub memory: Option<u64>,
    pub wallclock: Option<Wallclock>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

impl SectionConfig {
    /// Section parameters rendered as plain strings
    pub fn parameter_values(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    serde_yaml::Value::String(string) => string.clone(),
                    serde_yaml::Value::Null => String::new(),
                    other => serde_yaml::to_string(other)
                        .map(|text| text.trim_end().to_owned())
                        .unwrap_or_default(),
                };

                (key.clone(), rendered)
            })
            .collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WrapperConfig {
    #[serde(rename = "type")]
    pub kind: WrapperKind,
    /// globs over section names
    pub jobs_in_wrapper: Vec<String>,
    #[serde(default)]
    pub policy: PolicyMode,
    #[serde(default = "default_min_wrapped")]
    pub min_wrapped: usize,
    pub max_wrapped: Option<usize>,
    #[serde(default = "default_one_usize")]
    pub min_wrapped_h: usize,
    #[serde(default = "default_one_usize")]
    pub min_wrapped_v: usize,
    pub max_wrapped_h: Option<usize>,
    pub max_wrapped_v: Option<usize>,
    #[serde(default)]
    pub max_per_section: BTreeMap<String, usize>,
    #[serde(default)]
    pub balance: Balance,
    /// ceiling below the platform's own maximum
    pub max_wallclock: Option<Wallclock>,
}

/// Layout of an experiment directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPaths {
    pub expid: String,
    pub root: PathBuf,
}

impl ExperimentPaths {
    pub fn new(base: &Path, expid: &str) -> Self {
        Self {
            expid: expid.to_owned(),
            root: base.join(expid),
        }
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("conf").join("experiment.yml")
    }

    pub fn pkl(&self) -> PathBuf {
        self.root.join("pkl")
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Where logs of finished jobs are collected
    pub fn logs(&self) -> PathBuf {
        self.tmp().join(format!("LOG_{}", self.expid))
    }

    pub fn lock(&self) -> PathBuf {
        self.tmp().join("stratus.lock")
    }

    pub fn job_list(&self) -> PathBuf {
        self.pkl().join(format!("job_list_{}.json", self.expid))
    }

    pub fn packages(&self) -> PathBuf {
        self.pkl().join(format!("job_packages_{}.json", self.expid))
    }

    pub fn database(&self, extension: &str) -> PathBuf {
        self.pkl().join(format!("job_list_{}.{extension}", self.expid))
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.root.join("conf"))?;
        fs::create_dir_all(self.pkl())?;
        fs::create_dir_all(self.tmp())
    }
}

impl ExperimentConfig {
    /// Read, parse and validate the configuration at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigErrors::Io {
            path: path.to_owned(),
            source,
        })?;

        // <experiment>/conf/experiment.yml -> <experiment>
        let base_dir = path
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self::parse(&raw, base_dir)
    }

    pub fn parse(raw: &str, base_dir: PathBuf) -> Result<Self, ConfigErrors> {
        let mut config: ExperimentConfig = serde_yaml::from_str(raw)?;
        config.base_dir = base_dir;

        if config.preflight_checks() {
            Err(ConfigErrors::Preflight)
        } else {
            debug!(
                expid = %config.experiment.id,
                sections = config.jobs.len(),
                platforms = config.platforms.len(),
                "Loaded configuration"
            );

            Ok(config)
        }
    }

    pub fn start_dates(&self) -> Result<Vec<NaiveDateTime>, CalendarError> {
        self.experiment
            .start_dates
            .iter()
            .map(|date| calendar::parse_date(date))
            .collect()
    }

    pub fn chunks(&self) -> std::ops::Range<u32> {
        let first = self.experiment.chunk_ini;
        first..first + self.experiment.num_chunks
    }

    /// Platform a section runs on: its own, the experiment default or the only one defined
    pub fn platform_of<'a>(&'a self, section: &'a SectionConfig) -> Option<&'a str> {
        section
            .platform
            .as_deref()
            .or(self.experiment.default_platform.as_deref())
            .or_else(|| match self.platforms.len() {
                1 => self.platforms.keys().next().map(String::as_str),
                _ => None,
            })
    }

    pub fn script_source(&self, section: &SectionConfig) -> Option<PathBuf> {
        section.file.as_ref().map(|file| self.base_dir.join(file))
    }

    /// Log every problem of the configuration and normalise defaults. Returns true if
    /// any error was found.
    pub fn preflight_checks(&mut self) -> bool {
        // report everything at once instead of failing on the first problem
        let mut contains_error = false;

        if self.experiment.id.is_empty() || self.experiment.id.contains(char::is_whitespace) {
            error!("experiment.id must be a non-empty identifier without whitespace");
            contains_error = true;
        }

        match self.start_dates() {
            Ok(dates) => {
                if dates.iter().duplicates().next().is_some() {
                    error!("experiment.start_dates contains duplicate dates");
                    contains_error = true;
                }
            }
            Err(e) => {
                error!("experiment.start_dates is invalid: {e}");
                contains_error = true;
            }
        }

        if let Some(member) = self.experiment.members.iter().duplicates().next() {
            error!("experiment.members contains {member} more than once");
            contains_error = true;
        }

        if self.experiment.chunk_size == 0 {
            error!("experiment.chunk_size must be at least 1");
            contains_error = true;
        }

        if self.runner.sleep == 0 {
            warn!("runner.sleep is 0, the run loop will poll platforms without pause");
        }

        if self.runner.workers == Some(0) {
            error!("runner.workers must be at least 1");
            contains_error = true;
        }

        if self.platforms.is_empty() {
            error!("No platform was defined, jobs have nowhere to run");
            contains_error = true;
        }

        if let Some(ref platform) = self.experiment.default_platform {
            if !self.platforms.contains_key(platform) {
                error!("experiment.default_platform '{platform}' is not defined in platforms");
                contains_error = true;
            }
        }

        for (name, platform) in self.platforms.iter() {
            if platform.max_processors == 0 {
                error!("platforms.{name}.max_processors must be at least 1");
                contains_error = true;
            }

            if platform.max_waiting_jobs == 0 || platform.total_jobs == 0 {
                warn!("platforms.{name} allows no submissions, jobs on it will never run");
            }

            if platform.kind == PlatformKind::Slurm {
                for key in ["scratch", "command_prefix"] {
                    if platform.parameter.get(key).is_some() && platform.parameter_str(key).is_none() {
                        error!("platforms.{name}.parameter.{key} must be a string");
                        contains_error = true;
                    }
                }

                if platform.parameter.get("timeout").is_some() && platform.parameter_u64("timeout").is_none() {
                    error!("platforms.{name}.parameter.timeout must be a number of seconds");
                    contains_error = true;
                }
            }
        }

        let sections: HashSet<String> = self.jobs.keys().cloned().collect();

        for (index, (name, section)) in self.jobs.iter_mut().enumerate() {
            if section.rank.is_none() {
                section.rank = Some(index as u32);
            }

            if name.contains(char::is_whitespace) || name.contains('_') {
                error!("jobs.{name}: section names may not contain whitespace or underscores");
                contains_error = true;
            }

            if section.frequency == 0 {
                error!("jobs.{name}.frequency must be at least 1");
                contains_error = true;
            }

            if section.splits == Some(0) {
                error!("jobs.{name}.splits must be at least 1");
                contains_error = true;
            }

            if section.synchronize.is_some() && section.running != Running::Chunk {
                error!("jobs.{name}.synchronize only applies to sections running once per chunk");
                contains_error = true;
            }

            if section.delay.is_some() && section.running != Running::Chunk {
                warn!("jobs.{name}.delay is ignored, the section does not run per chunk");
            }

            match (&section.file, &section.script) {
                (None, None) => {
                    error!("jobs.{name} needs either 'file' or 'script'");
                    contains_error = true;
                }
                (Some(_), Some(_)) => {
                    warn!("jobs.{name} contains both 'file' and 'script', 'file' takes precedence");
                }
                (Some(file), None) => {
                    let path = self.base_dir.join(file);
                    if !self.base_dir.as_os_str().is_empty() && !path.is_file() {
                        error!("jobs.{name}.file was not found at {}", path.to_string_lossy());
                        contains_error = true;
                    }
                }
                (None, Some(_)) => {}
            }

            for (field, expr) in [
                ("excluded_members", &section.excluded_members),
                ("excluded_chunks", &section.excluded_chunks),
            ] {
                if let Some(expr) = expr {
                    if let Err(e) = range::parse_indices(expr) {
                        error!("jobs.{name}.{field}: {e}");
                        contains_error = true;
                    }
                }
            }

            for (expr, filter) in section.dependencies.entries() {
                match DependencyExpr::parse(&expr) {
                    Ok(dependency) => {
                        if !sections.contains(&dependency.section) {
                            error!(
                                "jobs.{name}.dependencies references {} but it is not defined",
                                dependency.section
                            );
                            contains_error = true;
                        } else if dependency.section == *name && dependency.offset == 0 {
                            error!("jobs.{name} cannot depend on itself without an offset");
                            contains_error = true;
                        }
                    }
                    Err(e) => {
                        error!("jobs.{name}.dependencies: {e}");
                        contains_error = true;
                    }
                }

                for selector in [&filter.dates, &filter.members, &filter.chunks, &filter.splits]
                    .into_iter()
                    .flatten()
                {
                    if let Err(e) = range::Selector::parse(selector) {
                        error!("jobs.{name}.dependencies.{expr}: {e}");
                        contains_error = true;
                    }
                }
            }
        }

        for (name, section) in self.jobs.iter() {
            let Some(platform_name) = self.platform_of(section) else {
                error!("jobs.{name} has no platform and experiment.default_platform is not set");
                contains_error = true;
                continue;
            };

            let Some(platform) = self.platforms.get(platform_name) else {
                error!("jobs.{name}.platform '{platform_name}' is not defined in platforms");
                contains_error = true;
                continue;
            };

            if section.processors > platform.max_processors {
                error!(
                    "jobs.{name}.processors ({}) exceeds platforms.{platform_name}.max_processors ({})",
                    section.processors, platform.max_processors
                );
                contains_error = true;
            }

            if let Some(wallclock) = section.wallclock {
                if wallclock > platform.max_wallclock {
                    error!(
                        "jobs.{name}.wallclock ({wallclock}) exceeds platforms.{platform_name}.max_wallclock ({})",
                        platform.max_wallclock
                    );
                    contains_error = true;
                }
            }
        }

        for (name, wrapper) in self.wrappers.iter() {
            if wrapper.jobs_in_wrapper.is_empty() {
                error!("wrappers.{name}.jobs_in_wrapper is empty");
                contains_error = true;
            }

            for pattern in wrapper.jobs_in_wrapper.iter() {
                match Glob::new(pattern) {
                    Ok(glob) => {
                        let matcher = glob.compile_matcher();
                        if !sections.iter().any(|section| matcher.is_match(section)) {
                            warn!("wrappers.{name}.jobs_in_wrapper pattern '{pattern}' matches no section");
                        }
                    }
                    Err(e) => {
                        error!("wrappers.{name}.jobs_in_wrapper pattern '{pattern}' is invalid: {e}");
                        contains_error = true;
                    }
                }
            }

            if wrapper.min_wrapped == 0 {
                error!("wrappers.{name}.min_wrapped must be at least 1");
                contains_error = true;
            }

            for (axis, min, max) in [
                ("", wrapper.min_wrapped, wrapper.max_wrapped),
                ("_h", wrapper.min_wrapped_h, wrapper.max_wrapped_h),
                ("_v", wrapper.min_wrapped_v, wrapper.max_wrapped_v),
            ] {
                if let Some(max) = max {
                    if max < min {
                        error!("wrappers.{name}.max_wrapped{axis} ({max}) is below min_wrapped{axis} ({min})");
                        contains_error = true;
                    }
                }
            }

            for section in wrapper.max_per_section.keys() {
                if !sections.contains(section) {
                    error!("wrappers.{name}.max_per_section references undefined section {section}");
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_one() -> u32 {
    1
}

fn default_one_usize() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_sleep() -> u64 {
    10
}

fn default_max_platform_failures() -> u32 {
    100
}

fn default_lock_timeout() -> u64 {
    5
}

fn default_max_processors() -> u32 {
    1024
}

fn default_job_limit() -> usize {
    20
}

fn default_max_wallclock() -> Wallclock {
    Wallclock(48 * 60)
}

fn default_min_wrapped() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
experiment:
  id: a000
  start_dates: ["19900101", "19900201"]
  members: [fc0, fc1]
  num_chunks: 3
platforms:
  hpc:
    kind: slurm
    max_waiting_jobs: 4
    parameter:
      command_prefix: ssh login1
jobs:
  INI:
    running: member
    script: "echo init"
  SIM:
    running: chunk
    script: "echo %CHUNK%"
    dependencies: INI SIM-1
    wallclock: "02:00"
  POST:
    running: chunk
    script: "echo post"
    dependencies:
      SIM:
        chunks: natural
wrappers:
  sims:
    type: vertical
    jobs_in_wrapper: ["SIM"]
"#;

    #[test]
    fn parses_and_fills_defaults() {
        let config = ExperimentConfig::parse(MINIMAL, PathBuf::new()).unwrap();

        assert_eq!(config.experiment.chunk_size, 1);
        assert_eq!(config.chunks(), 1..4);
        assert_eq!(config.runner, RunnerConfig::default());
        assert_eq!(config.jobs["POST"].rank, Some(2));
        assert_eq!(config.platform_of(&config.jobs["SIM"]), Some("hpc"));
        assert_eq!(config.platforms["hpc"].capabilities().total_jobs, 20);
        assert_eq!(config.platforms["hpc"].parameter_str("command_prefix"), Some("ssh login1"));
        assert_eq!(config.wrappers["sims"].policy, PolicyMode::Flexible);
        assert_eq!(
            config.jobs["SIM"].dependencies.entries().into_iter().map(|(expr, _)| expr).collect_vec(),
            vec!["INI", "SIM-1"]
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = MINIMAL.replace("num_chunks: 3", "num_chunks: 3\n  chunks: 3");
        assert!(matches!(
            ExperimentConfig::parse(&raw, PathBuf::new()),
            Err(ConfigErrors::Parse(_))
        ));
    }

    #[test]
    fn preflight_catches_undefined_references() {
        for (from, to) in [
            ("dependencies: INI SIM-1", "dependencies: INI CLEAN"),
            ("running: member", "running: member\n    platform: archive"),
            ("wallclock: \"02:00\"", "wallclock: \"72:00\""),
            ("num_chunks: 3", "num_chunks: 3\n  default_platform: nowhere"),
        ] {
            let raw = MINIMAL.replace(from, to);
            assert!(
                matches!(ExperimentConfig::parse(&raw, PathBuf::new()), Err(ConfigErrors::Preflight)),
                "expected preflight failure after replacing {from}"
            );
        }
    }

    #[test]
    fn preflight_rejects_inverted_ranges() {
        let raw = MINIMAL.replace("script: \"echo post\"", "script: \"echo post\"\n    excluded_chunks: \"[3:1]\"");
        assert!(matches!(
            ExperimentConfig::parse(&raw, PathBuf::new()),
            Err(ConfigErrors::Preflight)
        ));
    }

    #[test]
    fn storage_backends_are_tagged() {
        let storage: StorageConfig = serde_yaml::from_str("kind: sqlite\npath: /tmp/a.db").unwrap();
        assert_eq!(
            storage,
            StorageConfig::SQLite {
                path: Some(PathBuf::from("/tmp/a.db"))
            }
        );
        assert_eq!(
            serde_yaml::from_str::<StorageConfig>("kind: file").unwrap(),
            StorageConfig::File
        );
    }

    #[test]
    fn experiment_layout() {
        let paths = ExperimentPaths::new(Path::new("/data"), "a000");
        assert_eq!(paths.config(), PathBuf::from("/data/a000/conf/experiment.yml"));
        assert_eq!(paths.lock(), PathBuf::from("/data/a000/tmp/stratus.lock"));
        assert_eq!(paths.job_list(), PathBuf::from("/data/a000/pkl/job_list_a000.json"));
    }
}
