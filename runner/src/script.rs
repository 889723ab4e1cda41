//! Job parameters and the scripts submitted to platforms.
//!
//! Every job exposes a parameter map built from its coordinates, resources and
//! section `parameters`. Section scripts reference parameters as `%KEY%`. A package
//! is rendered into one bash script: each member job becomes a function running its
//! body through the section's interpreter, and the package layout becomes nested
//! sequential and parallel blocks. A job that exits successfully leaves
//! `<JOBNAME>_COMPLETED` next to its logs, which is the only evidence of success the
//! run loop trusts.

use crate::{
    calendar::{self, CalendarError},
    config::ExperimentConfig,
    graph::JobGraph,
    job::{Job, JobId, JobType},
    packager::{Layout, Package},
    platforms::Submission,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Suffix of the file a job leaves behind on success
pub const COMPLETED_SUFFIX: &str = "_COMPLETED";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Failed to read script {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Section {0} is not defined")]
    UnknownSection(String),
    #[error("Section {0} defines neither a file nor a script")]
    MissingSource(String),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

pub fn marker_name(job: &str) -> String {
    format!("{job}{COMPLETED_SUFFIX}")
}

/// Parameters visible to the script of `job`. Built-in keys shadow section
/// parameters of the same name.
pub fn parameters(config: &ExperimentConfig, job: &Job) -> Result<BTreeMap<String, String>, ScriptError> {
    let experiment = &config.experiment;
    let section = config
        .jobs
        .get(&job.section)
        .ok_or_else(|| ScriptError::UnknownSection(job.section.clone()))?;

    let mut parameters = section.parameter_values();
    let mut builtins: Vec<(&str, String)> = vec![
        ("EXPID", experiment.id.clone()),
        ("JOBNAME", job.name.clone()),
        ("SECTION", job.section.clone()),
        ("CURRENT_PLATFORM", job.platform().to_owned()),
        ("CURRENT_QUEUE", job.resources.queue.clone().unwrap_or_default()),
        ("NUMPROC", job.resources.processors.to_string()),
        ("NUMTASK", job.resources.tasks.to_string()),
        ("NUMTHREADS", job.resources.threads.to_string()),
        ("NODES", job.resources.nodes.to_string()),
        ("WALLCLOCK", job.resources.wallclock.to_string()),
        ("RETRIALS", job.retrials.to_string()),
        ("FAIL_COUNT", job.fail_count.to_string()),
    ];

    if let Some(memory) = job.resources.memory {
        builtins.push(("MEMORY", memory.to_string()));
    }
    if let Some(member) = &job.member {
        builtins.push(("MEMBER", member.clone()));
    }
    if let Some(split) = job.split {
        builtins.push(("SPLIT", split.to_string()));
    }
    if let Some(splits) = job.splits {
        builtins.push(("SPLITS", splits.to_string()));
    }

    if let Some(date) = job.date {
        let format = calendar::date_format_for(&config.start_dates()?);
        builtins.push(("SDATE", calendar::format_date(&date, format)));

        if let Some(chunk) = job.chunk {
            let start = calendar::chunk_start_date(
                date,
                chunk,
                experiment.chunk_size,
                experiment.chunk_unit,
                experiment.calendar,
            )?;
            let end = calendar::previous_day(
                calendar::chunk_end_date(
                    date,
                    chunk,
                    experiment.chunk_size,
                    experiment.chunk_unit,
                    experiment.calendar,
                )?,
                experiment.calendar,
            )?;

            builtins.push(("CHUNK_START_DATE", calendar::format_date(&start, format)));
            builtins.push(("CHUNK_END_DATE", calendar::format_date(&end, format)));
        }
    }

    if let Some(chunk) = job.chunk {
        let last = experiment.chunk_ini + experiment.num_chunks.saturating_sub(1);

        builtins.push(("CHUNK", chunk.to_string()));
        builtins.push(("CHUNK_FIRST", flag(chunk == experiment.chunk_ini)));
        builtins.push(("CHUNK_LAST", flag(chunk == last)));
    }

    for (key, value) in builtins {
        if parameters.insert(key.to_owned(), value).is_some() {
            debug!(job = %job.name, key = key, "Section parameter shadowed by built-in value");
        }
    }

    Ok(parameters)
}

fn flag(value: bool) -> String {
    if value { "TRUE" } else { "FALSE" }.to_owned()
}

/// Replace every `%KEY%` found in `parameters`. Unknown placeholders stay as they
/// are and are returned so the caller can report them.
pub fn substitute(template: &str, parameters: &BTreeMap<String, String>) -> (String, BTreeSet<String>) {
    let mut output = String::with_capacity(template.len());
    let mut unknown = BTreeSet::new();
    let mut rest = template;

    while let Some(start) = rest.find('%') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find('%') {
            Some(end) if is_key(&after[..end]) => {
                let key = &after[..end];

                match parameters.get(key) {
                    Some(value) => output.push_str(value),
                    None => {
                        unknown.insert(key.to_owned());
                        output.push('%');
                        output.push_str(key);
                        output.push('%');
                    }
                }

                rest = &after[end + 1..];
            }
            _ => {
                output.push('%');
                rest = after;
            }
        }
    }

    output.push_str(rest);
    (output, unknown)
}

fn is_key(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Section script of `job` with its parameters filled in
pub fn job_body(config: &ExperimentConfig, job: &Job) -> Result<String, ScriptError> {
    let section = config
        .jobs
        .get(&job.section)
        .ok_or_else(|| ScriptError::UnknownSection(job.section.clone()))?;

    let template = match (&section.script, config.script_source(section)) {
        (Some(script), _) => script.clone(),
        (None, Some(path)) => {
            fs::read_to_string(&path).map_err(|source| ScriptError::Io { path, source })?
        }
        (None, None) => return Err(ScriptError::MissingSource(job.section.clone())),
    };

    let (body, unknown) = substitute(&template, &parameters(config, job)?);

    if !unknown.is_empty() {
        warn!(job = %job.name, placeholders = ?unknown, "Script contains unknown placeholders");
    }

    Ok(body)
}

fn stdin_command(job_type: JobType) -> String {
    let flag = match job_type {
        JobType::Bash => "-s",
        JobType::Python | JobType::R => "-",
    };

    format!("{} {flag}", job_type.interpreter())
}

/// Bash script running every job of `package` in its layout. Logs and completion
/// markers go to `remote_dir`. The caller adds the shebang and any scheduler header.
pub fn render_package(
    config: &ExperimentConfig,
    graph: &JobGraph,
    package: &Package,
    remote_dir: &Path,
) -> Result<String, ScriptError> {
    let mut script = String::new();
    let positions: BTreeMap<JobId, usize> = package
        .jobs
        .iter()
        .enumerate()
        .map(|(position, id)| (*id, position))
        .collect();

    // writing to a String cannot fail
    let _ = writeln!(script, "# {} ({}, {} jobs)", package.name, package.topology, package.jobs.len());
    let _ = writeln!(script, "set -u");
    let _ = writeln!(script, "STRATUS_DIR={}", quote(&remote_dir.to_string_lossy()));
    let _ = writeln!(script, "cd \"$STRATUS_DIR\" || exit 1");
    script.push('\n');

    for (position, id) in package.jobs.iter().enumerate() {
        let job = graph.job(*id);
        let delimiter = format!("STRATUS_JOB_{position}_EOF");

        let _ = writeln!(script, "rm -f \"$STRATUS_DIR/{}\"", marker_name(&job.name));
        let _ = writeln!(script, "job_{position}() {{");
        let _ = writeln!(script, "{} <<'{delimiter}'", stdin_command(job.job_type));
        script.push_str(&job_body(config, job)?);
        if !script.ends_with('\n') {
            script.push('\n');
        }
        let _ = writeln!(script, "{delimiter}");
        let _ = writeln!(script, "}}\n");
    }

    script.push_str(
        "run_job() {\n    \
             if \"job_$1\" > \"$STRATUS_DIR/$2.out\" 2> \"$STRATUS_DIR/$2.err\"; then\n        \
                 touch \"$STRATUS_DIR/$2_COMPLETED\"\n    \
             else\n        \
                 return 1\n    \
             fi\n\
         }\n\n",
    );

    render_layout(&mut script, &package.layout, graph, &positions, 0);
    script.push('\n');

    Ok(script)
}

fn render_layout(
    script: &mut String,
    layout: &Layout,
    graph: &JobGraph,
    positions: &BTreeMap<JobId, usize>,
    depth: usize,
) {
    let indent = "    ".repeat(depth);

    match layout {
        Layout::Job(id) => {
            let position = positions.get(id).copied().unwrap_or_default();
            let _ = write!(script, "{indent}run_job {position} {}", graph.job(*id).name);
        }
        Layout::Sequential(steps) => {
            let _ = writeln!(script, "{indent}(");
            for step in steps {
                render_layout(script, step, graph, positions, depth + 1);
                script.push_str(" || exit 1\n");
            }
            let _ = write!(script, "{indent})");
        }
        Layout::Parallel(steps) => {
            let inner = "    ".repeat(depth + 1);

            let _ = writeln!(script, "{indent}(");
            let _ = writeln!(script, "{inner}pids=\"\"");
            for step in steps {
                render_layout(script, step, graph, positions, depth + 1);
                script.push_str(" &\n");
                let _ = writeln!(script, "{inner}pids=\"$pids $!\"");
            }
            let _ = writeln!(script, "{inner}status=0");
            let _ = writeln!(script, "{inner}for pid in $pids; do wait \"$pid\" || status=1; done");
            let _ = writeln!(script, "{inner}exit $status");
            let _ = write!(script, "{indent})");
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Everything a platform needs to submit `package`
pub fn submission(
    config: &ExperimentConfig,
    graph: &JobGraph,
    package: &Package,
    remote_dir: &Path,
) -> Result<Submission, ScriptError> {
    let jobs = package.jobs.iter().map(|id| graph.job(*id));

    Ok(Submission {
        name: package.name.clone(),
        script: render_package(config, graph, package, remote_dir)?,
        hold: package.hold,
        wallclock: package.wallclock,
        processors: package.processors,
        nodes: jobs.clone().map(|job| job.resources.nodes).max().unwrap_or_default(),
        memory: jobs.clone().filter_map(|job| job.resources.memory).max(),
        queue: jobs.filter_map(|job| job.resources.queue.clone()).next(),
    })
}
