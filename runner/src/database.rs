//! Durable state of an experiment: the job graph snapshot and the index of
//! submitted packages.
//!
//! Three adapters share one interface. The default flat-file adapter writes JSON
//! snapshots atomically (temporary file, fsync, rename); the relational adapters
//! replace the stored graph inside a single transaction.

#[cfg(feature = "duckdb")]
pub mod duckdb;
pub mod file;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::{
    config::{ExperimentPaths, StorageConfig},
    graph::{GraphError, GraphSnapshot, JobGraph},
    job::Job,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to (de)serialize state: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Stored graph is inconsistent: {0}")]
    Graph(#[from] GraphError),
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SQLite(rusqlite::Error),
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDB(::duckdb::Error),
    #[error("Storage backend {0} was not compiled in")]
    Unsupported(&'static str),
    #[error("No job graph stored for this experiment")]
    Missing,
}

/// Row of the package index: which jobs went out together under which name
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub platform: String,
    pub jobs: Vec<String>,
}

#[derive(Debug)]
pub enum StorageAdapters {
    File(file::FileStore),
    #[cfg(feature = "sqlite")]
    SQLite(sqlite::SharedConnection),
    #[cfg(feature = "duckdb")]
    DuckDB(duckdb::SharedConnection),
}

impl StorageAdapters {
    /// Open the configured backend and make sure its schema exists
    pub fn load(config: &StorageConfig, paths: &ExperimentPaths) -> Result<Self, ConnectionError> {
        let mut adapter = match config {
            StorageConfig::File => Self::File(file::FileStore::new(paths.job_list(), paths.packages())),
            #[cfg(feature = "sqlite")]
            StorageConfig::SQLite { path } => Self::SQLite(sqlite::SharedConnection::load(
                &path.clone().unwrap_or_else(|| paths.database("db")),
            )?),
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::SQLite { .. } => return Err(ConnectionError::Unsupported("sqlite")),
            #[cfg(feature = "duckdb")]
            StorageConfig::DuckDB { path } => Self::DuckDB(duckdb::SharedConnection::load(
                &path.clone().unwrap_or_else(|| paths.database("duckdb")),
            )?),
            #[cfg(not(feature = "duckdb"))]
            StorageConfig::DuckDB { .. } => return Err(ConnectionError::Unsupported("duckdb")),
        };

        adapter.init()?;
        debug!(adapter = adapter.kind(), "Opened experiment storage");

        Ok(adapter)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            #[cfg(feature = "sqlite")]
            Self::SQLite(_) => "sqlite",
            #[cfg(feature = "duckdb")]
            Self::DuckDB(_) => "duckdb",
        }
    }

    fn init(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::File(_) => Ok(()),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.init(),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.init(),
        }
    }

    /// Whether a graph was saved before
    pub fn exists(&self) -> Result<bool, ConnectionError> {
        match self {
            Self::File(store) => Ok(store.exists()),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.exists(),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.exists(),
        }
    }

    pub fn load_graph(&self) -> Result<JobGraph, ConnectionError> {
        let graph = match self {
            Self::File(store) => store.load(),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.load_graph(),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.load_graph(),
        }?;

        info!(jobs = graph.len(), adapter = self.kind(), "Loaded job graph");
        Ok(graph)
    }

    /// Replace the stored graph and package index in one step
    pub fn save(&self, graph: &JobGraph, packages: &[PackageRecord]) -> Result<(), ConnectionError> {
        match self {
            Self::File(store) => store.save(graph, packages),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.save(graph, packages),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.save(graph, packages),
        }?;

        debug!(jobs = graph.len(), packages = packages.len(), "Saved job graph");
        Ok(())
    }

    pub fn record_package(&self, record: &PackageRecord) -> Result<(), ConnectionError> {
        match self {
            Self::File(store) => store.record_package(record),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.record_package(record),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.record_package(record),
        }
    }

    pub fn load_packages(&self) -> Result<Vec<PackageRecord>, ConnectionError> {
        match self {
            Self::File(store) => store.load_packages(),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.load_packages(),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.load_packages(),
        }
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        match self {
            Self::File(_) => Ok(()),
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.close(),
            #[cfg(feature = "duckdb")]
            Self::DuckDB(connection) => connection.close(),
        }
    }
}

/// Rebuild a graph from rows read by a relational adapter
pub(crate) fn graph_from_rows(
    expid: String,
    jobs: Vec<String>,
    edges: Vec<(String, String)>,
) -> Result<JobGraph, ConnectionError> {
    let jobs = jobs
        .iter()
        .map(|data| serde_json::from_str::<Job>(data))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(JobGraph::from_snapshot(GraphSnapshot { expid, jobs, edges })?)
}

/// Group `(name, platform, job)` rows, already ordered by name and position
pub(crate) fn packages_from_rows(rows: Vec<(String, String, String)>) -> Vec<PackageRecord> {
    let mut records: Vec<PackageRecord> = Vec::new();

    for (name, platform, job) in rows {
        match records.last_mut() {
            Some(record) if record.name == name => record.jobs.push(job),
            _ => records.push(PackageRecord {
                name,
                platform,
                jobs: vec![job],
            }),
        }
    }

    records
}
