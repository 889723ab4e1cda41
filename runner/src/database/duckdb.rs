use super::{graph_from_rows, packages_from_rows, ConnectionError, PackageRecord};
use crate::graph::JobGraph;
use duckdb::params;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use std::{fmt::Debug, path::Path, sync::Arc};
use tracing::{debug, error, info, trace};
use tracing_unwrap::ResultExt;

#[derive(Debug)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: duckdb::Connection,
}

impl From<duckdb::Error> for ConnectionError {
    fn from(value: duckdb::Error) -> Self {
        ConnectionError::DuckDB(value)
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock_mut(&mut self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        self.lock_mut().init()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    pub fn exists(&self) -> Result<bool, ConnectionError> {
        self.lock().exists()
    }

    pub fn load_graph(&self) -> Result<JobGraph, ConnectionError> {
        self.lock().load_graph()
    }

    pub fn save(&self, graph: &JobGraph, packages: &[PackageRecord]) -> Result<(), ConnectionError> {
        self.lock().save(graph, packages)
    }

    pub fn record_package(&self, record: &PackageRecord) -> Result<(), ConnectionError> {
        self.lock().record_package(record)
    }

    pub fn load_packages(&self) -> Result<Vec<PackageRecord>, ConnectionError> {
        self.lock().load_packages()
    }
}

impl InnerConnection {
    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let connection = duckdb::Connection::open(path)?;
        debug!(path = ?path, "Opened DuckDB database");

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(e) => {
                    error!("Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {e}");
                    trace!("schema: {table}");

                    return Err(ConnectionError::DuckDB(e));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close duckdb connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close DuckDB connection, giving up");

                return Err(ConnectionError::DuckDB(error));
            }
        }

        info!("Closed DuckDB connection");

        Ok(())
    }

    fn expid(&self) -> Result<Option<String>, ConnectionError> {
        let mut rows = self
            .connection
            .prepare_cached("select value from meta where key = 'expid'")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows.pop())
    }

    pub fn exists(&self) -> Result<bool, ConnectionError> {
        Ok(self.expid()?.is_some())
    }

    pub fn load_graph(&self) -> Result<JobGraph, ConnectionError> {
        let expid = self.expid()?.ok_or(ConnectionError::Missing)?;

        let jobs = self
            .connection
            .prepare_cached("select data from jobs order by position")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let edges = self
            .connection
            .prepare_cached("select parent, child from edges")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;

        graph_from_rows(expid, jobs, edges)
    }

    pub fn save(&mut self, graph: &JobGraph, packages: &[PackageRecord]) -> Result<(), ConnectionError> {
        let tx = self.connection.transaction()?;

        for table in ["meta", "jobs", "edges", "packages"] {
            tx.execute(&format!("delete from {table}"), [])?;
        }

        tx.execute(
            "insert into meta values ('expid', ?)",
            params![graph.expid()],
        )?;

        {
            let mut appender = tx.appender("jobs")?;

            for (position, job) in graph.iter() {
                appender.append_row(params![
                    position as i64,
                    job.name,
                    job.section,
                    job.status() as i8,
                    job.id,
                    job.fail_count,
                    serde_json::to_string(job)?
                ])?;
            }
        }

        {
            let mut appender = tx.appender("edges")?;

            for (parent, child) in graph.edges() {
                appender.append_row(params![parent, child])?;
            }
        }

        for record in packages {
            insert_package(&tx, record)?;
        }

        tx.commit()?;
        trace!(jobs = graph.len(), "Replaced DuckDB snapshot");

        Ok(())
    }

    pub fn record_package(&mut self, record: &PackageRecord) -> Result<(), ConnectionError> {
        let tx = self.connection.transaction()?;

        tx.execute("delete from packages where name = ?", params![record.name])?;
        insert_package(&tx, record)?;
        tx.commit()?;

        debug!(package = %record.name, jobs = record.jobs.len(), "Recorded package");

        Ok(())
    }

    pub fn load_packages(&self) -> Result<Vec<PackageRecord>, ConnectionError> {
        let rows = self
            .connection
            .prepare_cached("select name, platform, job from packages order by name, position")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<(String, String, String)>, _>>()?;

        Ok(packages_from_rows(rows))
    }
}

fn insert_package(connection: &duckdb::Connection, record: &PackageRecord) -> Result<(), ConnectionError> {
    let mut insert = connection.prepare_cached("insert into packages values (?, ?, ?, ?)")?;

    for (position, job) in record.jobs.iter().enumerate() {
        insert.execute(params![record.name, record.platform, position as i64, job])?;
    }

    Ok(())
}

pub const SQL_SCHEMA: [&str; 4] = [
    "create table if not exists meta (
    key varchar primary key,
    value varchar not null
);",
    "create table if not exists jobs (
    position bigint primary key,
    name varchar not null unique,
    section varchar not null,
    status tinyint not null,
    platform_id varchar,
    fail_count integer not null,
    data varchar not null
);",
    "create table if not exists edges (
    parent varchar not null,
    child varchar not null
);",
    "create table if not exists packages (
    name varchar not null,
    platform varchar not null,
    position bigint not null,
    job varchar not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
