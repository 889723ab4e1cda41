use super::{graph_from_rows, packages_from_rows, ConnectionError, PackageRecord};
use crate::graph::JobGraph;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{fmt::Debug, path::Path, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Debug)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        self.lock().init()
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
        let connection = Connection::open(path)?;
        debug!(path = ?path, "Opened SQLite database");

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
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
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close SQLite connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    fn expid(&self) -> Result<Option<String>, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached("select value from meta where key = 'expid'")?
            .query_row([], |row| row.get(0))
            .optional()?)
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
        // a failed save leaves the previous snapshot untouched
        let mut tx = self.connection.transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        for table in ["meta", "jobs", "edges", "packages"] {
            tx.execute(&format!("delete from {table}"), [])?;
        }

        tx.execute(
            "insert into meta (key, value) values ('expid', ?)",
            params![graph.expid()],
        )?;

        {
            let mut insert = tx.prepare_cached(
                "insert into jobs
                 (position, name, section, status, platform_id, fail_count, data)
                 values (?, ?, ?, ?, ?, ?, ?)",
            )?;

            for (position, job) in graph.iter() {
                insert.execute(params![
                    position as i64,
                    job.name,
                    job.section,
                    job.status() as i8,
                    job.id,
                    job.fail_count,
                    serde_json::to_string(job)?
                ])?;
            }

            let mut insert = tx.prepare_cached("insert into edges (parent, child) values (?, ?)")?;
            for (parent, child) in graph.edges() {
                insert.execute(params![parent, child])?;
            }
        }

        for record in packages {
            insert_package(&tx, record)?;
        }

        tx.commit()?;

        Ok(())
    }

    pub fn record_package(&self, record: &PackageRecord) -> Result<(), ConnectionError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

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

fn insert_package(connection: &Connection, record: &PackageRecord) -> Result<(), ConnectionError> {
    let mut insert = connection
        .prepare_cached("insert into packages (name, platform, position, job) values (?, ?, ?, ?)")?;

    for (position, job) in record.jobs.iter().enumerate() {
        insert.execute(params![record.name, record.platform, position as i64, job])?;
    }

    Ok(())
}

pub const SQL_SCHEMA: [&str; 4] = [
    "create table if not exists meta (
    key text primary key,
    value text not null
);",
    "create table if not exists jobs (
    position integer primary key,
    name text not null unique,
    section text not null,
    status tinyint not null,
    platform_id text,
    fail_count integer not null,
    data text not null
);",
    "create table if not exists edges (
    parent text not null,
    child text not null,
    primary key (parent, child)
);",
    "create table if not exists packages (
    name text not null,
    platform text not null,
    position integer not null,
    job text not null,
    primary key (name, position)
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
