use super::{ConnectionError, PackageRecord};
use crate::graph::JobGraph;
use parking_lot::FairMutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, trace};

/// JSON snapshot of the graph plus a JSON package index next to it
#[derive(Debug)]
pub struct FileStore {
    graph: PathBuf,
    packages: PathBuf,
    // serializes read-modify-write of the package index
    index_lock: FairMutex<()>,
}

impl FileStore {
    pub fn new(graph: PathBuf, packages: PathBuf) -> Self {
        Self {
            graph,
            packages,
            index_lock: FairMutex::new(()),
        }
    }

    pub fn exists(&self) -> bool {
        self.graph.exists()
    }

    pub fn load(&self) -> Result<JobGraph, ConnectionError> {
        if !self.exists() {
            return Err(ConnectionError::Missing);
        }

        read_json(&self.graph)
    }

    pub fn save(&self, graph: &JobGraph, packages: &[PackageRecord]) -> Result<(), ConnectionError> {
        let _guard = self.index_lock.lock();

        write_atomic(&self.graph, graph)?;
        write_atomic(&self.packages, &packages)
    }

    pub fn record_package(&self, record: &PackageRecord) -> Result<(), ConnectionError> {
        let _guard = self.index_lock.lock();

        let mut packages = self.read_packages()?;
        packages.retain(|existing| existing.name != record.name);
        packages.push(record.clone());

        write_atomic(&self.packages, &packages)
    }

    pub fn load_packages(&self) -> Result<Vec<PackageRecord>, ConnectionError> {
        let _guard = self.index_lock.lock();
        self.read_packages()
    }

    fn read_packages(&self) -> Result<Vec<PackageRecord>, ConnectionError> {
        if self.packages.exists() {
            read_json(&self.packages)
        } else {
            Ok(Vec::new())
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConnectionError + '_ {
    move |source| ConnectionError::Io {
        path: path.to_owned(),
        source,
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConnectionError> {
    let file = File::open(path).map_err(io_error(path))?;
    trace!(path = ?path, "Reading snapshot");

    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Write to `<path>.tmp`, flush it to disk and rename it over `path`. Readers see
/// either the old or the new file, never a partial one.
pub fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ConnectionError> {
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);

    {
        let file = File::create(&temporary).map_err(io_error(&temporary))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush().map_err(io_error(&temporary))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(io_error(&temporary))?;
    }

    fs::rename(&temporary, path).map_err(io_error(path))?;

    if let Some(parent) = path.parent() {
        // persist the rename itself
        if let Ok(directory) = File::open(parent) {
            let _ = directory.sync_all();
        }
    }

    debug!(path = ?path, "Wrote snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{sample_graph, sample_packages};

    #[test]
    fn package_index_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("graph.json"), dir.path().join("packages.json"));

        assert!(matches!(store.load(), Err(ConnectionError::Missing)));
        assert!(store.load_packages().unwrap().is_empty());

        let record = sample_packages().remove(0);
        store.record_package(&record).unwrap();
        store.record_package(&record).unwrap();

        let mut other = record.clone();
        other.name = "a000_2_SIM".into();
        store.record_package(&other).unwrap();

        assert_eq!(store.load_packages().unwrap(), vec![record, other]);
    }

    #[test]
    fn atomic_writes_leave_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let store = FileStore::new(path.clone(), dir.path().join("packages.json"));

        store.save(&sample_graph(), &[]).unwrap();
        store.save(&sample_graph(), &[]).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("graph.json.tmp").exists());
        assert_eq!(store.load().unwrap(), sample_graph());
    }
}
