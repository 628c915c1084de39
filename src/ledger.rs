use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use tracing::debug;

use crate::error::Pacs2TarError;

/// Append-only record of studies that were fully archived.
///
/// One `UID<TAB>timestamp` line per study. Lines holding only a UID are accepted as well.
#[derive(Debug)]
pub struct DownloadLedger {
    path: PathBuf,
    recorded: HashSet<String>,
}

impl DownloadLedger {
    /// Opens the ledger at `path`; a missing or empty file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, Pacs2TarError> {
        let mut ledger = Self {
            path: path.to_path_buf(),
            recorded: HashSet::new(),
        };
        ledger.recorded = ledger.read_entries()?;
        debug!(path = %path.display(), entries = ledger.recorded.len(), "ledger loaded");
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.recorded.contains(uid)
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// Durably records `uid`. Entries already present are not written twice.
    pub fn append(&mut self, uid: &str) -> Result<(), Pacs2TarError> {
        if self.recorded.contains(uid) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.error(err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.error(err))?;
        FileExt::lock_exclusive(&file).map_err(|err| self.error(err))?;
        let line = format!(
            "{uid}\t{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let result = file
            .write_all(line.as_bytes())
            .and_then(|_| file.sync_data());
        FileExt::unlock(&file).map_err(|err| self.error(err))?;
        result.map_err(|err| self.error(err))?;
        self.recorded.insert(uid.to_string());
        Ok(())
    }

    fn read_entries(&self) -> Result<HashSet<String>, Pacs2TarError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => return Err(self.error(err)),
        };
        FileExt::lock_shared(&file).map_err(|err| self.error(err))?;
        let mut content = String::new();
        let result = file.read_to_string(&mut content);
        FileExt::unlock(&file).map_err(|err| self.error(err))?;
        result.map_err(|err| self.error(err))?;

        Ok(content
            .lines()
            .filter_map(|line| line.split('\t').next())
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn error(&self, err: io::Error) -> Pacs2TarError {
        Pacs2TarError::Ledger {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DownloadLedger::load(&dir.path().join("downloaded_uids.txt")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn append_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloaded_uids.txt");
        let mut ledger = DownloadLedger::load(&path).unwrap();
        ledger.append("1.2.3").unwrap();
        ledger.append("1.2.3").unwrap();
        ledger.append("1.2.4").unwrap();

        let reloaded = DownloadLedger::load(&path).unwrap();
        assert!(reloaded.contains("1.2.3"));
        assert!(reloaded.contains("1.2.4"));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn bare_uid_lines_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloaded_uids.txt");
        fs::write(&path, "1.2.3\n\n1.2.4\t2024-01-01T00:00:00Z\n").unwrap();
        let ledger = DownloadLedger::load(&path).unwrap();
        assert!(ledger.contains("1.2.3"));
        assert!(ledger.contains("1.2.4"));
    }

    #[test]
    fn unreadable_ledger_is_a_ledger_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DownloadLedger::load(dir.path()).unwrap_err();
        assert!(err.is_run_fatal());
    }
}
