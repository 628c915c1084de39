use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::{Builder, TempDir};

use crate::error::Pacs2TarError;
use crate::table::TableSchema;

pub const STUDY_TABLE_FILE: &str = "study_metadata.tsv";
pub const SERIES_TABLE_FILE: &str = "series_metadata.tsv";
pub const LEDGER_FILE: &str = "downloaded_uids.txt";

/// Output directory layout plus the scratch area used for retrievals.
#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
    temp_root: Utf8PathBuf,
}

impl Store {
    pub fn new(output_root: Utf8PathBuf) -> Result<Self, Pacs2TarError> {
        let temp_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.cache_dir().join("pacs2tar").join("tmp")).ok()
            })
            .ok_or_else(|| {
                Pacs2TarError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self {
            output_root,
            temp_root,
        })
    }

    pub fn new_with_paths(output_root: Utf8PathBuf, temp_root: Utf8PathBuf) -> Self {
        Self {
            output_root,
            temp_root,
        }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn temp_root(&self) -> &Utf8Path {
        &self.temp_root
    }

    pub fn table_path(&self, schema: TableSchema) -> Utf8PathBuf {
        match schema {
            TableSchema::Study => self.output_root.join(STUDY_TABLE_FILE),
            TableSchema::Series => self.output_root.join(SERIES_TABLE_FILE),
        }
    }

    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.output_root.join(LEDGER_FILE)
    }

    pub fn ensure_output_root(&self) -> Result<(), Pacs2TarError> {
        fs::create_dir_all(self.output_root.as_std_path())
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))
    }

    pub fn ensure_temp_root(&self) -> Result<(), Pacs2TarError> {
        fs::create_dir_all(self.temp_root.as_std_path())
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))
    }

    /// Scoped scratch directory for one study; removed when dropped.
    pub fn study_work_dir(&self, study_uid: &str) -> Result<TempDir, Pacs2TarError> {
        self.ensure_temp_root()?;
        Builder::new()
            .prefix(&format!("{study_uid}-"))
            .tempdir_in(self.temp_root.as_std_path())
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_dirs_are_removed_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("out"), root.join("tmp"));

        let work = store.study_work_dir("1.2.3").unwrap();
        let path = work.path().to_path_buf();
        assert!(path.starts_with(root.join("tmp").as_std_path()));
        assert!(path.exists());
        drop(work);
        assert!(!path.exists());
        assert_eq!(store.ledger_path(), root.join("out").join(LEDGER_FILE));
    }
}
