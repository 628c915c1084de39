use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::domain::Series;
use crate::error::Pacs2TarError;
use crate::table::{Table, TableSchema, read_table};

/// Allow-list of series per study, taken from an edited series-level export.
///
/// Only the metadata export is restricted; retrieval always fetches whole studies.
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    allowed: HashMap<String, HashSet<String>>,
}

impl SeriesFilter {
    /// Loads a filter table; `declared` takes precedence over header sniffing.
    pub fn load(path: &Path, declared: Option<TableSchema>) -> Result<Self, Pacs2TarError> {
        let table = read_table(path)?;
        let schema = declared.or_else(|| table.schema());
        if schema != Some(TableSchema::Series) {
            return Err(Pacs2TarError::SchemaMismatch {
                path: path.to_path_buf(),
                expected: "series-level".to_string(),
                found: match schema {
                    Some(TableSchema::Study) => "study-level".to_string(),
                    _ => "unrecognized".to_string(),
                },
            });
        }
        Self::from_table(&table).ok_or_else(|| Pacs2TarError::Table {
            path: path.to_path_buf(),
            message: "series filter needs StudyInstanceUID and SeriesInstanceUID columns"
                .to_string(),
        })
    }

    /// Loads a table declared to be a series-level export, as `--series-filter` expects.
    pub fn load_series_export(path: &Path) -> Result<Self, Pacs2TarError> {
        Self::load(path, Some(TableSchema::Series))
    }

    pub fn from_table(table: &Table) -> Option<Self> {
        let study_column = table.column("StudyInstanceUID")?;
        let series_column = table.column("SeriesInstanceUID")?;
        let mut filter = Self::default();
        for row in &table.rows {
            let (Some(study), Some(series)) = (row.get(study_column), row.get(series_column))
            else {
                continue;
            };
            filter.allow(study.trim(), series.trim());
        }
        Some(filter)
    }

    pub fn allow(&mut self, study_uid: &str, series_uid: &str) {
        if study_uid.is_empty() || series_uid.is_empty() {
            return;
        }
        self.allowed
            .entry(study_uid.to_string())
            .or_default()
            .insert(series_uid.to_string());
    }

    pub fn allows(&self, study_uid: &str, series_uid: &str) -> bool {
        self.allowed
            .get(study_uid)
            .is_some_and(|series| series.contains(series_uid))
    }

    pub fn study_count(&self) -> usize {
        self.allowed.len()
    }

    /// Keeps only the listed series of a study.
    pub fn retain(&self, study_uid: &str, series: Vec<Series>) -> Vec<Series> {
        series
            .into_iter()
            .filter(|series| self.allows(study_uid, &series.series_instance_uid))
            .collect()
    }
}
