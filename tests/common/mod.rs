#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use pacs2tar::app::{App, RetryPolicy, RunMode, RunOptions};
use pacs2tar::archive::ArchiveOptions;
use pacs2tar::domain::{AttributeSet, QueryLevel};
use pacs2tar::error::Pacs2TarError;
use pacs2tar::pacs::PacsClient;
use pacs2tar::query::DateExpr;
use pacs2tar::reader::AttributeReader;
use pacs2tar::store::Store;
use pacs2tar::table::{TableSchema, WriteMode};

pub struct MockSeries {
    pub uid: String,
    pub number: u32,
    pub description: String,
    pub image_type: String,
    pub instances: usize,
}

pub struct MockStudy {
    pub uid: String,
    pub patient_name: String,
    pub study_date: String,
    pub study_description: String,
    pub birth_date: String,
    pub series: Vec<MockSeries>,
}

impl MockStudy {
    pub fn new(uid: &str, patient_name: &str, study_date: &str, counts: &[usize]) -> Self {
        let series = counts
            .iter()
            .enumerate()
            .map(|(index, count)| MockSeries {
                uid: format!("{uid}.{}", index + 1),
                number: index as u32 + 1,
                description: format!("series{}", index + 1),
                image_type: if index == 1 {
                    "DERIVED\\PRIMARY\\MOCO".to_string()
                } else {
                    "ORIGINAL\\PRIMARY\\M\\ND".to_string()
                },
                instances: *count,
            })
            .collect();
        Self {
            uid: uid.to_string(),
            patient_name: patient_name.to_string(),
            study_date: study_date.to_string(),
            study_description: "Khan^NeuroAnalytics".to_string(),
            birth_date: "19850315".to_string(),
            series,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.series.iter().map(|series| series.instances).sum()
    }

    /// Response attributes, reachable by keyword and by tag like parsed findscu output.
    fn attributes(&self) -> AttributeSet {
        AttributeSet::new()
            .with("StudyInstanceUID", self.uid.as_str())
            .with("PatientName", self.patient_name.as_str())
            .with("PatientID", format!("ID{}", self.patient_name))
            .with("StudyDate", self.study_date.as_str())
            .with("StudyDescription", self.study_description.as_str())
            .with("PatientBirthDate", self.birth_date.as_str())
            .with("00100030", self.birth_date.as_str())
    }
}

/// In-process archive serving fixed studies; Get writes key=value instance files.
#[derive(Default)]
pub struct MockPacs {
    pub studies: Vec<MockStudy>,
    pub finds: Mutex<Vec<QueryLevel>>,
    pub gets: Mutex<Vec<String>>,
    pub failing: HashSet<String>,
    /// Studies whose last series is never delivered.
    pub partial: HashSet<String>,
    /// Studies still being sent to the archive: the instance count keeps growing for
    /// this many count queries before it settles.
    pub arriving: HashMap<String, usize>,
    pub count_queries: Mutex<HashMap<String, usize>>,
}

impl MockPacs {
    pub fn new(studies: Vec<MockStudy>) -> Self {
        Self {
            studies,
            ..Self::default()
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.lock().unwrap().len()
    }

    pub fn find_count(&self) -> usize {
        self.finds.lock().unwrap().len()
    }

    pub fn count_query_count(&self, uid: &str) -> usize {
        self.count_queries.lock().unwrap().get(uid).copied().unwrap_or(0)
    }

    fn related_instances(&self, study: &MockStudy) -> usize {
        let mut queries = self.count_queries.lock().unwrap();
        let seen = queries.entry(study.uid.clone()).or_default();
        let reported = match self.arriving.get(&study.uid) {
            Some(limit) if *seen < *limit => *seen,
            _ => study.instance_count(),
        };
        *seen += 1;
        reported
    }
}

fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if let Some(position) = rest.find(part) {
            rest = &rest[position + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || parts.last().is_none_or(|last| value.ends_with(last))
}

impl PacsClient for MockPacs {
    fn find(
        &self,
        level: QueryLevel,
        filter: &AttributeSet,
    ) -> Result<Vec<AttributeSet>, Pacs2TarError> {
        self.finds.lock().unwrap().push(level);
        match level {
            QueryLevel::Study => {
                let date: DateExpr = filter.text("StudyDate").parse()?;
                Ok(self
                    .studies
                    .iter()
                    .filter(|study| {
                        let uid = filter.text("StudyInstanceUID");
                        (uid.is_empty() || uid == study.uid)
                            && date.matches(&study.study_date)
                            && wildcard_matches(&filter.text("PatientName"), &study.patient_name)
                            && wildcard_matches(
                                &filter.text("StudyDescription"),
                                &study.study_description,
                            )
                    })
                    .map(|study| {
                        let attributes = study.attributes();
                        if filter.get("NumberOfStudyRelatedInstances").is_some() {
                            let count = self.related_instances(study);
                            attributes.with("NumberOfStudyRelatedInstances", count.to_string())
                        } else {
                            attributes
                        }
                    })
                    .collect())
            }
            QueryLevel::Series => {
                let uid = filter.text("StudyInstanceUID");
                Ok(self
                    .studies
                    .iter()
                    .filter(|study| study.uid == uid)
                    .flat_map(|study| study.series.iter())
                    .map(|series| {
                        AttributeSet::new()
                            .with("SeriesInstanceUID", series.uid.as_str())
                            .with("SeriesNumber", series.number.to_string())
                    })
                    .collect())
            }
        }
    }

    fn get(&self, study_uid: &str, destination: &Path) -> Result<(), Pacs2TarError> {
        self.gets.lock().unwrap().push(study_uid.to_string());
        if self.failing.contains(study_uid) {
            return Err(Pacs2TarError::Retrieval {
                uid: study_uid.to_string(),
                message: "C-GET refused".to_string(),
            });
        }
        let Some(study) = self.studies.iter().find(|study| study.uid == study_uid) else {
            return Ok(());
        };
        let delivered = if self.partial.contains(study_uid) {
            study.series.len() - 1
        } else {
            study.series.len()
        };
        for series in &study.series[..delivered] {
            let dir = destination.join(format!("{:03}", series.number));
            fs::create_dir_all(&dir).unwrap();
            for instance in 1..=series.instances {
                let attributes = [
                    ("StudyInstanceUID", study.uid.clone()),
                    ("PatientName", study.patient_name.clone()),
                    ("StudyDate", study.study_date.clone()),
                    ("StudyDescription", study.study_description.clone()),
                    ("StudyID", "1".to_string()),
                    ("SeriesInstanceUID", series.uid.clone()),
                    ("SeriesNumber", series.number.to_string()),
                    ("SeriesDescription", series.description.clone()),
                    ("ProtocolName", series.description.clone()),
                    ("SequenceName", "*tfl3d1_16ns".to_string()),
                    ("Modality", "MR".to_string()),
                    ("ImageType", series.image_type.clone()),
                    ("InstanceNumber", instance.to_string()),
                    ("SOPInstanceUID", format!("{}.{instance}", series.uid)),
                    ("Rows", "256".to_string()),
                    ("Columns", "240".to_string()),
                    ("RepetitionTime", "2300".to_string()),
                    ("EchoTime", "2.98".to_string()),
                    ("FlipAngle", "9".to_string()),
                    ("SliceThickness", "1".to_string()),
                    ("AcquisitionTime", "101010.000000".to_string()),
                ];
                let content = attributes
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                fs::write(dir.join(format!("{instance:04}.dcm")), content).unwrap();
            }
        }
        Ok(())
    }
}

/// Reads the key=value files written by `MockPacs::get`.
pub struct KeyValueReader;

impl AttributeReader for KeyValueReader {
    fn read_tags(&self, path: &Path) -> Result<AttributeSet, Pacs2TarError> {
        let content = fs::read_to_string(path).map_err(|err| Pacs2TarError::MetadataParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let attributes: AttributeSet = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        if attributes.is_empty() {
            return Err(Pacs2TarError::MetadataParse {
                path: path.to_path_buf(),
                message: "no attributes".to_string(),
            });
        }
        Ok(attributes)
    }
}

pub struct Workspace {
    pub temp: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.temp.path().to_path_buf()).unwrap()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    pub fn store(&self) -> Store {
        Store::new_with_paths(self.root().join("out"), self.root().join("tmp"))
    }

    pub fn app(&self, pacs: MockPacs) -> App<MockPacs, KeyValueReader> {
        App::new(self.store(), pacs, KeyValueReader)
    }

    pub fn options(&self, mode: RunMode, schema: TableSchema) -> RunOptions {
        let store = self.store();
        RunOptions {
            mode,
            schema,
            table_path: store.table_path(schema).into_std_path_buf(),
            write_mode: WriteMode::Append,
            ledger_path: store.ledger_path().into_std_path_buf(),
            series_filter: None,
            archive: ArchiveOptions::default(),
            retry: RetryPolicy::none(),
            verify_series: false,
            readiness: None,
        }
    }
}

pub fn two_study_archive() -> Vec<MockStudy> {
    vec![
        MockStudy::new("1.3.12.2.1107.5.2.1", "2024_01_01_C001", "20240101", &[176, 1, 35]),
        MockStudy::new("1.3.12.2.1107.5.2.2", "2024_01_01_C002", "20240101", &[24, 1, 60]),
        MockStudy::new("1.3.12.2.1107.5.2.3", "2024_02_03_C003", "20240203", &[10]),
    ]
}
