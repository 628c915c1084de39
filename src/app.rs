use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveBuilder, ArchiveOptions};
use crate::domain::{QueryLevel, Study};
use crate::error::Pacs2TarError;
use crate::extract::SeriesMetadataExtractor;
use crate::filter::SeriesFilter;
use crate::ledger::DownloadLedger;
use crate::pacs::PacsClient;
use crate::query::{QueryPlan, QueryPlanner, SearchCriteria};
use crate::reader::AttributeReader;
use crate::scan::scan_study;
use crate::store::Store;
use crate::table::{MetadataTableWriter, TableSchema, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Retrieve, archive, export and record every new study.
    Download,
    /// Export metadata only; nothing is archived or recorded in the ledger.
    MetadataOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Wait for the archive to stop receiving a study before retrieving it.
///
/// A study is ready once two NumberOfStudyRelatedInstances readings `interval` apart
/// agree. A study that is not visible yet is never ready.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessCheck {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    pub schema: TableSchema,
    pub table_path: PathBuf,
    pub write_mode: WriteMode,
    pub ledger_path: PathBuf,
    pub series_filter: Option<SeriesFilter>,
    pub archive: ArchiveOptions,
    pub retry: RetryPolicy,
    /// Compare retrieved series against a series-level Find.
    pub verify_series: bool,
    pub readiness: Option<ReadinessCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedStudy {
    pub study_instance_uid: String,
    pub archive: Option<String>,
    pub rows_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyFailure {
    pub study_instance_uid: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub discovered: usize,
    pub processed: Vec<ProcessedStudy>,
    /// Studies already present in the ledger.
    pub skipped: Vec<String>,
    pub failed: Vec<StudyFailure>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<P: PacsClient, R: AttributeReader> {
    store: Store,
    pacs: P,
    reader: R,
}

impl<P: PacsClient, R: AttributeReader> App<P, R> {
    pub fn new(store: Store, pacs: P, reader: R) -> Self {
        Self {
            store,
            pacs,
            reader,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pacs(&self) -> &P {
        &self.pacs
    }

    /// Studies matching `criteria`, deduplicated, in query-result order.
    pub fn discover(
        &self,
        criteria: &SearchCriteria,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<Study>, Pacs2TarError> {
        let plan = QueryPlanner::plan(criteria)?;
        sink.event(ProgressEvent {
            message: "phase=Query; searching archive".to_string(),
            elapsed: None,
        });
        let start = Instant::now();

        let mut seen = HashSet::new();
        let mut studies = Vec::new();
        for filter in plan.study_filters(&criteria.extra_tags) {
            let responses = self.pacs.find(QueryLevel::Study, &filter)?;
            if responses.is_empty() && matches!(plan, QueryPlan::ByUid(_)) {
                warn!(
                    uid = filter.get("StudyInstanceUID").unwrap_or_default(),
                    "no study found for StudyInstanceUID"
                );
            }
            for attributes in responses {
                let Some(study) = Study::with_tags(&attributes, &criteria.extra_tags) else {
                    warn!("ignoring query response without StudyInstanceUID");
                    continue;
                };
                if seen.insert(study.study_instance_uid.clone()) {
                    studies.push(study);
                }
            }
        }

        sink.event(ProgressEvent {
            message: format!("found {} studies", studies.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(studies)
    }

    pub fn run(
        &self,
        criteria: &SearchCriteria,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, Pacs2TarError> {
        let studies = self.discover(criteria, sink)?;
        self.store.ensure_output_root()?;

        let mut ledger = match options.mode {
            RunMode::Download => Some(DownloadLedger::load(&options.ledger_path)?),
            RunMode::MetadataOnly => None,
        };
        let extra_columns = match options.schema {
            TableSchema::Study => criteria.extra_tags.iter().map(|tag| tag.name.clone()).collect(),
            TableSchema::Series => {
                if !criteria.extra_tags.is_empty() {
                    warn!("extra metadata tags only apply to the study-level table");
                }
                Vec::new()
            }
        };
        let mut table = MetadataTableWriter::open_with_extra(
            &options.table_path,
            options.schema,
            options.write_mode,
            extra_columns,
        )?;
        let archiver = ArchiveBuilder::new(self.store.output_root().as_std_path(), options.archive);

        let mut summary = RunSummary {
            discovered: studies.len(),
            ..RunSummary::default()
        };
        for (index, study) in studies.iter().enumerate() {
            let uid = study.study_instance_uid.as_str();
            if ledger.as_ref().is_some_and(|ledger| ledger.contains(uid)) {
                info!(uid, "already retrieved, skipping");
                summary.skipped.push(uid.to_string());
                continue;
            }

            sink.event(ProgressEvent {
                message: format!(
                    "phase=Study; {}/{} {uid} {}",
                    index + 1,
                    studies.len(),
                    study.study_description
                ),
                elapsed: None,
            });
            let start = Instant::now();
            match self.process_study(study, &options, &mut table, ledger.as_mut(), &archiver, sink)
            {
                Ok(processed) => {
                    sink.event(ProgressEvent {
                        message: format!("study {uid} done"),
                        elapsed: Some(start.elapsed()),
                    });
                    summary.processed.push(processed);
                }
                Err(err) if err.is_run_fatal() => return Err(err),
                Err(err) => {
                    warn!(uid, kind = err.kind(), error = %err, "study failed");
                    summary.failed.push(StudyFailure {
                        study_instance_uid: uid.to_string(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            processed = summary.processed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "run finished"
        );
        Ok(summary)
    }

    fn process_study(
        &self,
        study: &Study,
        options: &RunOptions,
        table: &mut MetadataTableWriter,
        ledger: Option<&mut DownloadLedger>,
        archiver: &ArchiveBuilder,
        sink: &dyn ProgressSink,
    ) -> Result<ProcessedStudy, Pacs2TarError> {
        let uid = study.study_instance_uid.as_str();

        if options.mode == RunMode::MetadataOnly && options.schema == TableSchema::Study {
            let written = table.write_study(study)?;
            return Ok(ProcessedStudy {
                study_instance_uid: uid.to_string(),
                archive: None,
                rows_written: usize::from(written),
            });
        }

        let expected_series = if options.verify_series {
            Some(self.find_series(uid)?)
        } else {
            None
        };

        if let Some(check) = &options.readiness {
            self.wait_until_ready(uid, check, sink)?;
        }
        let work_dir = self.store.study_work_dir(uid)?;
        let retrieved = self.retrieve(uid, work_dir.path(), &options.retry, sink)?;
        let scan = scan_study(&self.reader, &retrieved, &work_dir.path().join("unpacked"))?;
        if scan.files.is_empty() {
            return Err(Pacs2TarError::Retrieval {
                uid: uid.to_string(),
                message: "no readable instance files retrieved".to_string(),
            });
        }

        let mut series = SeriesMetadataExtractor::extract(uid, &scan.files);
        if let Some(expected) = expected_series {
            let extracted: BTreeSet<&str> = series
                .iter()
                .map(|series| series.series_instance_uid.as_str())
                .collect();
            let missing = expected
                .iter()
                .filter(|series_uid| !extracted.contains(series_uid.as_str()))
                .count();
            if missing > 0 {
                return Err(Pacs2TarError::Retrieval {
                    uid: uid.to_string(),
                    message: format!(
                        "partial retrieval: {missing} of {} series missing",
                        expected.len()
                    ),
                });
            }
        }
        info!(uid, files = scan.files.len(), series = series.len(), "study extracted");

        let archive = match options.mode {
            RunMode::Download => {
                let built = archiver.build(study, &scan.files, work_dir)?;
                Some(built.path.display().to_string())
            }
            RunMode::MetadataOnly => None,
        };
        for series in &mut series {
            series.tar_file_path = archive.clone();
        }

        let rows_written = match options.schema {
            TableSchema::Study => usize::from(table.write_study(study)?),
            TableSchema::Series => {
                let series = match &options.series_filter {
                    Some(filter) => filter.retain(uid, series),
                    None => series,
                };
                table.write_series(study, &series)?
            }
        };

        if let Some(ledger) = ledger {
            ledger.append(uid)?;
        }

        Ok(ProcessedStudy {
            study_instance_uid: uid.to_string(),
            archive,
            rows_written,
        })
    }

    fn find_series(&self, uid: &str) -> Result<BTreeSet<String>, Pacs2TarError> {
        let responses = self
            .pacs
            .find(QueryLevel::Series, &QueryPlanner::series_filter(uid))?;
        Ok(responses
            .iter()
            .filter_map(|attributes| attributes.non_empty("SeriesInstanceUID"))
            .map(str::to_string)
            .collect())
    }

    fn related_instances(&self, uid: &str) -> Result<Option<u64>, Pacs2TarError> {
        let responses = self
            .pacs
            .find(QueryLevel::Study, &QueryPlanner::readiness_filter(uid))?;
        Ok(responses
            .iter()
            .find_map(|attributes| attributes.non_empty("NumberOfStudyRelatedInstances"))
            .and_then(|count| count.parse().ok()))
    }

    /// Blocks until the instance count of the study stops changing.
    fn wait_until_ready(
        &self,
        uid: &str,
        check: &ReadinessCheck,
        sink: &dyn ProgressSink,
    ) -> Result<(), Pacs2TarError> {
        let start = Instant::now();
        let mut announced = false;
        loop {
            let before = self.related_instances(uid)?;
            thread::sleep(check.interval);
            if let Some(before) = before {
                let after = self.related_instances(uid)?;
                if after == Some(before) {
                    debug!(uid, instances = before, "study ready for retrieval");
                    return Ok(());
                }
                debug!(uid, before, after = ?after, "study still receiving instances");
            }
            if start.elapsed() >= check.timeout {
                return Err(Pacs2TarError::RetrievalTimeout {
                    command: format!("waiting for study {uid} to finish arriving"),
                    seconds: check.timeout.as_secs(),
                });
            }
            if !announced {
                sink.event(ProgressEvent {
                    message: format!("phase=Wait; {uid} still arriving at the archive"),
                    elapsed: None,
                });
                announced = true;
            }
        }
    }

    /// Runs Get with retries; every attempt starts from an empty directory.
    fn retrieve(
        &self,
        uid: &str,
        work_dir: &Path,
        retry: &RetryPolicy,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, Pacs2TarError> {
        let mut attempt = 0u32;
        loop {
            let destination = work_dir.join(format!("retrieved-{attempt}"));
            fs::create_dir_all(&destination).map_err(|err| Pacs2TarError::Retrieval {
                uid: uid.to_string(),
                message: err.to_string(),
            })?;

            sink.event(ProgressEvent {
                message: format!("phase=Retrieve; {uid} attempt {}", attempt + 1),
                elapsed: None,
            });
            let start = Instant::now();
            match self.pacs.get(uid, &destination) {
                Ok(()) => {
                    sink.event(ProgressEvent {
                        message: format!("retrieved {uid}"),
                        elapsed: Some(start.elapsed()),
                    });
                    return Ok(destination);
                }
                Err(err) if err.is_retryable() && attempt < retry.attempts => {
                    warn!(uid, attempt = attempt + 1, error = %err, "retrieval failed, retrying");
                    let _ = fs::remove_dir_all(&destination);
                    thread::sleep(retry.delay * (attempt + 1));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::domain::AttributeSet;
    use crate::output::JsonOutput;

    struct FlakyPacs {
        failures: Mutex<u32>,
        gets: Mutex<u32>,
    }

    impl PacsClient for FlakyPacs {
        fn find(
            &self,
            _level: QueryLevel,
            _filter: &AttributeSet,
        ) -> Result<Vec<AttributeSet>, Pacs2TarError> {
            Ok(Vec::new())
        }

        fn get(&self, study_uid: &str, destination: &Path) -> Result<(), Pacs2TarError> {
            *self.gets.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Pacs2TarError::RetrievalTimeout {
                    command: "getscu".to_string(),
                    seconds: 1,
                });
            }
            fs::write(destination.join("1.dcm"), study_uid).unwrap();
            Ok(())
        }
    }

    struct NopReader;

    impl AttributeReader for NopReader {
        fn read_tags(&self, _path: &Path) -> Result<AttributeSet, Pacs2TarError> {
            Ok(AttributeSet::new())
        }
    }

    fn app(failures: u32) -> (tempfile::TempDir, App<FlakyPacs, NopReader>) {
        let temp = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("out"), root.join("tmp"));
        let pacs = FlakyPacs {
            failures: Mutex::new(failures),
            gets: Mutex::new(0),
        };
        (temp, App::new(store, pacs, NopReader))
    }

    #[test]
    fn retrieval_is_retried_after_timeout() {
        let (temp, app) = app(1);
        let retry = RetryPolicy {
            attempts: 1,
            delay: Duration::ZERO,
        };
        let retrieved = app
            .retrieve("1.2.3", temp.path(), &retry, &JsonOutput)
            .unwrap();
        assert!(retrieved.join("1.dcm").exists());
        assert_eq!(*app.pacs.gets.lock().unwrap(), 2);
    }

    #[test]
    fn retries_are_bounded() {
        let (temp, app) = app(5);
        let retry = RetryPolicy {
            attempts: 2,
            delay: Duration::ZERO,
        };
        let err = app
            .retrieve("1.2.3", temp.path(), &retry, &JsonOutput)
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(*app.pacs.gets.lock().unwrap(), 3);
    }

    #[test]
    fn empty_query_result_is_an_empty_run() {
        let (temp, app) = app(0);
        let options = RunOptions {
            mode: RunMode::Download,
            schema: TableSchema::Study,
            table_path: temp.path().join("study_metadata.tsv"),
            write_mode: WriteMode::Append,
            ledger_path: temp.path().join("downloaded_uids.txt"),
            series_filter: None,
            archive: ArchiveOptions::default(),
            retry: RetryPolicy::none(),
            verify_series: false,
            readiness: None,
        };
        let summary = app
            .run(&SearchCriteria::default(), options, &JsonOutput)
            .unwrap();
        assert_eq!(summary.discovered, 0);
        assert!(summary.processed.is_empty());
        assert_eq!(*app.pacs.gets.lock().unwrap(), 0);
    }

    #[test]
    fn invisible_study_is_never_ready() {
        let (_temp, app) = app(0);
        let check = ReadinessCheck {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
        };
        let err = app
            .wait_until_ready("1.2.3", &check, &JsonOutput)
            .unwrap_err();
        assert_eq!(err.kind(), "retrieval");
        assert_eq!(*app.pacs.gets.lock().unwrap(), 0);
    }
}
