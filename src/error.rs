use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum Pacs2TarError {
    #[error("invalid StudyInstanceUID: {0}")]
    InvalidStudyUid(String),

    #[error("invalid date in search expression: {0}")]
    InvalidDate(String),

    #[error("invalid date range {expression}: end date {end} is before start date {start}")]
    #[diagnostic(help("write ranges as YYYYMMDD-YYYYMMDD with the earlier date first"))]
    InvalidDateRange {
        expression: String,
        start: String,
        end: String,
    },

    #[error("invalid metadata tag {0}")]
    #[diagnostic(help("write extra tags as GGGGEEEE:Name, e.g. 00100030:PatientBirthDate"))]
    InvalidMetadataTag(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("retrieval of study {uid} failed: {message}")]
    Retrieval { uid: String, message: String },

    #[error("retrieval timed out after {seconds}s: {command}")]
    RetrievalTimeout { command: String, seconds: u64 },

    #[error("could not read attributes from {path}: {message}")]
    MetadataParse { path: PathBuf, message: String },

    #[error("archiving study {uid} failed: {message}")]
    Archive { uid: String, message: String },

    #[error("archive {path} already exists for another study (study {uid})")]
    ArchiveCollision { uid: String, path: PathBuf },

    #[error("download ledger {path} unusable: {message}")]
    #[diagnostic(help("the run stops because already-retrieved studies can no longer be tracked"))]
    Ledger { path: PathBuf, message: String },

    #[error("metadata table {path}: {message}")]
    Table { path: PathBuf, message: String },

    #[error("metadata table {path} has a {found} header, expected {expected}")]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("no StudyInstanceUIDs found in {0}")]
    EmptyListing(PathBuf),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl Pacs2TarError {
    /// Errors that must stop the whole run instead of only the current study.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Pacs2TarError::Ledger { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Pacs2TarError::Retrieval { .. } | Pacs2TarError::RetrievalTimeout { .. }
        )
    }

    /// Short class name used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Pacs2TarError::Query(_) => "query",
            Pacs2TarError::Retrieval { .. } | Pacs2TarError::RetrievalTimeout { .. } => {
                "retrieval"
            }
            Pacs2TarError::MetadataParse { .. } => "metadata",
            Pacs2TarError::Archive { .. } | Pacs2TarError::ArchiveCollision { .. } => "archive",
            Pacs2TarError::Ledger { .. } => "ledger",
            Pacs2TarError::Table { .. } | Pacs2TarError::SchemaMismatch { .. } => "table",
            _ => "other",
        }
    }
}
