use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pacs2tar::app::{App, ProgressSink, ReadinessCheck, RetryPolicy, RunMode, RunOptions};
use pacs2tar::archive::{ArchiveOptions, CollisionPolicy};
use pacs2tar::config::ConfigLoader;
use pacs2tar::domain::{MetadataTag, StudyUid};
use pacs2tar::error::Pacs2TarError;
use pacs2tar::filter::SeriesFilter;
use pacs2tar::output::{JsonOutput, LogProgress, OutputMode, print_summary};
use pacs2tar::pacs::{Dcm4cheClient, ToolStatus};
use pacs2tar::query::SearchCriteria;
use pacs2tar::reader::DicomFileReader;
use pacs2tar::store::Store;
use pacs2tar::table::{TableSchema, WriteMode, read_uid_listing};

#[derive(Parser)]
#[command(name = "pacs2tar")]
#[command(about = "Query a DICOM archive and package matching studies as tar files")]
#[command(version, author)]
struct Cli {
    /// Directory receiving archives, metadata tables and the ledger
    output_dir: Utf8PathBuf,

    /// StudyDate: YYYYMMDD, YYYYMMDD-, -YYYYMMDD or YYYYMMDD-YYYYMMDD; "-" matches all
    #[arg(short = 'd', long, default_value = "-")]
    date: String,

    /// PatientName wildcard
    #[arg(short = 'n', long, default_value = "*")]
    name: String,

    /// StudyDescription wildcard, usually "Principal^Project"
    #[arg(short = 'p', long = "description", default_value = "*")]
    description: String,

    /// StudyInstanceUID; overrides date, name and description (repeatable)
    #[arg(short = 'u', long = "uid")]
    uids: Vec<String>,

    /// Take StudyInstanceUIDs from a metadata table or a one-per-line list
    #[arg(long, value_name = "FILE", conflicts_with = "uids")]
    from_metadata: Option<PathBuf>,

    /// Only write the metadata table; nothing is archived
    #[arg(short = 'm', long)]
    metadata_only: bool,

    /// Extra study-level tag exported as a column, e.g. 00100030:PatientBirthDate (repeatable)
    #[arg(long = "metadata-tags", value_name = "TAG:NAME")]
    metadata_tags: Vec<String>,

    /// Shape of the metadata table
    #[arg(long, value_enum, default_value = "series")]
    schema: TableSchema,

    /// Metadata table path (defaults to a file in OUTPUT_DIR)
    #[arg(long, value_name = "FILE")]
    table: Option<PathBuf>,

    /// Rewrite the metadata table instead of appending to it
    #[arg(long)]
    fresh: bool,

    /// Series-level table listing the series to keep in the export
    #[arg(long, value_name = "FILE")]
    series_filter: Option<PathBuf>,

    /// Check every retrieval against a series-level query
    #[arg(long)]
    verify_series: bool,

    /// Retrieve without waiting for the archive to finish receiving each study
    #[arg(long)]
    no_readiness_check: bool,

    /// Leave DERIVED images out of the archives
    #[arg(long)]
    skip_derived: bool,

    /// Write .tar.gz archives
    #[arg(long)]
    gzip: bool,

    /// Archive name collision handling
    #[arg(long, value_enum)]
    collision: Option<CollisionPolicy>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// AET@host:port of the archive
    #[arg(long)]
    connection: Option<String>,

    /// Extra argument passed to findscu/getscu (repeatable)
    #[arg(long = "dcm4che-option", allow_hyphen_values = true)]
    dcm4che_options: Vec<String>,

    #[arg(long, value_name = "DIR")]
    temp_dir: Option<Utf8PathBuf>,

    #[arg(long, value_name = "FILE")]
    ledger: Option<PathBuf>,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<Pacs2TarError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &Pacs2TarError) -> u8 {
    match error {
        Pacs2TarError::InvalidStudyUid(_)
        | Pacs2TarError::InvalidDate(_)
        | Pacs2TarError::InvalidDateRange { .. }
        | Pacs2TarError::InvalidMetadataTag(_)
        | Pacs2TarError::EmptyListing(_)
        | Pacs2TarError::SchemaMismatch { .. }
        | Pacs2TarError::ConfigRead(_)
        | Pacs2TarError::ConfigParse(_) => 2,
        Pacs2TarError::Query(_)
        | Pacs2TarError::Retrieval { .. }
        | Pacs2TarError::RetrievalTimeout { .. }
        | Pacs2TarError::MissingTool(_) => 3,
        Pacs2TarError::Ledger { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let connection = cli.connection.clone().unwrap_or(config.connection.clone());
    let mut tool_options = config.dcm4che_options.clone();
    tool_options.extend(cli.dcm4che_options.iter().cloned());
    let timeout = cli
        .timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(config.timeout);

    let store = match cli.temp_dir.clone().or_else(|| {
        config
            .temp_dir
            .clone()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
    }) {
        Some(temp_root) => Store::new_with_paths(cli.output_dir.clone(), temp_root),
        None => Store::new(cli.output_dir.clone())?,
    };

    let criteria = SearchCriteria {
        date: cli.date.clone(),
        patient_name: cli.name.clone(),
        study_description: cli.description.clone(),
        study_uids: match &cli.from_metadata {
            Some(path) => read_uid_listing(path)?,
            None => cli
                .uids
                .iter()
                .map(|uid| uid.parse::<StudyUid>())
                .collect::<Result<Vec<_>, _>>()?,
        },
        extra_tags: cli
            .metadata_tags
            .iter()
            .map(|tag| tag.parse::<MetadataTag>())
            .collect::<Result<Vec<_>, _>>()?,
    };
    if !criteria.extra_tags.is_empty() && cli.schema != TableSchema::Study {
        warn!("--metadata-tags only applies to study-level tables");
    }

    let series_filter = match &cli.series_filter {
        Some(path) => Some(SeriesFilter::load_series_export(path)?),
        None => None,
    };
    if series_filter.is_some() && cli.schema != TableSchema::Series {
        warn!("--series-filter only applies to series-level tables");
    }

    let options = RunOptions {
        mode: if cli.metadata_only {
            RunMode::MetadataOnly
        } else {
            RunMode::Download
        },
        schema: cli.schema,
        table_path: cli
            .table
            .clone()
            .unwrap_or_else(|| store.table_path(cli.schema).into_std_path_buf()),
        write_mode: if cli.fresh {
            WriteMode::Truncate
        } else {
            WriteMode::Append
        },
        ledger_path: cli
            .ledger
            .clone()
            .or_else(|| config.ledger.clone())
            .unwrap_or_else(|| store.ledger_path().into_std_path_buf()),
        series_filter,
        archive: ArchiveOptions {
            gzip: cli.gzip,
            skip_derived: cli.skip_derived,
            collision: cli.collision.unwrap_or(config.collision),
        },
        retry: RetryPolicy {
            attempts: config.retry_attempts,
            delay: config.retry_delay,
        },
        verify_series: cli.verify_series,
        readiness: if cli.no_readiness_check {
            None
        } else {
            config
                .readiness_interval
                .map(|interval| ReadinessCheck { interval, timeout })
        },
    };

    let pacs = Dcm4cheClient::new(connection, tool_options, timeout);
    if let ToolStatus::Missing { tool } = pacs.tool_status() {
        return Err(Pacs2TarError::MissingTool(tool.to_string()).into());
    }

    let app = App::new(store, pacs, DicomFileReader::new());
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &LogProgress,
    };
    let summary = app.run(&criteria, options, sink)?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_summary(&summary).into_diagnostic()?,
        OutputMode::Human => print_summary(&summary),
    }
    Ok(())
}
