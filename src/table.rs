use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::domain::{ImageType, Series, Study, StudyUid};
use crate::error::Pacs2TarError;

pub const STUDY_COLUMNS: [&str; 5] = [
    "StudyInstanceUID",
    "PatientName",
    "PatientID",
    "StudyDate",
    "StudyDescription",
];

pub const SERIES_COLUMNS: [&str; 23] = [
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientName",
    "PatientID",
    "StudyDate",
    "StudyDescription",
    "SeriesNumber",
    "SeriesDescription",
    "ProtocolName",
    "SequenceName",
    "ImageType",
    "is_derived",
    "is_motion_corrected",
    "dim1",
    "dim2",
    "dim3",
    "tr",
    "te",
    "fa",
    "slice_thickness",
    "acquisition_time",
    "Modality",
    "TarFilePath",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TableSchema {
    Study,
    Series,
}

impl TableSchema {
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableSchema::Study => &STUDY_COLUMNS,
            TableSchema::Series => &SERIES_COLUMNS,
        }
    }

    /// Column whose value identifies a row for deduplication.
    pub fn key_column(&self) -> usize {
        match self {
            TableSchema::Study => 0,
            TableSchema::Series => 1,
        }
    }

    /// Sniffs the shape of an existing table from its header row.
    pub fn detect(headers: &[String]) -> Option<Self> {
        let has = |name: &str| headers.iter().any(|header| header == name);
        if has("SeriesInstanceUID") {
            Some(TableSchema::Series)
        } else if has("StudyInstanceUID") {
            Some(TableSchema::Study)
        } else {
            None
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TableSchema::Study => "study-level",
            TableSchema::Series => "series-level",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep existing rows and add new ones.
    Append,
    /// Start the file over with a fresh header.
    Truncate,
}

/// Header and rows of a tab-separated table.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn schema(&self) -> Option<TableSchema> {
        TableSchema::detect(&self.headers)
    }
}

pub fn read_table(path: &Path) -> Result<Table, Pacs2TarError> {
    let file = File::open(path).map_err(|err| table_error(path, err))?;
    FileExt::lock_shared(&file).map_err(|err| table_error(path, err))?;
    let mut reader = tsv_reader(&file);
    let headers = reader
        .headers()
        .map_err(|err| table_error(path, err))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| table_error(path, err))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    FileExt::unlock(&file).map_err(|err| table_error(path, err))?;
    Ok(Table { headers, rows })
}

/// StudyInstanceUIDs from a metadata table or a plain one-UID-per-line listing.
pub fn read_uid_listing(path: &Path) -> Result<Vec<StudyUid>, Pacs2TarError> {
    let content = fs::read_to_string(path).map_err(|err| table_error(path, err))?;
    let first_line = content.lines().next().unwrap_or_default();

    let raw: Vec<String> = if first_line.split('\t').any(|field| field == "StudyInstanceUID") {
        let table = read_table(path)?;
        let Some(column) = table.column("StudyInstanceUID") else {
            return Err(Pacs2TarError::EmptyListing(path.to_path_buf()));
        };
        table
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().nth(column))
            .collect()
    } else {
        content.lines().map(str::to_string).collect()
    };

    let mut seen = HashSet::new();
    let mut uids = Vec::new();
    for value in raw {
        let value = value.trim();
        if value.is_empty() || value.starts_with('#') {
            continue;
        }
        let uid: StudyUid = value.parse()?;
        if seen.insert(uid.clone()) {
            uids.push(uid);
        }
    }
    if uids.is_empty() {
        return Err(Pacs2TarError::EmptyListing(path.to_path_buf()));
    }
    Ok(uids)
}

pub fn study_fields(study: &Study) -> Vec<String> {
    vec![
        study.study_instance_uid.clone(),
        study.patient_name.clone(),
        study.patient_id.clone(),
        study.study_date.clone(),
        study.study_description.clone(),
    ]
}

pub fn series_fields(study: &Study, series: &Series) -> Vec<String> {
    vec![
        study.study_instance_uid.clone(),
        series.series_instance_uid.clone(),
        study.patient_name.clone(),
        study.patient_id.clone(),
        study.study_date.clone(),
        study.study_description.clone(),
        optional(series.series_number),
        series.series_description.clone(),
        series.protocol_name.clone(),
        series.sequence_name.clone(),
        series.image_type.to_string(),
        series.is_derived.to_string(),
        series.is_motion_corrected.to_string(),
        optional(series.dim1),
        optional(series.dim2),
        series.dim3.to_string(),
        optional(series.tr),
        optional(series.te),
        optional(series.fa),
        optional(series.slice_thickness),
        series.acquisition_time.clone(),
        series.modality.clone(),
        series.tar_file_path.clone().unwrap_or_default(),
    ]
}

/// Inverse of [`series_fields`].
pub fn parse_series_row(fields: &[String]) -> Result<(Study, Series), String> {
    if fields.len() != SERIES_COLUMNS.len() {
        return Err(format!(
            "expected {} fields, found {}",
            SERIES_COLUMNS.len(),
            fields.len()
        ));
    }
    let field = |index: usize| fields[index].clone();
    let study = Study {
        study_instance_uid: field(0),
        patient_name: field(2),
        patient_id: field(3),
        study_date: field(4),
        study_description: field(5),
        extra: Default::default(),
    };
    let image_type = ImageType::parse(&fields[10]);
    let series = Series {
        series_instance_uid: field(1),
        study_instance_uid: field(0),
        series_number: parse_optional(&fields[6], "SeriesNumber")?,
        series_description: field(7),
        protocol_name: field(8),
        sequence_name: field(9),
        modality: field(21),
        is_derived: parse_flag(&fields[11], "is_derived")?,
        is_motion_corrected: parse_flag(&fields[12], "is_motion_corrected")?,
        image_type,
        dim1: parse_optional(&fields[13], "dim1")?,
        dim2: parse_optional(&fields[14], "dim2")?,
        dim3: fields[15]
            .parse()
            .map_err(|_| format!("dim3: invalid count {:?}", fields[15]))?,
        tr: parse_optional(&fields[16], "tr")?,
        te: parse_optional(&fields[17], "te")?,
        fa: parse_optional(&fields[18], "fa")?,
        slice_thickness: parse_optional(&fields[19], "slice_thickness")?,
        acquisition_time: field(20),
        tar_file_path: Some(field(22)).filter(|path| !path.is_empty()),
    };
    Ok((study, series))
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|value| value.to_string()).unwrap_or_default()
}

fn parse_optional<T: std::str::FromStr>(value: &str, column: &str) -> Result<Option<T>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| format!("{column}: invalid value {value:?}"))
}

fn parse_flag(value: &str, column: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("{column}: invalid flag {value:?}")),
    }
}

/// Appends study- or series-level rows to one TSV export.
#[derive(Debug)]
pub struct MetadataTableWriter {
    path: PathBuf,
    schema: TableSchema,
    /// Names of extra study columns, sorted, after the fixed ones.
    extra_columns: Vec<String>,
    written_keys: HashSet<String>,
}

impl MetadataTableWriter {
    pub fn open(path: &Path, schema: TableSchema, mode: WriteMode) -> Result<Self, Pacs2TarError> {
        Self::open_with_extra(path, schema, mode, Vec::new())
    }

    /// Opens a table whose header carries `extra_columns` in alphabetical order after the
    /// fixed columns of `schema`. Names clashing with a fixed column are dropped.
    pub fn open_with_extra(
        path: &Path,
        schema: TableSchema,
        mode: WriteMode,
        mut extra_columns: Vec<String>,
    ) -> Result<Self, Pacs2TarError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| table_error(path, err))?;
        }
        extra_columns.retain(|name| !schema.columns().contains(&name.as_str()));
        extra_columns.sort();
        extra_columns.dedup();
        let mut writer = Self {
            path: path.to_path_buf(),
            schema,
            extra_columns,
            written_keys: HashSet::new(),
        };

        let has_content = fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false);
        if mode == WriteMode::Truncate || !has_content {
            writer.write_header()?;
            return Ok(writer);
        }

        let existing = read_table(path)?;
        if existing.headers != writer.header() {
            let found = match existing.schema() {
                Some(found) if found == schema => format!(
                    "{} ({} columns)",
                    found.label(),
                    existing.headers.len()
                ),
                Some(found) => found.label().to_string(),
                None => "unrecognized".to_string(),
            };
            return Err(Pacs2TarError::SchemaMismatch {
                path: path.to_path_buf(),
                expected: format!("{} ({} columns)", schema.label(), writer.header().len()),
                found,
            });
        }
        let key = schema.key_column();
        writer.written_keys = existing
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().nth(key))
            .collect();
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> TableSchema {
        self.schema
    }

    pub fn header(&self) -> Vec<String> {
        self.schema
            .columns()
            .iter()
            .map(|column| column.to_string())
            .chain(self.extra_columns.iter().cloned())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.written_keys.contains(key)
    }

    /// Returns whether a new row was written.
    pub fn write_study(&mut self, study: &Study) -> Result<bool, Pacs2TarError> {
        self.expect_schema(TableSchema::Study)?;
        let mut row = study_fields(study);
        row.extend(
            self.extra_columns
                .iter()
                .map(|name| study.extra.get(name).cloned().unwrap_or_default()),
        );
        Ok(self.append_rows(vec![row])? == 1)
    }

    /// Writes all rows of one study under a single lock; returns the number written.
    pub fn write_series(&mut self, study: &Study, series: &[Series]) -> Result<usize, Pacs2TarError> {
        self.expect_schema(TableSchema::Series)?;
        let rows = series.iter().map(|series| series_fields(study, series)).collect();
        self.append_rows(rows)
    }

    fn expect_schema(&self, schema: TableSchema) -> Result<(), Pacs2TarError> {
        if self.schema == schema {
            return Ok(());
        }
        Err(Pacs2TarError::SchemaMismatch {
            path: self.path.clone(),
            expected: self.schema.label().to_string(),
            found: schema.label().to_string(),
        })
    }

    /// Replaces the file content with the header row. The file is only emptied once the
    /// exclusive lock is held, so a concurrent appender never loses rows mid-write.
    fn write_header(&mut self) -> Result<(), Pacs2TarError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| table_error(&self.path, err))?;
        FileExt::lock_exclusive(&file).map_err(|err| table_error(&self.path, err))?;
        let result = file
            .set_len(0)
            .and_then(|_| write_records(&file, [self.header()]));
        FileExt::unlock(&file).map_err(|err| table_error(&self.path, err))?;
        result.map_err(|err| table_error(&self.path, err))
    }

    fn append_rows(&mut self, rows: Vec<Vec<String>>) -> Result<usize, Pacs2TarError> {
        let key = self.schema.key_column();
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            if self.written_keys.insert(row[key].clone()) {
                fresh.push(row);
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }
        let count = fresh.len();
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| table_error(&self.path, err))?;
        FileExt::lock_exclusive(&file).map_err(|err| table_error(&self.path, err))?;
        let result = write_records(&file, fresh);
        FileExt::unlock(&file).map_err(|err| table_error(&self.path, err))?;
        result.map_err(|err| table_error(&self.path, err))?;
        Ok(count)
    }
}

fn write_records<I>(file: &File, records: I) -> std::io::Result<()>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    for record in records {
        writer.write_record(&record)?;
    }
    writer.flush()?;
    let mut file = writer
        .into_inner()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    file.flush()?;
    file.sync_data()
}

fn tsv_reader(file: &File) -> csv::Reader<&File> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(file)
}

fn table_error(path: &Path, err: impl std::fmt::Display) -> Pacs2TarError {
    Pacs2TarError::Table {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
