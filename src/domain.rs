use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::Pacs2TarError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudyUid(String);

impl StudyUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyUid {
    type Err = Pacs2TarError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_matches(|ch| ch == '"' || ch == '\'').trim();
        let is_valid = !normalized.is_empty()
            && normalized.len() <= 64
            && normalized.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
            && !normalized.starts_with('.')
            && !normalized.ends_with('.');
        if !is_valid {
            return Err(Pacs2TarError::InvalidStudyUid(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QueryLevel {
    Study,
    Series,
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
        }
    }
}

/// Keyword-indexed attribute values of one file or one query response.
///
/// Multi-valued attributes keep the DICOM `\` separator inside the string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet(BTreeMap<String, String>);

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: impl Into<String>, value: impl Into<String>) {
        self.0.insert(keyword.into(), value.into());
    }

    pub fn with(mut self, keyword: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(keyword, value);
        self
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.0.get(keyword).map(String::as_str)
    }

    /// Trimmed value, or an empty string when the attribute is absent.
    pub fn text(&self, keyword: &str) -> String {
        self.get(keyword).map(str::trim).unwrap_or_default().to_string()
    }

    /// Trimmed value when present and non-empty.
    pub fn non_empty(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).map(str::trim).filter(|value| !value.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Extra study-level attribute requested by tag and exported under a column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTag {
    /// Eight upper-case hex digits, group then element.
    pub tag: String,
    pub name: String,
}

impl FromStr for MetadataTag {
    type Err = Pacs2TarError;

    /// Parses `GGGGEEEE:Name`; spaces, commas and parentheses in the tag are ignored.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || Pacs2TarError::InvalidMetadataTag(value.to_string());
        let (tag, name) = value.split_once(':').ok_or_else(invalid)?;
        let tag: String = tag
            .chars()
            .filter(|ch| !matches!(ch, ' ' | ',' | '(' | ')'))
            .collect::<String>()
            .to_ascii_uppercase();
        let name = name.trim();
        if tag.len() != 8 || !tag.chars().all(|ch| ch.is_ascii_hexdigit()) || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            tag,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Study {
    pub study_instance_uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub study_date: String,
    pub study_description: String,
    /// Values of requested [`MetadataTag`]s, keyed by column name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Study {
    pub fn from_attributes(attributes: &AttributeSet) -> Option<Self> {
        Self::with_tags(attributes, &[])
    }

    /// Like [`Study::from_attributes`], also picking up the values of `tags`.
    pub fn with_tags(attributes: &AttributeSet, tags: &[MetadataTag]) -> Option<Self> {
        let uid = attributes.non_empty("StudyInstanceUID")?;
        Some(Self {
            study_instance_uid: uid.to_string(),
            patient_name: attributes.text("PatientName"),
            patient_id: attributes.text("PatientID"),
            study_date: attributes.text("StudyDate"),
            study_description: attributes.text("StudyDescription"),
            extra: tags
                .iter()
                .map(|tag| (tag.name.clone(), attributes.text(&tag.tag)))
                .collect(),
        })
    }
}

/// ImageType value as written, plus its normalized token set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageType {
    tokens: Vec<String>,
    normalized: BTreeSet<String>,
}

impl ImageType {
    pub fn parse(raw: &str) -> Self {
        let tokens: Vec<String> = raw
            .split('\\')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();
        let normalized = tokens.iter().map(|token| token.to_ascii_uppercase()).collect();
        Self { tokens, normalized }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn contains(&self, token: &str) -> bool {
        self.normalized.contains(&token.trim().to_ascii_uppercase())
    }

    pub fn is_derived(&self) -> bool {
        self.contains("DERIVED")
    }

    pub fn is_motion_corrected(&self) -> bool {
        self.contains("MOCO") || self.contains("MOSAIC")
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join("\\"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_number: Option<i64>,
    pub series_description: String,
    pub protocol_name: String,
    pub sequence_name: String,
    pub modality: String,
    pub image_type: ImageType,
    pub is_derived: bool,
    pub is_motion_corrected: bool,
    pub dim1: Option<u32>,
    pub dim2: Option<u32>,
    pub dim3: usize,
    pub tr: Option<f64>,
    pub te: Option<f64>,
    pub fa: Option<f64>,
    pub slice_thickness: Option<f64>,
    pub acquisition_time: String,
    pub tar_file_path: Option<String>,
}
