use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::domain::{AttributeSet, MetadataTag, StudyUid};
use crate::error::Pacs2TarError;

const DICOM_DATE: &str = "%Y%m%d";

pub const STUDY_RETURN_KEYS: [&str; 5] = [
    "StudyInstanceUID",
    "PatientName",
    "PatientID",
    "StudyDate",
    "StudyDescription",
];

pub const SERIES_RETURN_KEYS: [&str; 4] = [
    "SeriesInstanceUID",
    "SeriesNumber",
    "SeriesDescription",
    "Modality",
];

/// StudyDate search expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateExpr {
    Any,
    On(NaiveDate),
    From(NaiveDate),
    Until(NaiveDate),
    Between(NaiveDate, NaiveDate),
}

impl DateExpr {
    /// DICOM range-matching value; an empty string is a universal match.
    pub fn to_dicom(&self) -> String {
        match self {
            DateExpr::Any => String::new(),
            DateExpr::On(date) => date.format(DICOM_DATE).to_string(),
            DateExpr::From(date) => format!("{}-", date.format(DICOM_DATE)),
            DateExpr::Until(date) => format!("-{}", date.format(DICOM_DATE)),
            DateExpr::Between(start, end) => {
                format!("{}-{}", start.format(DICOM_DATE), end.format(DICOM_DATE))
            }
        }
    }

    pub fn matches(&self, study_date: &str) -> bool {
        if matches!(self, DateExpr::Any) {
            return true;
        }
        let Ok(date) = NaiveDate::parse_from_str(study_date.trim(), DICOM_DATE) else {
            return false;
        };
        match *self {
            DateExpr::Any => true,
            DateExpr::On(day) => date == day,
            DateExpr::From(start) => date >= start,
            DateExpr::Until(end) => date <= end,
            DateExpr::Between(start, end) => date >= start && date <= end,
        }
    }
}

impl fmt::Display for DateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateExpr::Any => write!(f, "-"),
            other => write!(f, "{}", other.to_dicom()),
        }
    }
}

impl FromStr for DateExpr {
    type Err = Pacs2TarError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_matches(|ch| ch == '"' || ch == '\'');
        if trimmed.is_empty() || trimmed == "-" || trimmed == "*" {
            return Ok(DateExpr::Any);
        }
        let Some((start, end)) = trimmed.split_once('-') else {
            return Ok(DateExpr::On(parse_date(trimmed, value)?));
        };
        match (start.trim(), end.trim()) {
            ("", end) => Ok(DateExpr::Until(parse_date(end, value)?)),
            (start, "") => Ok(DateExpr::From(parse_date(start, value)?)),
            (start, end) => {
                let start_date = parse_date(start, value)?;
                let end_date = parse_date(end, value)?;
                if end_date < start_date {
                    return Err(Pacs2TarError::InvalidDateRange {
                        expression: value.to_string(),
                        start: start.to_string(),
                        end: end.to_string(),
                    });
                }
                Ok(DateExpr::Between(start_date, end_date))
            }
        }
    }
}

fn parse_date(part: &str, expression: &str) -> Result<NaiveDate, Pacs2TarError> {
    if part.len() != 8 || !part.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(Pacs2TarError::InvalidDate(expression.to_string()));
    }
    NaiveDate::parse_from_str(part, DICOM_DATE)
        .map_err(|_| Pacs2TarError::InvalidDate(expression.to_string()))
}

#[derive(Debug, Clone)]
pub struct SearchCriteria {
    pub date: String,
    pub patient_name: String,
    pub study_description: String,
    pub study_uids: Vec<StudyUid>,
    /// Extra study-level attributes requested as additional return keys.
    pub extra_tags: Vec<MetadataTag>,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            date: "-".to_string(),
            patient_name: "*".to_string(),
            study_description: "*".to_string(),
            study_uids: Vec::new(),
            extra_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan {
    /// Exact-match queries, one per explicit StudyInstanceUID.
    ByUid(Vec<StudyUid>),
    Match {
        date: DateExpr,
        patient_name: String,
        study_description: String,
    },
}

impl QueryPlan {
    /// One study-level filter per Find call the plan requires, each also asking for
    /// `extra_tags` as empty return keys.
    pub fn study_filters(&self, extra_tags: &[MetadataTag]) -> Vec<AttributeSet> {
        let keys = || {
            let mut keys = return_keys(&STUDY_RETURN_KEYS);
            for extra in extra_tags {
                keys.insert(extra.tag.as_str(), "");
            }
            keys
        };
        match self {
            QueryPlan::ByUid(uids) => uids
                .iter()
                .map(|uid| keys().with("StudyInstanceUID", uid.as_str()))
                .collect(),
            QueryPlan::Match {
                date,
                patient_name,
                study_description,
            } => vec![
                keys()
                    .with("StudyDate", date.to_dicom())
                    .with("PatientName", wildcard(patient_name))
                    .with("StudyDescription", wildcard(study_description)),
            ],
        }
    }
}

pub struct QueryPlanner;

impl QueryPlanner {
    pub fn plan(criteria: &SearchCriteria) -> Result<QueryPlan, Pacs2TarError> {
        if !criteria.study_uids.is_empty() {
            return Ok(QueryPlan::ByUid(criteria.study_uids.clone()));
        }
        Ok(QueryPlan::Match {
            date: criteria.date.parse()?,
            patient_name: criteria.patient_name.trim().to_string(),
            study_description: criteria.study_description.trim().to_string(),
        })
    }

    pub fn series_filter(study_uid: &str) -> AttributeSet {
        return_keys(&SERIES_RETURN_KEYS).with("StudyInstanceUID", study_uid)
    }

    /// Study-level filter asking only for the current instance count of one study.
    pub fn readiness_filter(study_uid: &str) -> AttributeSet {
        AttributeSet::new()
            .with("StudyInstanceUID", study_uid)
            .with("NumberOfStudyRelatedInstances", "")
    }
}

fn return_keys(keys: &[&str]) -> AttributeSet {
    keys.iter()
        .map(|key| (key.to_string(), String::new()))
        .collect()
}

fn wildcard(value: &str) -> String {
    if value == "*" {
        String::new()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, DICOM_DATE).unwrap()
    }

    #[test]
    fn parse_date_expressions() {
        assert_eq!("".parse::<DateExpr>().unwrap(), DateExpr::Any);
        assert_eq!("-".parse::<DateExpr>().unwrap(), DateExpr::Any);
        assert_eq!(
            "20240101".parse::<DateExpr>().unwrap(),
            DateExpr::On(day("20240101"))
        );
        assert_eq!(
            "20170530-".parse::<DateExpr>().unwrap(),
            DateExpr::From(day("20170530"))
        );
        assert_eq!(
            "20170530-20170827".parse::<DateExpr>().unwrap(),
            DateExpr::Between(day("20170530"), day("20170827"))
        );
    }

    #[test]
    fn reversed_range_is_rejected() {
        let err = "20240201-20240101".parse::<DateExpr>().unwrap_err();
        assert_matches!(err, Pacs2TarError::InvalidDateRange { ref start, ref end, .. }
            if start == "20240201" && end == "20240101");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        assert_matches!(
            "2024-01-01".parse::<DateExpr>(),
            Err(Pacs2TarError::InvalidDate(_))
        );
        assert_matches!("20241341".parse::<DateExpr>(), Err(Pacs2TarError::InvalidDate(_)));
    }

    #[test]
    fn any_date_matches_everything() {
        assert!(DateExpr::Any.matches("19700101"));
        assert!(DateExpr::Any.matches(""));
        let range: DateExpr = "20240101-20240131".parse().unwrap();
        assert!(range.matches("20240115"));
        assert!(!range.matches("20240201"));
    }

    #[test]
    fn explicit_uid_overrides_other_criteria() {
        let criteria = SearchCriteria {
            date: "20240201-20240101".to_string(),
            patient_name: "*subj01*".to_string(),
            study_description: "Khan^NeuroAnalytics".to_string(),
            study_uids: vec!["1.2.3.4".parse().unwrap()],
            extra_tags: Vec::new(),
        };
        let plan = QueryPlanner::plan(&criteria).unwrap();
        let filters = plan.study_filters(&[]);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].get("StudyInstanceUID"), Some("1.2.3.4"));
        assert_eq!(filters[0].get("PatientName"), Some(""));
        assert_eq!(filters[0].get("StudyDescription"), Some(""));
        assert_eq!(filters[0].get("StudyDate"), Some(""));
    }

    #[test]
    fn criteria_combine_into_one_filter() {
        let criteria = SearchCriteria {
            date: "20170530-".to_string(),
            patient_name: "*subj01*".to_string(),
            study_description: "Khan^NeuroAnalytics".to_string(),
            study_uids: Vec::new(),
            extra_tags: Vec::new(),
        };
        let filters = QueryPlanner::plan(&criteria).unwrap().study_filters(&[]);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].get("StudyDate"), Some("20170530-"));
        assert_eq!(filters[0].get("PatientName"), Some("*subj01*"));
        assert_eq!(filters[0].get("StudyDescription"), Some("Khan^NeuroAnalytics"));
        assert_eq!(filters[0].get("StudyInstanceUID"), Some(""));
    }

    #[test]
    fn default_criteria_match_all() {
        let filters = QueryPlanner::plan(&SearchCriteria::default())
            .unwrap()
            .study_filters(&[]);
        assert_eq!(filters[0].get("StudyDate"), Some(""));
        assert_eq!(filters[0].get("PatientName"), Some(""));
    }

    #[test]
    fn extra_tags_become_return_keys() {
        let tags: Vec<MetadataTag> = vec![
            "00100030:PatientBirthDate".parse().unwrap(),
            "00101010:PatientAge".parse().unwrap(),
        ];
        let criteria = SearchCriteria {
            study_uids: vec!["1.2.3.4".parse().unwrap(), "1.2.3.5".parse().unwrap()],
            ..SearchCriteria::default()
        };
        let filters = QueryPlanner::plan(&criteria).unwrap().study_filters(&tags);
        assert_eq!(filters.len(), 2);
        for filter in &filters {
            assert_eq!(filter.get("00100030"), Some(""));
            assert_eq!(filter.get("00101010"), Some(""));
            assert_eq!(filter.len(), STUDY_RETURN_KEYS.len() + 2);
        }
    }
}
