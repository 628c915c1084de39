use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::domain::{AttributeSet, ImageType, Series};
use crate::scan::InstanceFile;

/// Turns the instance files of one study into one `Series` per SeriesInstanceUID.
pub struct SeriesMetadataExtractor;

struct SeriesGroup<'a> {
    representative: &'a InstanceFile,
    paths: BTreeSet<&'a Path>,
}

impl SeriesMetadataExtractor {
    /// Series come out in first-seen order; the first file of each series supplies the
    /// series-level attributes and `dim3` counts its distinct files.
    pub fn extract(study_uid: &str, files: &[InstanceFile]) -> Vec<Series> {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, SeriesGroup<'_>> = HashMap::new();

        for file in files {
            let Some(series_uid) = file.attributes.non_empty("SeriesInstanceUID") else {
                warn!(
                    study_uid,
                    path = %file.path.display(),
                    "file has no SeriesInstanceUID, ignoring"
                );
                continue;
            };
            let group = groups.entry(series_uid).or_insert_with(|| {
                order.push(series_uid);
                SeriesGroup {
                    representative: file,
                    paths: BTreeSet::new(),
                }
            });
            group.paths.insert(file.path.as_path());
        }

        order
            .into_iter()
            .filter_map(|uid| groups.remove(uid).map(|group| (uid, group)))
            .map(|(uid, group)| {
                series_from_attributes(
                    study_uid,
                    uid,
                    &group.representative.attributes,
                    group.paths.len(),
                )
            })
            .collect()
    }
}

fn series_from_attributes(
    study_uid: &str,
    series_uid: &str,
    attributes: &AttributeSet,
    dim3: usize,
) -> Series {
    let image_type = ImageType::parse(&attributes.text("ImageType"));
    Series {
        series_instance_uid: series_uid.to_string(),
        study_instance_uid: study_uid.to_string(),
        series_number: numeric(attributes, "SeriesNumber"),
        series_description: attributes.text("SeriesDescription"),
        protocol_name: attributes.text("ProtocolName"),
        sequence_name: attributes.text("SequenceName"),
        modality: attributes.text("Modality"),
        is_derived: image_type.is_derived(),
        is_motion_corrected: image_type.is_motion_corrected(),
        image_type,
        dim1: numeric(attributes, "Rows"),
        dim2: numeric(attributes, "Columns"),
        dim3,
        tr: numeric(attributes, "RepetitionTime"),
        te: numeric(attributes, "EchoTime"),
        fa: numeric(attributes, "FlipAngle"),
        slice_thickness: numeric(attributes, "SliceThickness"),
        acquisition_time: attributes.text("AcquisitionTime"),
        tar_file_path: None,
    }
}

/// First value of a possibly multi-valued numeric attribute.
fn numeric<T: FromStr>(attributes: &AttributeSet, keyword: &str) -> Option<T> {
    let raw = attributes.non_empty(keyword)?;
    let first = raw.split('\\').next().unwrap_or_default().trim();
    match first.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!(keyword, value = raw, "unparseable numeric attribute");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn file(path: &str, series_uid: &str) -> InstanceFile {
        InstanceFile {
            path: PathBuf::from(path),
            attributes: AttributeSet::new()
                .with("SeriesInstanceUID", series_uid)
                .with("SeriesNumber", "3")
                .with("ImageType", "ORIGINAL\\PRIMARY\\M\\ND")
                .with("Rows", "256")
                .with("Columns", "240")
                .with("RepetitionTime", "2300")
                .with("EchoTime", "2.98"),
        }
    }

    #[test]
    fn groups_by_series_in_first_seen_order() {
        let files = vec![
            file("/s/b1.dcm", "1.2.3.2"),
            file("/s/a1.dcm", "1.2.3.1"),
            file("/s/b2.dcm", "1.2.3.2"),
            file("/s/b2.dcm", "1.2.3.2"),
        ];
        let series = SeriesMetadataExtractor::extract("1.2.3", &files);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].series_instance_uid, "1.2.3.2");
        assert_eq!(series[0].dim3, 2);
        assert_eq!(series[1].series_instance_uid, "1.2.3.1");
        assert_eq!(series[1].dim3, 1);
        assert_eq!(series[0].study_instance_uid, "1.2.3");
    }

    #[test]
    fn malformed_numbers_only_blank_their_field() {
        let mut bad = file("/s/x.dcm", "1.2.3.9");
        bad.attributes.insert("RepetitionTime", "n/a");
        bad.attributes.insert("SliceThickness", "1.0\\1.2");
        let series = SeriesMetadataExtractor::extract("1.2.3", &[bad]);
        assert_eq!(series[0].tr, None);
        assert_eq!(series[0].te, Some(2.98));
        assert_eq!(series[0].slice_thickness, Some(1.0));
        assert_eq!(series[0].dim1, Some(256));
        assert_eq!(series[0].series_number, Some(3));
        assert_eq!(series[0].fa, None);
    }

    #[test]
    fn files_without_series_uid_are_ignored() {
        let mut orphan = file("/s/o.dcm", "");
        orphan.attributes.insert("SeriesInstanceUID", " ");
        let series = SeriesMetadataExtractor::extract("1.2.3", &[orphan, file("/s/1.dcm", "1.2.3.1")]);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn flags_follow_image_type_tokens() {
        let mut moco = file("/s/m.dcm", "1.2.3.4");
        moco.attributes
            .insert("ImageType", "DERIVED\\PRIMARY\\MOCO");
        let series = SeriesMetadataExtractor::extract("1.2.3", &[moco]);
        assert!(series[0].is_derived);
        assert!(series[0].is_motion_corrected);
    }
}
