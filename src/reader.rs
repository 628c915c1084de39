use std::path::Path;

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::OpenFileOptions;

use crate::domain::AttributeSet;
use crate::error::Pacs2TarError;

/// Reads the header attributes of one retrieved file.
pub trait AttributeReader: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<AttributeSet, Pacs2TarError>;
}

/// Attributes consumed by the series extractor and the archive naming rule.
pub const HEADER_TAGS: [(&str, Tag); 22] = [
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
    ("PatientName", tags::PATIENT_NAME),
    ("PatientID", tags::PATIENT_ID),
    ("StudyDate", tags::STUDY_DATE),
    ("StudyDescription", tags::STUDY_DESCRIPTION),
    ("StudyID", tags::STUDY_ID),
    ("SeriesNumber", tags::SERIES_NUMBER),
    ("InstanceNumber", tags::INSTANCE_NUMBER),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("ProtocolName", tags::PROTOCOL_NAME),
    ("SequenceName", tags::SEQUENCE_NAME),
    ("Modality", tags::MODALITY),
    ("ImageType", tags::IMAGE_TYPE),
    ("Rows", tags::ROWS),
    ("Columns", tags::COLUMNS),
    ("RepetitionTime", tags::REPETITION_TIME),
    ("EchoTime", tags::ECHO_TIME),
    ("FlipAngle", tags::FLIP_ANGLE),
    ("SliceThickness", tags::SLICE_THICKNESS),
    ("AcquisitionTime", tags::ACQUISITION_TIME),
];

/// `AttributeReader` over DICOM Part 10 files; pixel data is never loaded.
#[derive(Debug, Clone, Default)]
pub struct DicomFileReader;

impl DicomFileReader {
    pub fn new() -> Self {
        Self
    }
}

impl AttributeReader for DicomFileReader {
    fn read_tags(&self, path: &Path) -> Result<AttributeSet, Pacs2TarError> {
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|err| Pacs2TarError::MetadataParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;

        let mut attributes = AttributeSet::new();
        for (keyword, tag) in HEADER_TAGS {
            let Ok(element) = obj.element(tag) else {
                continue;
            };
            if let Ok(value) = element.to_str() {
                attributes.insert(keyword, value.trim_end_matches('\0').trim());
            }
        }
        Ok(attributes)
    }
}
