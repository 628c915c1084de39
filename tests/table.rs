use pacs2tar::domain::{ImageType, Series, Study};
use pacs2tar::table::{
    MetadataTableWriter, SERIES_COLUMNS, TableSchema, WriteMode, parse_series_row, read_table,
};

fn study() -> Study {
    Study {
        study_instance_uid: "1.3.12.2.1107.5.2.43".to_string(),
        patient_name: "2024_03_14_P07".to_string(),
        patient_id: "P07".to_string(),
        study_date: "20240314".to_string(),
        study_description: "Khan^NeuroAnalytics".to_string(),
        ..Study::default()
    }
}

fn full_series() -> Series {
    let image_type = ImageType::parse("DERIVED\\PRIMARY\\MOCO\\NONE");
    Series {
        series_instance_uid: "1.3.12.2.1107.5.2.43.7".to_string(),
        study_instance_uid: "1.3.12.2.1107.5.2.43".to_string(),
        series_number: Some(7),
        series_description: "bold_rest, eyes open".to_string(),
        protocol_name: "bold_rest".to_string(),
        sequence_name: "epfid2d1_64".to_string(),
        modality: "MR".to_string(),
        is_derived: image_type.is_derived(),
        is_motion_corrected: image_type.is_motion_corrected(),
        image_type,
        dim1: Some(64),
        dim2: Some(64),
        dim3: 300,
        tr: Some(2000.0),
        te: Some(30.0),
        fa: Some(77.5),
        slice_thickness: Some(3.5),
        acquisition_time: "101512.345000".to_string(),
        tar_file_path: Some("/data/out/2024_03_14_P07_20240314_Khan_NeuroAnalytics.tar".to_string()),
    }
}

fn sparse_series() -> Series {
    Series {
        series_instance_uid: "1.3.12.2.1107.5.2.43.99".to_string(),
        study_instance_uid: "1.3.12.2.1107.5.2.43".to_string(),
        series_number: None,
        series_description: String::new(),
        protocol_name: String::new(),
        sequence_name: String::new(),
        modality: "SR".to_string(),
        image_type: ImageType::default(),
        is_derived: false,
        is_motion_corrected: false,
        dim1: None,
        dim2: None,
        dim3: 1,
        tr: None,
        te: None,
        fa: None,
        slice_thickness: None,
        acquisition_time: String::new(),
        tar_file_path: None,
    }
}

#[test]
fn series_rows_survive_a_write_and_read() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("series_metadata.tsv");
    let mut writer =
        MetadataTableWriter::open(&path, TableSchema::Series, WriteMode::Truncate).unwrap();
    let written = writer
        .write_series(&study(), &[full_series(), sparse_series()])
        .unwrap();
    assert_eq!(written, 2);

    let table = read_table(&path).unwrap();
    assert_eq!(table.headers, SERIES_COLUMNS);
    assert_eq!(table.schema(), Some(TableSchema::Series));
    assert_eq!(table.rows.len(), 2);

    let (parsed_study, parsed) = parse_series_row(&table.rows[0]).unwrap();
    assert_eq!(parsed_study, study());
    assert_eq!(parsed, full_series());
    assert_eq!(table.rows[0][10], "DERIVED\\PRIMARY\\MOCO\\NONE");
    assert_eq!(table.rows[0][11], "true");

    let (_, parsed) = parse_series_row(&table.rows[1]).unwrap();
    assert_eq!(parsed, sparse_series());
    assert_eq!(table.rows[1][13], "");
    assert_eq!(table.rows[1][22], "");
}

#[test]
fn appending_the_same_series_again_writes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("series_metadata.tsv");
    let mut writer =
        MetadataTableWriter::open(&path, TableSchema::Series, WriteMode::Append).unwrap();
    assert_eq!(writer.write_series(&study(), &[full_series()]).unwrap(), 1);

    let mut reopened =
        MetadataTableWriter::open(&path, TableSchema::Series, WriteMode::Append).unwrap();
    assert!(reopened.contains("1.3.12.2.1107.5.2.43.7"));
    let written = reopened
        .write_series(&study(), &[full_series(), sparse_series()])
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(read_table(&path).unwrap().rows.len(), 2);
}

#[test]
fn malformed_rows_are_reported_by_column() {
    let mut row: Vec<String> = pacs2tar::table::series_fields(&study(), &full_series());
    row[11] = "maybe".to_string();
    let err = parse_series_row(&row).unwrap_err();
    assert!(err.contains("is_derived"));

    row.truncate(20);
    let err = parse_series_row(&row).unwrap_err();
    assert!(err.contains("expected 23 fields"));
}
