use std::fs::{self, File};

use tempfile::tempdir;
use warehouse_batch::{
    core::record::{Columns, Record, Value},
    tasklet::{
        export::write_delimited,
        repair::{BackslashRepair, ExportRepair},
    },
};

fn read_back(path: &std::path::Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .from_path(path)
        .unwrap();

    let headers = reader
        .headers()
        .unwrap()
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|record| record.unwrap().iter().map(str::to_string).collect())
        .collect();

    (headers, rows)
}

#[test]
fn exported_rows_parse_back_to_the_loaded_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("05_beneficios_alumnos.csv");
    let columns = Columns::new(["code", "value"]);
    let records = vec![
        Record::new(vec![Value::from("A"), Value::from("1;2")]),
        Record::new(vec![Value::from("B"), Value::from("")]),
    ];

    write_delimited(&columns, &records, b';', File::create(&path).unwrap()).unwrap();
    let removed = BackslashRepair::default().repair(&path).unwrap();

    assert_eq!(removed, 0);

    let content = fs::read_to_string(&path).unwrap();
    assert!(!content.contains("null"));

    let (headers, rows) = read_back(&path);
    assert_eq!(headers, vec!["code", "value"]);
    assert_eq!(
        rows,
        vec![
            vec!["A".to_string(), "1;2".to_string()],
            vec!["B".to_string(), String::new()],
        ]
    );
}

#[test]
fn null_is_written_as_an_empty_field() {
    let columns = Columns::new(["id", "note"]);
    let records = vec![Record::new(vec![Value::Int(7), Value::Null])];

    let bytes = write_delimited(&columns, &records, b';', Vec::new()).unwrap();

    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        "\"id\";\"note\"\n\"7\";\"\"\n"
    );
}

#[test]
fn repaired_export_is_still_parseable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("export.csv");
    let columns = Columns::new(["path"]);
    let records = vec![Record::new(vec![Value::from("C:\\temp\\")])];

    write_delimited(&columns, &records, b';', File::create(&path).unwrap()).unwrap();
    BackslashRepair::default().repair(&path).unwrap();

    let (_, rows) = read_back(&path);
    assert_eq!(rows, vec![vec!["C:\\temp\\".to_string()]]);
}
