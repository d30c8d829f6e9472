mod common;

use std::fs::File;
use std::io::Write;

use common::{TestWorkspace, tsv};
use encoding_rs::UTF_8;
use flate2::{Compression, write::GzEncoder};
use submission_migrate::error::{ErrorKind, classify};
use submission_migrate::reports::{
    ErrorDocument, OffsetIndex, error_document_parts, lines_from_documents, load_error_documents,
};

fn donor_file(ws: &TestWorkspace) -> std::path::PathBuf {
    // Row offsets: 19, 28, 39.
    ws.write(
        "donor.txt",
        &tsv(&["donor_id\tdonor_sex", "DO1\tmale", "DO2\tfemale", "DO3\t"]),
    )
}

fn gzip(ws: &TestWorkspace, name: &str, contents: &str) {
    let path = ws.path().join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    encoder.write_all(contents.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn offset_index_excludes_header_and_survives_save() {
    let ws = TestWorkspace::new();
    let index = OffsetIndex::build(&donor_file(&ws), UTF_8).unwrap();
    assert_eq!(index.len(), 3);
    assert_eq!(index.line_for(19), Some(0));
    assert_eq!(index.line_for(39), Some(2));
    assert_eq!(index.line_for(0), None);

    let saved = ws.path().join("donor.offsets");
    index.save(&saved).unwrap();
    assert_eq!(ws.read("donor.offsets"), "19\t0\n28\t1\n39\t2\n");
    assert_eq!(OffsetIndex::load(&saved).unwrap(), index);
}

#[test]
fn part_files_become_deduplicated_line_lists() {
    let ws = TestWorkspace::new();
    let index = OffsetIndex::build(&donor_file(&ws), UTF_8).unwrap();
    gzip(
        &ws,
        "errors/donor/part-00000.gz",
        concat!(
            "{\"offset\":28,\"errors\":[{\"type\":\"CODELIST_ERROR\",\"number\":1},",
            "{\"type\":\"MISSING_VALUE_ERROR\",\"number\":2}]}",
            "{\"offset\":39,\n \"errors\":[{\"type\":\"CODELIST_ERROR\",\"number\":1,\"value\":\"}{\"}]}"
        ),
    );
    ws.write(
        "errors/donor/part-00001",
        "\n{\"offset\":28,\"errors\":[{\"type\":\"CODELIST_ERROR\",\"number\":3}]}\n",
    );
    ws.write("errors/donor/_SUCCESS", "");

    let parts = error_document_parts(&ws.path().join("errors"), "donor").unwrap();
    assert_eq!(parts.len(), 2);
    let documents = load_error_documents(&parts).unwrap();
    let lines = lines_from_documents("donor", documents, &index).unwrap();

    assert_eq!(lines["CODELIST_ERROR"], vec![1, 2]);
    assert_eq!(lines["MISSING_VALUE_ERROR"], vec![1]);
}

#[test]
fn single_json_file_is_found_when_no_directory_exists() {
    let ws = TestWorkspace::new();
    gzip(&ws, "errors/specimen.json.gz", "{\"offset\":10,\"errors\":[]}");
    let parts = error_document_parts(&ws.path().join("errors"), "specimen").unwrap();
    assert_eq!(parts, vec![ws.path().join("errors/specimen.json.gz")]);
    let documents = load_error_documents(&parts)
        .unwrap()
        .collect::<anyhow::Result<Vec<ErrorDocument>>>()
        .unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].offset, 10);
}

#[test]
fn offset_inside_a_row_is_integrity_error() {
    let ws = TestWorkspace::new();
    let index = OffsetIndex::build(&donor_file(&ws), UTF_8).unwrap();
    ws.write("errors/donor.json", "{\"offset\":30,\"errors\":[{\"type\":\"X\",\"number\":1}]}");
    let parts = error_document_parts(&ws.path().join("errors"), "donor").unwrap();
    let err = lines_from_documents("donor", load_error_documents(&parts).unwrap(), &index)
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Integrity);
}

#[test]
fn text_between_documents_is_format_error() {
    let ws = TestWorkspace::new();
    let index = OffsetIndex::build(&donor_file(&ws), UTF_8).unwrap();
    ws.write("errors/donor.json", "{\"offset\":19,\"errors\":[]},{\"offset\":28,\"errors\":[]}");
    let parts = error_document_parts(&ws.path().join("errors"), "donor").unwrap();
    let err = lines_from_documents("donor", load_error_documents(&parts).unwrap(), &index)
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Format);
}
