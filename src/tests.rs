use crate::feed_error::GtfsErrorType;
use crate::storage::{FeedStore, Value};
use crate::validator::{self, Validator};
use crate::{export, load, make_snapshot, validate};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::FileOptions;

fn test_store(dir: &TempDir) -> FeedStore {
    FeedStore::open(dir.path().join("feeds.db")).expect("impossible to open store")
}

fn fixture(name: &str) -> PathBuf {
    Path::new("fixtures").join(name)
}

/// Copies a fixture into `dir`, optionally replacing or removing one table
/// file, and returns the copy's path.
fn fixture_copy(dir: &TempDir, name: &str, patch: Option<(&str, Option<&str>)>) -> PathBuf {
    let target = dir.path().join(name);
    std::fs::create_dir(&target).unwrap();
    for entry in std::fs::read_dir(fixture(name)).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), target.join(entry.file_name())).unwrap();
    }
    if let Some((table, content)) = patch {
        let file = target.join(format!("{table}.txt"));
        match content {
            Some(content) => std::fs::write(&file, content).unwrap(),
            None => std::fs::remove_file(&file).unwrap(),
        }
    }
    target
}

/// Zips a fixture directory, optionally nesting every entry below a
/// subdirectory, and returns the zip's path.
fn zip_fixture(dir: &TempDir, name: &str, nested: bool) -> PathBuf {
    let zip_path = dir.path().join(format!("{name}.zip"));
    let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
    for entry in std::fs::read_dir(fixture(name)).unwrap() {
        let entry = entry.unwrap();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let entry_name = if nested {
            format!("{name}/{file_name}")
        } else {
            file_name
        };
        zip.start_file(entry_name, FileOptions::default()).unwrap();
        let content = std::fs::read(entry.path()).unwrap();
        zip.write_all(&content).unwrap();
    }
    zip.finish().unwrap();
    zip_path
}

/// Reads one table out of an exported zip as raw header-keyed string rows.
fn read_exported_table(archive: &Path, table: &str) -> Option<Vec<BTreeMap<String, String>>> {
    let mut zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
    let mut entry = match zip.by_name(&format!("{table}.txt")) {
        Ok(entry) => entry,
        Err(_) => return None,
    };
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let headers = reader.headers().unwrap().clone();
    let rows = reader
        .records()
        .map(|rec| {
            let rec = rec.unwrap();
            headers
                .iter()
                .map(String::from)
                .zip(rec.iter().map(String::from))
                .collect()
        })
        .collect();
    Some(rows)
}

fn load_fixture(store: &FeedStore, path: &Path) -> String {
    let result = load(path, store);
    assert!(result.error_free(), "load failed: {result:?}");
    result.namespace.clone().unwrap()
}

#[test]
fn load_and_validate_simple_agency() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let result = load(fixture("fake-agency"), &store);
    assert!(result.error_free(), "{result:?}");
    assert_eq!(1, result.table("agency").unwrap().row_count);
    assert_eq!(1, result.table("routes").unwrap().row_count);
    assert_eq!(2, result.table("stops").unwrap().row_count);
    assert_eq!(2, result.table("trips").unwrap().row_count);
    assert_eq!(2, result.table("stop_times").unwrap().row_count);
    assert_eq!(2, result.table("shapes").unwrap().row_count);

    let namespace = result.namespace.as_deref().unwrap();
    let validated = validate(namespace, &store);
    assert!(validated.fatal_error.is_none());
    assert_eq!(
        0,
        store
            .count_errors(namespace, GtfsErrorType::ValidatorFailed)
            .unwrap()
    );
    assert_eq!(
        0,
        store
            .count_errors(namespace, GtfsErrorType::RefIntegrity)
            .unwrap()
    );

    // External ordinals 1 and 2 are stored as zero-based indexes.
    let first = store
        .query(namespace, "stop_times", &[("stop_id", Value::Text("4u6g".into()))], None)
        .unwrap();
    assert_eq!(1, first.len());
    assert_eq!(&Value::Int(0), first[0].get("stop_sequence"));
    assert_eq!(&Value::Int(25200), first[0].get("arrival_time"));

    // Post-midnight times keep their full elapsed-seconds value.
    let second = store
        .query(namespace, "stop_times", &[("stop_id", Value::Text("johv".into()))], None)
        .unwrap();
    assert_eq!(&Value::Int(1), second[0].get("stop_sequence"));
    assert_eq!(&Value::Int(25 * 3600 + 600), second[0].get("arrival_time"));

    let calendar = store.query(namespace, "calendar", &[], None).unwrap();
    assert_eq!(&Value::Int(20170915), calendar[0].get("start_date"));

    // The absent agency_lang is stored as null, not as an empty string.
    let agency = store.query(namespace, "agency", &[], None).unwrap();
    assert_eq!(&Value::Null, agency[0].get("agency_lang"));
}

#[test]
fn query_honors_predicates_and_window() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let namespace = load_fixture(&store, &fixture("fake-agency"));

    let all = store.query(&namespace, "stop_times", &[], None).unwrap();
    assert_eq!(2, all.len());
    let windowed = store
        .query(&namespace, "stop_times", &[], Some((1, 10)))
        .unwrap();
    assert_eq!(1, windowed.len());
    assert_eq!(&Value::Text("johv".into()), windowed[0].get("stop_id"));

    assert!(store
        .query(&namespace, "no_such_table", &[], None)
        .is_err());
    assert!(store
        .query(&namespace, "stops", &[("no_such_field", Value::Null)], None)
        .is_err());
}

#[test]
fn bad_calendar_date_is_recoverable() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let result = load(fixture("fake-agency-bad-calendar-date"), &store);
    // One malformed date never aborts the table, let alone the load.
    assert!(result.error_free(), "{result:?}");
    assert_eq!(1, result.table("calendar").unwrap().row_count);

    let namespace = result.namespace.as_deref().unwrap();
    assert!(store.count_errors(namespace, GtfsErrorType::BadValue).unwrap() >= 1);

    let calendar = store.query(namespace, "calendar", &[], None).unwrap();
    assert_eq!(&Value::Null, calendar[0].get("start_date"));
    assert_eq!(&Value::Int(20170917), calendar[0].get("end_date"));

    let errors = store.errors(namespace).unwrap();
    let bad_value = errors
        .iter()
        .find(|e| e.error_type == GtfsErrorType::BadValue)
        .unwrap();
    assert_eq!(Some("calendar"), bad_value.table.as_deref());
    assert_eq!(Some("start_date"), bad_value.field.as_deref());
    assert_eq!(Some(2), bad_value.line);

    // The whole load/validate/export cycle still goes through.
    assert!(validate(namespace, &store).fatal_error.is_none());
    let out = dir.path().join("bad-dates.zip");
    export(namespace, &out, &store, false).unwrap();
    let rows = read_exported_table(&out, "calendar").unwrap();
    assert_eq!("", rows[0]["start_date"]);
    assert_eq!("20170917", rows[0]["end_date"]);
}

#[test]
fn missing_required_table_is_table_fatal_only() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let feed = fixture_copy(&dir, "fake-agency", Some(("trips", None)));
    let result = load(&feed, &store);
    assert!(result.fatal_error.is_none());
    assert!(result.table("trips").unwrap().fatal_error.is_some());
    assert_eq!(1, result.table("agency").unwrap().row_count);
    assert_eq!(2, result.table("stops").unwrap().row_count);

    let namespace = result.namespace.as_deref().unwrap();
    assert_eq!(
        1,
        store
            .count_errors(namespace, GtfsErrorType::TableMissing)
            .unwrap()
    );
}

#[test]
fn unreadable_archive_is_fatal_overall() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let result = load(dir.path().join("no-such-feed"), &store);
    assert!(result.fatal_error.is_some());
    assert!(result.namespace.is_none());
}

#[test]
fn corrupt_zip_is_fatal_overall() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let bogus = dir.path().join("feed.zip");
    std::fs::write(&bogus, b"this is not a zip archive").unwrap();
    let result = load(&bogus, &store);
    assert!(result.fatal_error.is_some());
}

#[test]
fn zipped_feed_loads() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let archive = zip_fixture(&dir, "fake-agency", false);
    let result = load(&archive, &store);
    assert!(result.error_free(), "{result:?}");
    let namespace = result.namespace.as_deref().unwrap();
    assert_eq!(
        0,
        store
            .count_errors(namespace, GtfsErrorType::TableInSubdirectory)
            .unwrap()
    );
}

#[test]
fn feed_in_zip_subdirectory_is_flagged_but_loaded() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let archive = zip_fixture(&dir, "fake-agency", true);
    let result = load(&archive, &store);
    assert!(result.error_free(), "{result:?}");
    assert_eq!(2, result.table("stop_times").unwrap().row_count);

    let namespace = result.namespace.as_deref().unwrap();
    assert!(
        store
            .count_errors(namespace, GtfsErrorType::TableInSubdirectory)
            .unwrap()
            >= 1
    );
    // Data is intact despite the layout warning.
    let stops = store.query(namespace, "stops", &[], None).unwrap();
    assert_eq!(2, stops.len());
}

#[test]
fn export_reverses_every_ingest_transform() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let namespace = load_fixture(&store, &fixture("fake-agency"));
    let out = dir.path().join("exported.zip");
    export(&namespace, &out, &store, false).unwrap();

    let stop_times = read_exported_table(&out, "stop_times").unwrap();
    // The stored zero-based index comes back out 1-based: the first stop
    // of the trip is ordinal 1 again.
    assert_eq!("1", stop_times[0]["stop_sequence"]);
    assert_eq!("07:00:00", stop_times[0]["arrival_time"]);
    assert_eq!("2", stop_times[1]["stop_sequence"]);
    assert_eq!("25:10:00", stop_times[1]["arrival_time"]);

    let calendar = read_exported_table(&out, "calendar").unwrap();
    assert_eq!("20170915", calendar[0]["start_date"]);
    assert_eq!("20170917", calendar[0]["end_date"]);

    // Absent values come out as empty cells, never a literal null token.
    let agency = read_exported_table(&out, "agency").unwrap();
    assert_eq!("", agency[0]["agency_lang"]);
    assert_eq!("Fake Transit", agency[0]["agency_name"]);

    let fares = read_exported_table(&out, "fare_attributes").unwrap();
    let price: f64 = fares[0]["price"].parse().unwrap();
    assert!((price - 1.23).abs() < 1e-9);

    let frequencies = read_exported_table(&out, "frequencies").unwrap();
    assert_eq!("08:00:00", frequencies[0]["start_time"]);
    assert_eq!("09:00:00", frequencies[0]["end_time"]);
}

#[test]
fn exported_archive_reimports_identically() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let first = load_fixture(&store, &fixture("fake-agency"));
    let out = dir.path().join("roundtrip.zip");
    export(&first, &out, &store, false).unwrap();

    let second = load_fixture(&store, &out);
    for table in ["agency", "calendar", "stops", "trips", "stop_times", "shapes"] {
        let a = store.query(&first, table, &[], None).unwrap();
        let b = store.query(&second, table, &[], None).unwrap();
        assert_eq!(a.len(), b.len(), "row count differs for {table}");
        for (left, right) in a.iter().zip(&b) {
            for (field, value) in left.iter() {
                match (value, right.get(field)) {
                    (Value::Real(x), Value::Real(y)) => {
                        assert!((x - y).abs() < 1e-6, "{table}.{field}: {x} vs {y}")
                    }
                    (other, got) => assert_eq!(other, got, "{table}.{field}"),
                }
            }
        }
    }
}

#[test]
fn snapshot_copies_every_record_and_adds_editor_tables() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let source = load_fixture(&store, &fixture("fake-agency"));
    let snapshot = make_snapshot(&source, &store);
    assert!(snapshot.error_free(), "{snapshot:?}");
    let copy = snapshot.namespace.as_deref().unwrap();

    for table in ["agency", "routes", "stops", "trips", "stop_times"] {
        let a = store.query(&source, table, &[], None).unwrap();
        let b = store.query(copy, table, &[], None).unwrap();
        assert_eq!(a.len(), b.len(), "{table}");
        for (left, right) in a.iter().zip(&b) {
            for (field, value) in left.iter() {
                assert_eq!(value, right.get(field), "{table}.{field}");
            }
        }
    }

    // Editor-only tables are present and empty.
    assert_eq!(
        0,
        store.query(copy, "schedule_exceptions", &[], None).unwrap().len()
    );
    assert_eq!(0, snapshot.table("schedule_exceptions").unwrap().row_count);

    // The source namespace is untouched.
    assert_eq!(2, store.query(&source, "stop_times", &[], None).unwrap().len());
}

#[test]
fn editor_export_renumbers_sequences_from_zero() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let source = load_fixture(&store, &fixture("fake-agency"));
    let snapshot = make_snapshot(&source, &store);
    let copy = snapshot.namespace.as_deref().unwrap();

    let out = dir.path().join("editor.zip");
    export(copy, &out, &store, true).unwrap();
    let stop_times = read_exported_table(&out, "stop_times").unwrap();
    assert_eq!("0", stop_times[0]["stop_sequence"]);
    assert_eq!("1", stop_times[1]["stop_sequence"]);
}

#[test]
fn feed_with_only_calendar_dates_loads_and_exports() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let result = load(fixture("only-calendar-dates"), &store);
    assert!(result.error_free(), "{result:?}");
    assert_eq!(0, result.table("calendar").unwrap().row_count);
    assert_eq!(1, result.table("calendar_dates").unwrap().row_count);

    let namespace = result.namespace.as_deref().unwrap();
    let out = dir.path().join("no-calendar.zip");
    export(namespace, &out, &store, false).unwrap();
    assert!(read_exported_table(&out, "calendar").is_none());
    let dates = read_exported_table(&out, "calendar_dates").unwrap();
    assert_eq!("20170916", dates[0]["date"]);
}

#[test]
fn dangling_foreign_key_is_recoverable() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let feed = fixture_copy(
        &dir,
        "fake-agency",
        Some((
            "stop_times",
            Some(
                "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
                 a30277f8-e50a-4a85-9141-b1e0da9d429d,07:00:00,07:00:00,4u6g,1\n\
                 a30277f8-e50a-4a85-9141-b1e0da9d429d,07:10:00,07:10:00,ghost,2\n",
            ),
        )),
    );
    let result = load(&feed, &store);
    assert!(result.error_free(), "{result:?}");
    assert_eq!(2, result.table("trips").unwrap().row_count);

    let namespace = result.namespace.as_deref().unwrap();
    assert!(validate(namespace, &store).fatal_error.is_none());
    assert!(
        store
            .count_errors(namespace, GtfsErrorType::RefIntegrity)
            .unwrap()
            >= 1
    );
    let errors = store.errors(namespace).unwrap();
    let violation = errors
        .iter()
        .find(|e| e.error_type == GtfsErrorType::RefIntegrity)
        .unwrap();
    assert_eq!(Some("stop_times"), violation.table.as_deref());
    assert_eq!(Some("stop_id"), violation.field.as_deref());
}

#[test]
fn duplicate_primary_keys_are_detected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let feed = fixture_copy(
        &dir,
        "fake-agency",
        Some((
            "trips",
            Some(
                "trip_id,route_id,service_id\n\
                 t1,1,04100312-8fe1-46a5-a9f2-556f39478f57\n\
                 t1,1,04100312-8fe1-46a5-a9f2-556f39478f57\n",
            ),
        )),
    );
    let result = load(&feed, &store);
    let namespace = result.namespace.as_deref().unwrap();
    assert!(validate(namespace, &store).fatal_error.is_none());
    assert_eq!(
        1,
        store
            .count_errors(namespace, GtfsErrorType::DuplicateId)
            .unwrap()
    );
    let errors = store.errors(namespace).unwrap();
    let duplicate = errors
        .iter()
        .find(|e| e.error_type == GtfsErrorType::DuplicateId)
        .unwrap();
    assert_eq!(Some("t1"), duplicate.entity_id.as_deref());
}

#[test]
fn reversed_calendar_range_is_flagged() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let feed = fixture_copy(
        &dir,
        "fake-agency",
        Some((
            "calendar",
            Some(
                "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
                 04100312-8fe1-46a5-a9f2-556f39478f57,1,1,1,1,1,1,1,20170917,20170915\n",
            ),
        )),
    );
    let result = load(&feed, &store);
    let namespace = result.namespace.as_deref().unwrap();
    assert!(validate(namespace, &store).fatal_error.is_none());
    assert_eq!(
        1,
        store
            .count_errors(namespace, GtfsErrorType::DateRange)
            .unwrap()
    );
}

#[test]
fn a_crashing_validator_never_stops_the_others() {
    fn exploding(
        _conn: &rusqlite::Connection,
        _namespace: &str,
        _errors: &mut Vec<crate::FeedError>,
    ) -> Result<(), crate::Error> {
        panic!("deliberate failure");
    }

    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    // A feed with one dangling reference, so the real validator has
    // something to find after the crash.
    let feed = fixture_copy(
        &dir,
        "fake-agency",
        Some((
            "stop_times",
            Some(
                "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
                 a30277f8-e50a-4a85-9141-b1e0da9d429d,07:00:00,07:00:00,ghost,1\n",
            ),
        )),
    );
    let namespace = load(&feed, &store).namespace.unwrap();

    let pipeline = [
        Validator {
            name: "exploding",
            tables: &["trips"],
            run: exploding,
        },
        Validator {
            name: "referential_integrity",
            tables: &["stop_times"],
            run: validator::referential_integrity,
        },
    ];
    validator::run_pipeline(&namespace, &store, &pipeline).unwrap();

    assert_eq!(
        1,
        store
            .count_errors(&namespace, GtfsErrorType::ValidatorFailed)
            .unwrap()
    );
    assert!(
        store
            .count_errors(&namespace, GtfsErrorType::RefIntegrity)
            .unwrap()
            >= 1
    );
    let errors = store.errors(&namespace).unwrap();
    let failed = errors
        .iter()
        .find(|e| e.error_type == GtfsErrorType::ValidatorFailed)
        .unwrap();
    assert_eq!(Some("exploding"), failed.entity_id.as_deref());
    assert_eq!(Some("trips"), failed.table.as_deref());
}

#[test]
fn validating_an_unknown_namespace_is_fatal() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let result = validate("ns_nonexistent", &store);
    assert!(result.fatal_error.is_some());

    let snapshot = make_snapshot("ns_nonexistent", &store);
    assert!(snapshot.fatal_error.is_some());
    assert!(snapshot.namespace.is_none());

    let dir2 = TempDir::new().unwrap();
    assert!(export("ns_nonexistent", &dir2.path().join("x.zip"), &store, false).is_err());
}

#[test]
fn concurrent_loads_produce_independent_namespaces() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || load(fixture("fake-agency"), &store))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for result in &results {
        assert!(result.error_free(), "{result:?}");
    }
    assert_ne!(results[0].namespace, results[1].namespace);
    for result in &results {
        let namespace = result.namespace.as_deref().unwrap();
        assert_eq!(2, store.query(namespace, "stops", &[], None).unwrap().len());
    }
}

#[test]
fn results_serialize_for_callers() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let result = load(fixture("fake-agency"), &store);
    let json = serde_json::to_string(&result).unwrap();
    assert!(json.contains("\"namespace\""));
    assert!(json.contains("\"stop_times\""));

    let namespace = result.namespace.as_deref().unwrap();
    let json = serde_json::to_string(&validate(namespace, &store)).unwrap();
    assert!(json.contains("\"fatal_error\":null"));
}

#[test]
fn bom_in_table_file_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let feed = fixture_copy(&dir, "fake-agency", None);
    let agency = feed.join("agency.txt");
    let mut content = std::fs::read(&agency).unwrap();
    let mut with_bom = vec![0xef, 0xbb, 0xbf];
    with_bom.append(&mut content);
    std::fs::write(&agency, with_bom).unwrap();

    let result = load(&feed, &store);
    assert!(result.error_free(), "{result:?}");
    let namespace = result.namespace.as_deref().unwrap();
    let agencies = store.query(namespace, "agency", &[], None).unwrap();
    assert_eq!(&Value::Text("Fake Transit".into()), agencies[0].get("agency_name"));
}
