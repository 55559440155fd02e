//! The streaming loader: archive in, populated namespace out.
//!
//! Rows are streamed one at a time through a pre-allocated CSV record, so
//! memory use is bounded regardless of archive size. A row never aborts its
//! table: a field that fails its ingest transform is stored as the absent
//! value and logged as a recoverable error. Only table-level failures
//! (required file missing, unreadable file, storage write failure) mark a
//! table fatal, and only archive-level failures (unopenable container,
//! unreachable store) mark the whole load fatal.

use log::{info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

use crate::error::Error;
use crate::feed_error::{FeedError, GtfsErrorType};
use crate::schema::{self, TableDef};
use crate::storage::{self, FeedStore, Value};

/// Outcome of loading one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableLoadResult {
    /// Rows persisted into the namespace
    pub row_count: u64,
    /// Set when this table could not be loaded at all
    pub fatal_error: Option<String>,
}

impl TableLoadResult {
    fn ok(row_count: u64) -> Self {
        TableLoadResult {
            row_count,
            fatal_error: None,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        TableLoadResult {
            row_count: 0,
            fatal_error: Some(message.into()),
        }
    }
}

/// Outcome of one whole load operation.
///
/// `fatal_error` is set only for archive-level failures; a single missing
/// or malformed table sets its own entry's `fatal_error` instead.
#[derive(Debug, Clone, Serialize)]
pub struct FeedLoadResult {
    /// The namespace the feed was loaded into; `None` when the operation
    /// could not run at all
    pub namespace: Option<String>,
    /// Per-table outcomes, keyed by registry table name
    pub tables: BTreeMap<String, TableLoadResult>,
    /// Archive- or store-level failure, when the operation could not run
    pub fatal_error: Option<String>,
}

impl FeedLoadResult {
    pub(crate) fn fatal(error: &Error) -> Self {
        FeedLoadResult {
            namespace: None,
            tables: BTreeMap::new(),
            fatal_error: Some(error.to_string()),
        }
    }

    /// The outcome for one table, if the load got far enough to record it.
    pub fn table(&self, name: &str) -> Option<&TableLoadResult> {
        self.tables.get(name)
    }

    /// True when neither the operation nor any table carries a fatal error.
    pub fn error_free(&self) -> bool {
        self.fatal_error.is_none() && self.tables.values().all(|t| t.fatal_error.is_none())
    }
}

/// A feed container: either a directory of `.txt` files or a zip archive.
///
/// Table files are located by name anywhere in the container; one found
/// below the root still loads but is flagged.
pub(crate) enum FeedArchive {
    Dir(PathBuf),
    Zip {
        archive: ZipArchive<BufReader<File>>,
        // table name -> (entry index, found in a subdirectory)
        entries: HashMap<String, (usize, bool)>,
        sha256: String,
    },
}

impl FeedArchive {
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        if path.is_dir() {
            Ok(FeedArchive::Dir(path.to_owned()))
        } else if path.is_file() {
            let file = File::open(path)?;
            let mut reader = BufReader::new(file);
            let mut hasher = Sha256::new();
            std::io::copy(&mut reader, &mut hasher)?;
            let sha256 = format!("{:x}", hasher.finalize());
            reader.rewind()?;
            let mut archive = ZipArchive::new(reader)?;
            let mut entries = HashMap::new();
            for i in 0..archive.len() {
                let entry = archive.by_index(i)?;
                let name = entry.name().to_owned();
                drop(entry);
                let entry_path = Path::new(&name);
                let Some(file_name) = entry_path.file_name().and_then(|f| f.to_str()) else {
                    continue;
                };
                let Some(table) = file_name.strip_suffix(".txt") else {
                    continue;
                };
                if schema::table(table).is_none() {
                    continue;
                }
                let in_subdir = entry_path.components().count() > 1;
                // A root-level entry always wins over a nested duplicate.
                match entries.get(table) {
                    Some((_, false)) => {}
                    _ => {
                        entries.insert(table.to_owned(), (i, in_subdir));
                    }
                }
            }
            Ok(FeedArchive::Zip {
                archive,
                entries,
                sha256,
            })
        } else {
            Err(Error::NotFileNorDirectory(path.display().to_string()))
        }
    }

    pub(crate) fn sha256(&self) -> Option<&str> {
        match self {
            FeedArchive::Dir(_) => None,
            FeedArchive::Zip { sha256, .. } => Some(sha256),
        }
    }

    /// Finds a table's file; the flag is true when it sits below the root.
    pub(crate) fn locate(&self, table: &str) -> Option<bool> {
        match self {
            FeedArchive::Dir(dir) => {
                let file_name = format!("{table}.txt");
                if dir.join(&file_name).is_file() {
                    return Some(false);
                }
                let nested = std::fs::read_dir(dir)
                    .ok()?
                    .filter_map(|e| e.ok())
                    .any(|e| e.path().is_dir() && e.path().join(&file_name).is_file());
                nested.then_some(true)
            }
            FeedArchive::Zip { entries, .. } => entries.get(table).map(|(_, nested)| *nested),
        }
    }

    /// Opens a located table file and hands its reader to `f`.
    pub(crate) fn with_table<T>(
        &mut self,
        table: &str,
        f: impl FnOnce(&mut dyn Read) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let file_name = format!("{table}.txt");
        match self {
            FeedArchive::Dir(dir) => {
                let root = dir.join(&file_name);
                let path = if root.is_file() {
                    root
                } else {
                    std::fs::read_dir(&*dir)?
                        .filter_map(|e| e.ok())
                        .map(|e| e.path().join(&file_name))
                        .find(|p| p.is_file())
                        .ok_or_else(|| Error::MissingTable(file_name.clone()))?
                };
                let mut file = File::open(path).map_err(|e| Error::NamedFileIo {
                    file_name: file_name.clone(),
                    source: Box::new(e),
                })?;
                f(&mut file)
            }
            FeedArchive::Zip {
                archive, entries, ..
            } => {
                let &(index, _) = entries
                    .get(table)
                    .ok_or_else(|| Error::MissingTable(file_name.clone()))?;
                let mut entry = archive.by_index(index).map_err(|e| Error::NamedFileIo {
                    file_name,
                    source: Box::new(e),
                })?;
                f(&mut entry)
            }
        }
    }
}

/// Loads the feed at `path` into a fresh namespace of `store`.
pub fn load(path: &Path, store: &FeedStore) -> FeedLoadResult {
    match load_inner(path, store) {
        Ok(result) => result,
        Err(e) => {
            warn!("load of {} failed: {e}", path.display());
            FeedLoadResult::fatal(&e)
        }
    }
}

fn load_inner(path: &Path, store: &FeedStore) -> Result<FeedLoadResult, Error> {
    let mut archive = FeedArchive::open(path)?;
    let mut conn = store.connect()?;
    let namespace = storage::generate_namespace();
    info!("loading {} into {namespace}", path.display());
    storage::create_errors_table(&conn, &namespace)?;

    let mut errors = Vec::new();
    let mut tables = BTreeMap::new();
    for def in schema::tables().filter(|t| !t.editor_only) {
        let result = match archive.locate(def.name) {
            None => {
                storage::create_feed_table(&conn, &namespace, def)?;
                if def.required {
                    errors.push(FeedError::new(GtfsErrorType::TableMissing).for_table(def.name));
                    TableLoadResult::fatal(format!("required table {} missing", def.name))
                } else {
                    TableLoadResult::ok(0)
                }
            }
            Some(in_subdirectory) => {
                if in_subdirectory {
                    errors.push(
                        FeedError::new(GtfsErrorType::TableInSubdirectory).for_table(def.name),
                    );
                }
                let loaded = archive.with_table(def.name, |reader| {
                    load_table(&mut conn, &namespace, def, reader, &mut errors)
                });
                match loaded {
                    Ok(count) => {
                        info!("loaded {count} rows into {namespace}.{}", def.name);
                        TableLoadResult::ok(count)
                    }
                    Err(e) => {
                        warn!("table {} failed to load: {e}", def.name);
                        // A half-written table counts as not loaded.
                        let physical = storage::physical_table(&namespace, def.name);
                        conn.execute(&format!("DROP TABLE IF EXISTS {physical}"), [])?;
                        storage::create_feed_table(&conn, &namespace, def)?;
                        TableLoadResult::fatal(e.to_string())
                    }
                }
            }
        };
        tables.insert(def.name.to_owned(), result);
    }

    storage::append_errors(&mut conn, &namespace, &errors)?;
    storage::register_namespace(
        &conn,
        &namespace,
        path.to_str(),
        archive.sha256(),
        None,
    )?;
    Ok(FeedLoadResult {
        namespace: Some(namespace),
        tables,
        fatal_error: None,
    })
}

/// Streams one table file into storage.
///
/// Returns the number of persisted rows; recoverable per-row findings are
/// appended to `errors`.
fn load_table(
    conn: &mut rusqlite::Connection,
    namespace: &str,
    def: &TableDef,
    reader: &mut dyn Read,
    errors: &mut Vec<FeedError>,
) -> Result<u64, Error> {
    let file_name = format!("{}.txt", def.name);
    // Probe for a UTF-8 byte order mark; files carrying one are accepted,
    // the mark itself is stripped.
    let mut bom = [0u8; 3];
    reader.read_exact(&mut bom).map_err(|e| Error::NamedFileIo {
        file_name: file_name.clone(),
        source: Box::new(e),
    })?;
    let head: &[u8] = if bom == [0xef, 0xbb, 0xbf] { &[] } else { &bom };
    let chained = head.chain(reader);

    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(chained);
    let headers = csv_reader
        .headers()
        .map_err(|e| Error::Csv {
            file_name: file_name.clone(),
            source: e,
        })?
        .clone();

    // Registry field -> column position in this particular file.
    let positions: Vec<Option<usize>> = def
        .fields
        .iter()
        .map(|f| headers.iter().position(|h| h == f.name))
        .collect();
    for (field, position) in def.fields.iter().zip(&positions) {
        if field.required && position.is_none() {
            errors.push(
                FeedError::new(GtfsErrorType::MissingField)
                    .for_table(def.name)
                    .for_field(field.name)
                    .with_message("required column missing from header"),
            );
        }
    }

    storage::create_feed_table(conn, namespace, def)?;
    let insert_sql = {
        let columns: Vec<&str> = def.fields.iter().map(|f| f.name).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            storage::physical_table(namespace, def.name),
            columns.join(", "),
            placeholders
        )
    };

    let tx = conn.transaction()?;
    let mut row_count = 0u64;
    {
        let mut stmt = tx.prepare(&insert_sql)?;
        let mut record = csv::StringRecord::new();
        // Header is line 1; data starts at line 2.
        let mut line = 1u64;
        loop {
            let more = csv_reader.read_record(&mut record).map_err(|e| Error::Csv {
                file_name: file_name.clone(),
                source: e,
            })?;
            if !more {
                break;
            }
            line += 1;

            let mut values = Vec::with_capacity(def.fields.len());
            let mut row_errors = Vec::new();
            for (field, position) in def.fields.iter().zip(&positions) {
                let raw = position.and_then(|i| record.get(i)).unwrap_or("");
                let value = match field.field_type.ingest(raw) {
                    Ok(Value::Null) if field.required => {
                        if position.is_some() {
                            row_errors.push(
                                FeedError::new(GtfsErrorType::MissingField)
                                    .for_table(def.name)
                                    .at_line(line)
                                    .for_field(field.name),
                            );
                        }
                        Value::Null
                    }
                    Ok(value) => value,
                    Err(message) => {
                        row_errors.push(
                            FeedError::new(GtfsErrorType::BadValue)
                                .for_table(def.name)
                                .at_line(line)
                                .for_field(field.name)
                                .with_message(message),
                        );
                        Value::Null
                    }
                };
                values.push(value);
            }

            let entity_id = def
                .key_fields
                .first()
                .and_then(|key| def.fields.iter().position(|f| &f.name == key))
                .and_then(|i| values[i].as_text())
                .map(str::to_owned);
            if let Some(id) = &entity_id {
                for err in &mut row_errors {
                    err.entity_id = Some(id.clone());
                }
            }
            errors.append(&mut row_errors);

            stmt.execute(rusqlite::params_from_iter(values.iter()))?;
            row_count += 1;
        }
    }
    tx.commit()?;

    if let Some(seq) = &def.sequence {
        normalize_sequence(conn, namespace, def.name, seq.partition, seq.field)?;
    }
    Ok(row_count)
}

/// Rewrites a per-parent ordinal to a zero-based index, preserving the
/// relative order of the incoming ordinals. Runs inside the storage engine
/// so memory stays bounded for arbitrarily large tables.
fn normalize_sequence(
    conn: &rusqlite::Connection,
    namespace: &str,
    table: &str,
    partition: &str,
    field: &str,
) -> Result<(), Error> {
    let physical = storage::physical_table(namespace, table);
    let sql = format!(
        "UPDATE {physical} SET {field} = (
            SELECT rn - 1 FROM (
                SELECT rowid AS rid,
                       ROW_NUMBER() OVER (
                           PARTITION BY {partition}
                           ORDER BY {field}, rowid
                       ) AS rn
                FROM {physical}
            ) WHERE rid = {physical}.rowid
        )"
    );
    conn.execute(&sql, [])?;
    Ok(())
}
