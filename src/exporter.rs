//! The exporter: serializes a namespace back into a GTFS zip archive,
//! reversing every loader normalization.
//!
//! Dates come back out as `YYYYMMDD`, elapsed-seconds times as `HH:MM:SS`
//! (hours past 24 included), and absent values as empty cells, never a
//! literal `null`. The zero-based sequence index is re-emitted as a
//! contiguous ascending ordinal: starting at 1 for a directly-loaded
//! namespace, at 0 when `from_editor` is set. The archive is written to a
//! temporary file and only renamed into place on success, so a failed
//! export never leaves a partial archive behind.

use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::error::Error;
use crate::schema::{self, TableDef};
use crate::storage::{self, FeedStore, Value};

/// Writes the feed stored in `namespace` as a zip archive at `destination`.
pub fn export(
    namespace: &str,
    destination: &Path,
    store: &FeedStore,
    from_editor: bool,
) -> Result<(), Error> {
    let conn = store.connect()?;
    if !storage::namespace_registered(&conn, namespace)? {
        return Err(Error::UnknownNamespace(namespace.to_owned()));
    }

    let temp = temp_path(destination);
    match write_archive(&conn, namespace, from_editor, &temp) {
        Ok(table_count) => {
            std::fs::rename(&temp, destination)?;
            info!(
                "exported {table_count} tables of {namespace} to {}",
                destination.display()
            );
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            Err(e)
        }
    }
}

fn temp_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export.zip".to_owned());
    destination.with_file_name(format!("{name}.part"))
}

fn write_archive(
    conn: &rusqlite::Connection,
    namespace: &str,
    from_editor: bool,
    path: &Path,
) -> Result<u64, Error> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let mut table_count = 0u64;

    for def in schema::tables().filter(|t| !t.editor_only) {
        let physical = storage::physical_table(namespace, def.name);
        if !storage::table_exists(conn, &physical)? {
            continue;
        }
        let rows = storage::row_count(conn, namespace, def.name)?;
        if rows == 0 {
            // Required tables are still emitted header-only, except where
            // the editor derives them and an empty one means "not managed
            // in this mode".
            if !def.required || (from_editor && def.editor_optional) {
                continue;
            }
        }

        zip.start_file(format!("{}.txt", def.name), FileOptions::default())?;
        write_table(conn, namespace, def, from_editor, &mut zip)?;
        table_count += 1;
    }

    let mut inner = zip.finish()?;
    inner.flush()?;
    Ok(table_count)
}

fn write_table<W: Write + std::io::Seek>(
    conn: &rusqlite::Connection,
    namespace: &str,
    def: &TableDef,
    from_editor: bool,
    zip: &mut ZipWriter<W>,
) -> Result<(), Error> {
    let file_name = format!("{}.txt", def.name);
    let csv_error = |e: csv::Error| Error::Csv {
        file_name: file_name.clone(),
        source: e,
    };
    // Both valid monotonic renumberings; which base is used is part of the
    // export mode, not of the stored data.
    let sequence_base = if from_editor { 0 } else { 1 };

    let mut writer = csv::Writer::from_writer(zip);
    writer
        .write_record(def.fields.iter().map(|f| f.name))
        .map_err(csv_error)?;

    storage::stream_rows(conn, namespace, def, |record| {
        let mut cells = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let value = record.get(field.name);
            let is_sequence = def
                .sequence
                .as_ref()
                .is_some_and(|seq| seq.field == field.name);
            let cell = match (is_sequence, value) {
                (true, Value::Int(index)) => (index + sequence_base).to_string(),
                _ => field.field_type.emit(value),
            };
            cells.push(cell);
        }
        writer.write_record(&cells).map_err(csv_error)?;
        Ok(())
    })?;
    writer.flush()?;
    Ok(())
}
