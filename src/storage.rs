//! The namespace-scoped storage layer.
//!
//! One [FeedStore] wraps one SQLite database file. Each loaded or
//! snapshotted feed lives in its own namespace; since SQLite has no schema
//! objects, a namespace is a table-name prefix (`<namespace>_<table>`).
//! Every operation opens its own connection, and the database runs in WAL
//! mode so concurrent operations on different namespaces never block each
//! other's reads.
//!
//! All SQL identifiers interpolated here come from the static schema
//! registry or from generated namespace ids, never from archive content.

use chrono::Utc;
use log::info;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Error;
use crate::feed_error::{FeedError, GtfsErrorType};
use crate::schema::{self, FieldType, TableDef};

/// An internal field value, mapping 1:1 onto SQLite storage classes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    /// Absent; always round-trips to an empty external cell
    Null,
    /// Text and identifiers
    Text(String),
    /// Integers, normalized dates (`yyyymmdd`) and times (elapsed seconds)
    Int(i64),
    /// Floating point numbers
    Real(f64),
}

impl Value {
    /// The integer content, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The textual content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Int(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Value::Null),
            ValueRef::Integer(i) => Ok(Value::Int(i)),
            ValueRef::Real(f) => Ok(Value::Real(f)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| Value::Text(s.to_owned()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

/// One stored row: field name to value.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Record { values }
    }

    /// The value of a field; [Value::Null] when the field is absent.
    pub fn get(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&Value::Null)
    }

    /// Iterates `(field, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Handle on one feed store database.
///
/// Cheap to clone; every operation opens its own connection, so independent
/// loads, validations, snapshots and exports can run concurrently against
/// different namespaces of the same store.
#[derive(Debug, Clone)]
pub struct FeedStore {
    path: PathBuf,
}

impl FeedStore {
    /// Opens (creating if needed) the store at `path` and initializes the
    /// namespace registry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let store = FeedStore {
            path: path.as_ref().to_owned(),
        };
        let conn = store.connect()?;
        // WAL returns its new mode as a result row, so this cannot go
        // through execute().
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS feeds (
                namespace TEXT PRIMARY KEY,
                loaded_at TEXT NOT NULL,
                source TEXT,
                sha256 TEXT,
                snapshot_of TEXT
            )",
            [],
        )?;
        Ok(store)
    }

    pub(crate) fn connect(&self) -> Result<Connection, Error> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(conn)
    }

    /// Whether a namespace is registered in this store.
    pub fn namespace_exists(&self, namespace: &str) -> Result<bool, Error> {
        let conn = self.connect()?;
        namespace_registered(&conn, namespace)
    }

    /// All registered namespaces, oldest first.
    pub fn namespaces(&self) -> Result<Vec<String>, Error> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT namespace FROM feeds ORDER BY loaded_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Fetches rows of `table` in `namespace`, filtered by equality
    /// predicates on fields and bounded by an `(offset, limit)` window.
    ///
    /// This is the read contract the query layer is built on: repeated
    /// bounded lookups, always referentially closed within one namespace.
    pub fn query(
        &self,
        namespace: &str,
        table: &str,
        predicates: &[(&str, Value)],
        window: Option<(u64, u64)>,
    ) -> Result<Vec<Record>, Error> {
        let def = schema::table(table).ok_or_else(|| Error::UnknownTable(table.to_owned()))?;
        for (field, _) in predicates {
            if def.field(field).is_none() {
                return Err(Error::UnknownField {
                    table: table.to_owned(),
                    field: (*field).to_owned(),
                });
            }
        }
        let conn = self.connect()?;
        if !namespace_registered(&conn, namespace)? {
            return Err(Error::UnknownNamespace(namespace.to_owned()));
        }

        let columns: Vec<&str> = def.fields.iter().map(|f| f.name).collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            physical_table(namespace, table)
        );
        if !predicates.is_empty() {
            let clauses: Vec<String> = predicates.iter().map(|(f, _)| format!("{f} = ?")).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");
        let mut params: Vec<&dyn ToSql> = predicates.iter().map(|(_, v)| v as &dyn ToSql).collect();
        let (offset, limit);
        if let Some((o, l)) = window {
            offset = o as i64;
            limit = l as i64;
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(&limit);
            params.push(&offset);
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = BTreeMap::new();
            for (i, col) in columns.iter().enumerate() {
                values.insert((*col).to_owned(), row.get::<_, Value>(i)?);
            }
            out.push(Record::new(values));
        }
        Ok(out)
    }

    /// Counts logged errors of one type in a namespace's error log.
    pub fn count_errors(&self, namespace: &str, error_type: GtfsErrorType) -> Result<u64, Error> {
        let conn = self.connect()?;
        if !namespace_registered(&conn, namespace)? {
            return Err(Error::UnknownNamespace(namespace.to_owned()));
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE error_type = ?",
            errors_table(namespace)
        );
        let count: i64 = conn.query_row(&sql, [error_type.as_str()], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Reads back every logged error for a namespace, in append order.
    pub fn errors(&self, namespace: &str) -> Result<Vec<FeedError>, Error> {
        let conn = self.connect()?;
        if !namespace_registered(&conn, namespace)? {
            return Err(Error::UnknownNamespace(namespace.to_owned()));
        }
        let sql = format!(
            "SELECT error_type, severity, table_name, line, field, entity_id, message
             FROM {} ORDER BY id",
            errors_table(namespace)
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let type_str: String = row.get(0)?;
            let severity_str: String = row.get(1)?;
            let error_type = GtfsErrorType::from_str(&type_str)
                .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?;
            let mut err = FeedError::new(error_type);
            err.severity = if severity_str == "fatal" {
                crate::feed_error::Severity::Fatal
            } else {
                crate::feed_error::Severity::Recoverable
            };
            err.table = row.get(2)?;
            err.line = row.get::<_, Option<i64>>(3)?.map(|l| l as u64);
            err.field = row.get(4)?;
            err.entity_id = row.get(5)?;
            err.message = row.get(6)?;
            out.push(err);
        }
        Ok(out)
    }
}

/// Physical name of a namespaced table.
pub(crate) fn physical_table(namespace: &str, table: &str) -> String {
    format!("{namespace}_{table}")
}

pub(crate) fn errors_table(namespace: &str) -> String {
    physical_table(namespace, "errors")
}

/// Allocates a fresh namespace id. Registration happens separately, once
/// the producing operation has completed.
pub(crate) fn generate_namespace() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("ns_{}", &id[..12])
}

pub(crate) fn namespace_registered(conn: &Connection, namespace: &str) -> Result<bool, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM feeds WHERE namespace = ?",
        [namespace],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Makes a completed namespace visible to readers.
pub(crate) fn register_namespace(
    conn: &Connection,
    namespace: &str,
    source: Option<&str>,
    sha256: Option<&str>,
    snapshot_of: Option<&str>,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO feeds (namespace, loaded_at, source, sha256, snapshot_of)
         VALUES (?, ?, ?, ?, ?)",
        rusqlite::params![namespace, Utc::now().to_rfc3339(), source, sha256, snapshot_of],
    )?;
    info!("registered namespace {namespace}");
    Ok(())
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Id => "TEXT",
        FieldType::Integer | FieldType::Date | FieldType::Time => "INTEGER",
        FieldType::Double => "REAL",
    }
}

/// Creates the physical table for one registry entry in a namespace.
pub(crate) fn create_feed_table(
    conn: &Connection,
    namespace: &str,
    def: &TableDef,
) -> Result<(), Error> {
    let columns: Vec<String> = def
        .fields
        .iter()
        .map(|f| format!("{} {}", f.name, sql_type(f.field_type)))
        .collect();
    let sql = format!(
        "CREATE TABLE {} ({})",
        physical_table(namespace, def.name),
        columns.join(", ")
    );
    conn.execute(&sql, [])?;
    Ok(())
}

/// Creates a namespace's append-only error log.
pub(crate) fn create_errors_table(conn: &Connection, namespace: &str) -> Result<(), Error> {
    let sql = format!(
        "CREATE TABLE {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            error_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            table_name TEXT,
            line INTEGER,
            field TEXT,
            entity_id TEXT,
            message TEXT
        )",
        errors_table(namespace)
    );
    conn.execute(&sql, [])?;
    Ok(())
}

/// Appends a batch of errors to a namespace's log.
pub(crate) fn append_errors(
    conn: &mut Connection,
    namespace: &str,
    errors: &[FeedError],
) -> Result<(), Error> {
    if errors.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "INSERT INTO {} (error_type, severity, table_name, line, field, entity_id, message)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        errors_table(namespace)
    );
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&sql)?;
        for err in errors {
            stmt.execute(rusqlite::params![
                err.error_type.as_str(),
                err.severity.as_str(),
                err.table,
                err.line.map(|l| l as i64),
                err.field,
                err.entity_id,
                err.message,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, physical_name: &str) -> Result<bool, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [physical_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn row_count(conn: &Connection, namespace: &str, table: &str) -> Result<u64, Error> {
    let sql = format!("SELECT COUNT(*) FROM {}", physical_table(namespace, table));
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Copies one table value-for-value into another namespace. The copy runs
/// entirely inside the storage engine, so memory stays bounded no matter
/// how large the table is, and the source is only ever read.
pub(crate) fn copy_table(
    conn: &Connection,
    source: &str,
    target: &str,
    def: &TableDef,
) -> Result<u64, Error> {
    create_feed_table(conn, target, def)?;
    let columns: Vec<&str> = def.fields.iter().map(|f| f.name).collect();
    let columns = columns.join(", ");
    let sql = format!(
        "INSERT INTO {target_table} ({columns}) SELECT {columns} FROM {source_table}",
        target_table = physical_table(target, def.name),
        source_table = physical_table(source, def.name),
    );
    let copied = conn.execute(&sql, [])?;
    Ok(copied as u64)
}

/// Streams every row of a table through `f` in storage order, one row in
/// memory at a time.
pub(crate) fn stream_rows(
    conn: &Connection,
    namespace: &str,
    def: &TableDef,
    mut f: impl FnMut(Record) -> Result<(), Error>,
) -> Result<(), Error> {
    let columns: Vec<&str> = def.fields.iter().map(|field| field.name).collect();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY rowid",
        columns.join(", "),
        physical_table(namespace, def.name)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = BTreeMap::new();
        for (i, col) in columns.iter().enumerate() {
            values.insert((*col).to_owned(), row.get::<_, Value>(i)?);
        }
        f(Record::new(values))?;
    }
    Ok(())
}

/// Drops every physical table belonging to a namespace. Used to discard a
/// partially-built snapshot so it is never exposed as queryable.
pub(crate) fn drop_namespace_tables(conn: &Connection, namespace: &str) -> Result<(), Error> {
    let mut names = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB ? || '_*'",
        )?;
        let rows = stmt.query_map([namespace], |row| row.get::<_, String>(0))?;
        for row in rows {
            names.push(row?);
        }
    }
    for name in names {
        conn.execute(&format!("DROP TABLE IF EXISTS {name}"), [])?;
    }
    Ok(())
}
