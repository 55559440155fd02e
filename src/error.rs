//! Operation-level error management.
//!
//! These are the fatal failures: they abort the smallest enclosing unit of
//! work (one table's load, or a whole operation) and surface on the result
//! objects. Recoverable per-row issues never appear here; they go to the
//! namespace's error log as [crate::FeedError] records.

use thiserror::Error;

/// An error that aborts a load, validation, snapshot or export unit.
#[derive(Error, Debug)]
pub enum Error {
    /// A required table file is not present in the archive
    #[error("could not find table file {0}")]
    MissingTable(String),
    /// The given archive path is neither a file nor a directory
    #[error("could not read feed: {0} is neither a file nor a directory")]
    NotFileNorDirectory(String),
    /// The namespace is not registered in the store
    #[error("namespace {0} does not exist")]
    UnknownNamespace(String),
    /// The table is not part of the schema registry
    #[error("table {0} is not in the schema registry")]
    UnknownTable(String),
    /// The field is not part of the named table's definition
    #[error("table {table} has no field {field}")]
    UnknownField {
        /// Table whose definition was consulted
        table: String,
        /// The field that was asked for
        field: String,
    },
    /// Generic input/output failure
    #[error("impossible to read or write file")]
    Io(#[from] std::io::Error),
    /// Input/output failure on a specific table file
    #[error("impossible to read '{file_name}'")]
    NamedFileIo {
        /// The file that could not be read
        file_name: String,
        /// The underlying failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The CSV content of a table file could not be read
    #[error("impossible to read csv file '{file_name}'")]
    Csv {
        /// The file that could not be parsed
        file_name: String,
        /// The underlying csv library failure
        #[source]
        source: csv::Error,
    },
    /// The archive container could not be opened or written
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// The storage layer failed
    #[error("storage failure")]
    Sql(#[from] rusqlite::Error),
}
