//! Typed validation-error records.
//!
//! Every recoverable issue found while loading or validating a namespace
//! becomes one [FeedError] appended to that namespace's error log. The log
//! is append-only and queried by error type, so callers can assert things
//! like "zero validator failures" after the fact.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Closed enumeration of everything that can be wrong with a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GtfsErrorType {
    /// A required field is absent or empty
    MissingField,
    /// A field value could not be parsed for its declared type
    BadValue,
    /// A populated foreign key does not resolve in its target table
    RefIntegrity,
    /// Two rows share the same declared identity
    DuplicateId,
    /// A service date range ends before it starts
    DateRange,
    /// A validator itself crashed; its checks did not run
    ValidatorFailed,
    /// A table file was found inside a subdirectory of the archive
    TableInSubdirectory,
    /// A required table is entirely absent from the archive
    TableMissing,
}

impl GtfsErrorType {
    /// Default severity of this error type.
    pub fn severity(self) -> Severity {
        match self {
            GtfsErrorType::TableMissing => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            GtfsErrorType::MissingField => "missing_field",
            GtfsErrorType::BadValue => "bad_value",
            GtfsErrorType::RefIntegrity => "ref_integrity",
            GtfsErrorType::DuplicateId => "duplicate_id",
            GtfsErrorType::DateRange => "date_range",
            GtfsErrorType::ValidatorFailed => "validator_failed",
            GtfsErrorType::TableInSubdirectory => "table_in_subdirectory",
            GtfsErrorType::TableMissing => "table_missing",
        }
    }
}

impl fmt::Display for GtfsErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GtfsErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_field" => Ok(GtfsErrorType::MissingField),
            "bad_value" => Ok(GtfsErrorType::BadValue),
            "ref_integrity" => Ok(GtfsErrorType::RefIntegrity),
            "duplicate_id" => Ok(GtfsErrorType::DuplicateId),
            "date_range" => Ok(GtfsErrorType::DateRange),
            "validator_failed" => Ok(GtfsErrorType::ValidatorFailed),
            "table_in_subdirectory" => Ok(GtfsErrorType::TableInSubdirectory),
            "table_missing" => Ok(GtfsErrorType::TableMissing),
            other => Err(format!("unknown error type '{other}'")),
        }
    }
}

/// Whether an error aborted the unit of work that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// The enclosing operation unit was aborted
    Fatal,
    /// The row or check was flagged and skipped; the operation continued
    Recoverable,
}

impl Severity {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Severity::Fatal => "fatal",
            Severity::Recoverable => "recoverable",
        }
    }
}

/// One recorded issue, scoped to a namespace by the log it lives in.
#[derive(Debug, Clone, Serialize)]
pub struct FeedError {
    /// What went wrong
    pub error_type: GtfsErrorType,
    /// Whether the finding aborted its unit of work
    pub severity: Severity,
    /// Table the issue was found in, when known
    pub table: Option<String>,
    /// 1-based data line in the source file, when known
    pub line: Option<u64>,
    /// Field the issue was found in, when known
    pub field: Option<String>,
    /// Identifier of the affected entity, when known
    pub entity_id: Option<String>,
    /// Free-form detail, e.g. the value that failed to parse
    pub message: Option<String>,
}

impl FeedError {
    /// A new error of the given type with its default severity.
    pub fn new(error_type: GtfsErrorType) -> Self {
        FeedError {
            error_type,
            severity: error_type.severity(),
            table: None,
            line: None,
            field: None,
            entity_id: None,
            message: None,
        }
    }

    /// Tags the error with the table it was found in.
    pub fn for_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_owned());
        self
    }

    /// Tags the error with the source line it was found at.
    pub fn at_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }

    /// Tags the error with the field it was found in.
    pub fn for_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_owned());
        self
    }

    /// Tags the error with the identifier of the affected entity.
    pub fn for_entity(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_owned());
        self
    }

    /// Attaches free-form detail.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
