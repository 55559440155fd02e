//! Whole-namespace validation, run after a feed is loaded.
//!
//! Each validator runs in isolation: a crash inside one is caught at the
//! pipeline level, logged as a single `validator_failed` error tagged with
//! that validator's identity, and never stops the remaining validators.
//! Findings are appended to the namespace's error log; encountering them is
//! steady-state behavior, so the result is fatal only when the pipeline
//! could not run at all.

use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::Error;
use crate::feed_error::{FeedError, GtfsErrorType};
use crate::schema;
use crate::storage::{self, FeedStore};

/// Outcome of one validation run. Findings live in the namespace's error
/// log, not here.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    /// The namespace that was validated
    pub namespace: String,
    /// Set when the pipeline could not execute at all
    pub fatal_error: Option<String>,
}

type ValidatorFn = fn(&Connection, &str, &mut Vec<FeedError>) -> Result<(), Error>;

/// One independent whole-namespace check.
pub(crate) struct Validator {
    pub name: &'static str,
    /// Tables this validator reads; the first tags its failure errors
    pub tables: &'static [&'static str],
    pub run: ValidatorFn,
}

pub(crate) const VALIDATORS: &[Validator] = &[
    Validator {
        name: "referential_integrity",
        tables: &[
            "routes",
            "fare_rules",
            "stops",
            "trips",
            "frequencies",
            "stop_times",
            "transfers",
        ],
        run: referential_integrity,
    },
    Validator {
        name: "duplicate_ids",
        tables: &["agency", "calendar", "routes", "stops", "trips", "stop_times"],
        run: duplicate_ids,
    },
    Validator {
        name: "calendar_dates",
        tables: &["calendar"],
        run: calendar_date_ranges,
    },
];

/// Runs every validator against `namespace`.
pub fn validate(namespace: &str, store: &FeedStore) -> ValidationResult {
    match run_pipeline(namespace, store, VALIDATORS) {
        Ok(()) => ValidationResult {
            namespace: namespace.to_owned(),
            fatal_error: None,
        },
        Err(e) => {
            warn!("validation of {namespace} could not run: {e}");
            ValidationResult {
                namespace: namespace.to_owned(),
                fatal_error: Some(e.to_string()),
            }
        }
    }
}

pub(crate) fn run_pipeline(
    namespace: &str,
    store: &FeedStore,
    validators: &[Validator],
) -> Result<(), Error> {
    let mut conn = store.connect()?;
    if !storage::namespace_registered(&conn, namespace)? {
        return Err(Error::UnknownNamespace(namespace.to_owned()));
    }

    let mut errors = Vec::new();
    for validator in validators {
        info!("running validator {} on {namespace}", validator.name);
        let before = errors.len();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (validator.run)(&conn, namespace, &mut errors)
        }));
        match outcome {
            Ok(Ok(())) => {
                info!(
                    "validator {} found {} issue(s)",
                    validator.name,
                    errors.len() - before
                );
            }
            Ok(Err(e)) => {
                warn!("validator {} failed: {e}", validator.name);
                errors.push(validator_failed(validator, e.to_string()));
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!("validator {} panicked: {message}", validator.name);
                errors.push(validator_failed(validator, message));
            }
        }
    }
    storage::append_errors(&mut conn, namespace, &errors)?;
    Ok(())
}

fn validator_failed(validator: &Validator, message: String) -> FeedError {
    let mut err = FeedError::new(GtfsErrorType::ValidatorFailed)
        .for_entity(validator.name)
        .with_message(message);
    if let Some(table) = validator.tables.first() {
        err = err.for_table(table);
    }
    err
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "validator panicked".to_owned()
    }
}

/// Every populated foreign-key field must resolve to an existing row of its
/// target table; each violation is recorded with the offending row's id.
pub(crate) fn referential_integrity(
    conn: &Connection,
    namespace: &str,
    errors: &mut Vec<FeedError>,
) -> Result<(), Error> {
    for def in schema::tables().filter(|t| !t.editor_only) {
        let child = storage::physical_table(namespace, def.name);
        if !storage::table_exists(conn, &child)? {
            continue;
        }
        for field in def.fields.iter() {
            let Some((target_table, target_field)) = field.references else {
                continue;
            };
            let parent = storage::physical_table(namespace, target_table);
            if !storage::table_exists(conn, &parent)? {
                continue;
            }
            let entity_column = def.key_fields.first().copied().unwrap_or(field.name);
            let sql = format!(
                "SELECT child.{fk}, child.{entity} FROM {child} child
                 LEFT JOIN {parent} parent ON child.{fk} = parent.{target_field}
                 WHERE child.{fk} IS NOT NULL AND parent.{target_field} IS NULL",
                fk = field.name,
                entity = entity_column,
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let missing: String = row.get(0)?;
                let entity: Option<String> = row.get(1)?;
                let mut err = FeedError::new(GtfsErrorType::RefIntegrity)
                    .for_table(def.name)
                    .for_field(field.name)
                    .with_message(format!(
                        "references missing {target_table}.{target_field} '{missing}'"
                    ));
                if let Some(entity) = entity {
                    err = err.for_entity(&entity);
                }
                errors.push(err);
            }
        }
    }
    Ok(())
}

/// No two rows of a table may share its declared identity.
pub(crate) fn duplicate_ids(
    conn: &Connection,
    namespace: &str,
    errors: &mut Vec<FeedError>,
) -> Result<(), Error> {
    for def in schema::tables().filter(|t| !t.editor_only && !t.key_fields.is_empty()) {
        let physical = storage::physical_table(namespace, def.name);
        if !storage::table_exists(conn, &physical)? {
            continue;
        }
        let first_key = def.key_fields[0];
        let keys = def.key_fields.join(", ");
        let sql = format!(
            "SELECT {first_key}, COUNT(*) FROM {physical}
             WHERE {first_key} IS NOT NULL
             GROUP BY {keys} HAVING COUNT(*) > 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: crate::storage::Value = row.get(0)?;
            let count: i64 = row.get(1)?;
            let mut err = FeedError::new(GtfsErrorType::DuplicateId)
                .for_table(def.name)
                .for_field(first_key)
                .with_message(format!("{count} rows share the same key"));
            if let Some(id) = id.as_text() {
                err = err.for_entity(id);
            }
            errors.push(err);
        }
    }
    Ok(())
}

/// A service period must not end before it starts. Unparseable dates were
/// already downgraded to absent values (and logged) at load time, so only
/// present values are checked here.
pub(crate) fn calendar_date_ranges(
    conn: &Connection,
    namespace: &str,
    errors: &mut Vec<FeedError>,
) -> Result<(), Error> {
    let physical = storage::physical_table(namespace, "calendar");
    if !storage::table_exists(conn, &physical)? {
        return Ok(());
    }
    let sql = format!(
        "SELECT service_id, start_date, end_date FROM {physical}
         WHERE start_date IS NOT NULL AND end_date IS NOT NULL
           AND end_date < start_date"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let service_id: Option<String> = row.get(0)?;
        let start: i64 = row.get(1)?;
        let end: i64 = row.get(2)?;
        let mut err = FeedError::new(GtfsErrorType::DateRange)
            .for_table("calendar")
            .for_field("end_date")
            .with_message(format!("service ends {end} before it starts {start}"));
        if let Some(id) = service_id {
            err = err.for_entity(&id);
        }
        errors.push(err);
    }
    Ok(())
}
