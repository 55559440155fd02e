//! The snapshot manager: clones a namespace into a new, independently
//! editable one.
//!
//! Every table of the source is copied value-for-value in dependency order,
//! plus a fixed set of editor-only tables created empty. The source is only
//! ever read and never locked. A failed copy of any single table is fatal
//! for the whole snapshot, and the partial namespace is discarded before
//! returning rather than registered.

use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Error;
use crate::loader::TableLoadResult;
use crate::schema;
use crate::storage::{self, FeedStore};

/// Outcome of one snapshot operation.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    /// The freshly created namespace; `None` when the snapshot failed
    pub namespace: Option<String>,
    /// The namespace that was copied
    pub source: String,
    /// Per-table outcomes, including the editor-only tables
    pub tables: BTreeMap<String, TableLoadResult>,
    /// Set when the snapshot could not be completed; no namespace was
    /// registered in that case
    pub fatal_error: Option<String>,
}

impl SnapshotResult {
    /// The outcome for one table.
    pub fn table(&self, name: &str) -> Option<&TableLoadResult> {
        self.tables.get(name)
    }

    /// True when the snapshot completed and every table copied cleanly.
    pub fn error_free(&self) -> bool {
        self.fatal_error.is_none() && self.tables.values().all(|t| t.fatal_error.is_none())
    }
}

/// Clones `source` into a new namespace of `store`.
pub fn make_snapshot(source: &str, store: &FeedStore) -> SnapshotResult {
    match snapshot_inner(source, store) {
        Ok(result) => result,
        Err(e) => {
            warn!("snapshot of {source} failed: {e}");
            SnapshotResult {
                namespace: None,
                source: source.to_owned(),
                tables: BTreeMap::new(),
                fatal_error: Some(e.to_string()),
            }
        }
    }
}

fn snapshot_inner(source: &str, store: &FeedStore) -> Result<SnapshotResult, Error> {
    let conn = store.connect()?;
    if !storage::namespace_registered(&conn, source)? {
        return Err(Error::UnknownNamespace(source.to_owned()));
    }

    let namespace = storage::generate_namespace();
    info!("snapshotting {source} into {namespace}");
    let mut tables = BTreeMap::new();
    let copied = (|| -> Result<(), Error> {
        storage::create_errors_table(&conn, &namespace)?;
        for def in schema::tables() {
            let result = if def.editor_only {
                storage::create_feed_table(&conn, &namespace, def)?;
                TableLoadResult {
                    row_count: 0,
                    fatal_error: None,
                }
            } else if storage::table_exists(&conn, &storage::physical_table(source, def.name))? {
                let count = storage::copy_table(&conn, source, &namespace, def)?;
                info!("copied {count} rows of {} into {namespace}", def.name);
                TableLoadResult {
                    row_count: count,
                    fatal_error: None,
                }
            } else {
                // Source predates this table; the copy still gets it, empty.
                storage::create_feed_table(&conn, &namespace, def)?;
                TableLoadResult {
                    row_count: 0,
                    fatal_error: None,
                }
            };
            tables.insert(def.name.to_owned(), result);
        }
        Ok(())
    })();

    if let Err(e) = copied {
        // Never expose a partially-copied namespace.
        warn!("discarding partial snapshot {namespace}: {e}");
        storage::drop_namespace_tables(&conn, &namespace)?;
        return Err(e);
    }

    storage::register_namespace(&conn, &namespace, None, None, Some(source))?;
    Ok(SnapshotResult {
        namespace: Some(namespace),
        source: source.to_owned(),
        tables,
        fatal_error: None,
    })
}
