/*! Namespaced storage for [General Transit Feed Specification](https://gtfs.org/) (GTFS) static feeds.

A GTFS feed is a collection of CSV files (often bundled as a zip file) that
cross-reference each other through unique identifiers. This crate ingests
such a feed into a durable SQLite store, validates it, clones it into
independent editable copies, and serializes any stored copy back into the
original archive format.

To get started, open a [FeedStore] and call [load]:

```no_run
let store = gtfs_store::FeedStore::open("feeds.db")?;
let loaded = gtfs_store::load("fixtures/fake-agency", &store);
let namespace = loaded.namespace.as_deref().expect("archive unreadable");
let validated = gtfs_store::validate(namespace, &store);
assert!(validated.fatal_error.is_none());
# Ok::<(), gtfs_store::Error>(())
```

## Design decisions

### Namespaces

Every import and every snapshot lives in its own namespace, an opaque
generated identifier. All foreign keys resolve only within their own
namespace, so readers can follow references arbitrarily deep without ever
crossing into another dataset. A namespace becomes visible to readers only
once the operation that produced it has completed.

### One schema registry

The table and field catalogue ([schema]) is built once and shared by the
loader, the validators and the exporter, so the three can never disagree on
a field's type or normalization. Each field's ingest transform has an exact
inverse used on export: a time stored as elapsed seconds comes back out as
`HH:MM:SS`, a date as `YYYYMMDD`, and an absent value as an empty cell,
never a literal `null`.

### Recoverable by default

A bad row never aborts its table and a crashing validator never aborts the
pipeline. Everything recoverable is appended to the namespace's error log,
queryable through [FeedStore::count_errors]; the result objects carry fatal
failures only.

*/
#![warn(missing_docs)]

pub mod error;
mod exporter;
mod feed_error;
mod loader;
pub mod schema;
mod snapshot;
mod storage;
mod validator;

#[cfg(test)]
mod tests;

use std::path::Path;

pub use error::Error;
pub use feed_error::{FeedError, GtfsErrorType, Severity};
pub use loader::{FeedLoadResult, TableLoadResult};
pub use snapshot::SnapshotResult;
pub use storage::{FeedStore, Record, Value};
pub use validator::ValidationResult;

/// Loads the feed archive at `path` (a zip file or a directory of `.txt`
/// files) into a fresh namespace of `store`.
///
/// Archive-level failures set the result's `fatal_error`; a missing or
/// malformed individual table only sets that table's own slot.
pub fn load(path: impl AsRef<Path>, store: &FeedStore) -> FeedLoadResult {
    loader::load(path.as_ref(), store)
}

/// Runs the validation pipeline against a loaded namespace.
///
/// Findings land in the namespace's error log; the result is fatal only
/// when the pipeline could not run at all.
pub fn validate(namespace: &str, store: &FeedStore) -> ValidationResult {
    validator::validate(namespace, store)
}

/// Clones `namespace` into a new, independently editable namespace,
/// including empty editor-only tables.
pub fn make_snapshot(namespace: &str, store: &FeedStore) -> SnapshotResult {
    snapshot::make_snapshot(namespace, store)
}

/// Serializes a namespace back into a GTFS zip archive at `destination`.
///
/// `from_editor` marks namespaces produced by [make_snapshot] and edited
/// since: it changes the starting ordinal of re-derived sequence numbers
/// and omits editor-derived tables that are empty.
pub fn export(
    namespace: &str,
    destination: impl AsRef<Path>,
    store: &FeedStore,
    from_editor: bool,
) -> Result<(), Error> {
    exporter::export(namespace, destination.as_ref(), store, from_editor)
}
