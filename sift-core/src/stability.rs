// Stability classification: which stored tests are still valid.
//
// Every stored fingerprint row passes through three tiers, cheapest first:
// the cached mtime, the cached content hash, then a parse of the current file
// checked against the stored block checksums. Rows that miss all three are
// changed, and every node depending on a changed row is unstable.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::source_tree::SourceTree;
use crate::store::FingerprintStore;
use crate::types::{FileFingerprintRow, FingerprintId, MtimeUpdate, StabilityReport, home_file};

/// Split `items` into those satisfying `pred` and the rest, preserving order.
pub fn partition<T>(items: Vec<T>, mut pred: impl FnMut(&T) -> bool) -> (Vec<T>, Vec<T>) {
    let mut hits = Vec::new();
    let mut misses = Vec::new();
    for item in items {
        if pred(&item) {
            hits.push(item);
        } else {
            misses.push(item);
        }
    }
    (hits, misses)
}

/// Unreadable files are treated like missing ones: the tier misses.
fn or_miss<T>(file_name: &str, result: Result<Option<T>, SourceError>) -> Option<T> {
    result.unwrap_or_else(|e| {
        warn!(file = file_name, error = %e, "Cannot inspect file, treating as changed");
        None
    })
}

/// Tier 1: the file's mtime is the one cached on the row.
#[allow(clippy::float_cmp)]
fn mtime_unchanged(tree: &mut SourceTree, row: &FileFingerprintRow) -> bool {
    let Some(stored) = row.mtime else {
        return false;
    };
    or_miss(&row.file_name, tree.mtime(&row.file_name)).is_some_and(|current| current == stored)
}

/// Tier 2: the file's content hash is the one cached on the row.
fn checksum_unchanged(tree: &mut SourceTree, row: &FileFingerprintRow) -> bool {
    let Some(stored) = row.checksum.as_deref() else {
        return false;
    };
    or_miss(&row.file_name, tree.checksum(&row.file_name)).is_some_and(|current| current == stored)
}

/// Tier 3: every block the row depends on still exists in the current file.
fn fingerprint_matches(tree: &mut SourceTree, row: &FileFingerprintRow) -> bool {
    or_miss(&row.file_name, tree.module(&row.file_name))
        .is_some_and(|module| module.matches(&row.fingerprint))
}

/// Classify every node and file the store knows about for its environment.
///
/// Rows that survive tier 2 or tier 3 get their cached mtime and hash
/// refreshed so the next run settles them in tier 1.
pub fn classify(
    store: &dyn FingerprintStore,
    tree: &mut SourceTree,
) -> crate::error::Result<StabilityReport> {
    let rows = store.filenames_fingerprints()?;
    let total = rows.len();
    let all_files: HashSet<String> = rows.iter().map(|r| r.file_name.clone()).collect();
    let failing_files: HashSet<String> = rows
        .iter()
        .filter(|r| r.failed_count > 0)
        .map(|r| r.file_name.clone())
        .collect();

    let (by_mtime, rest) = partition(rows, |r| mtime_unchanged(tree, r));
    let (by_checksum, rest) = partition(rest, |r| checksum_unchanged(tree, r));
    let (by_fingerprint, changed) = partition(rest, |r| fingerprint_matches(tree, r));

    debug!(
        total,
        mtime = by_mtime.len(),
        checksum = by_checksum.len(),
        fingerprint = by_fingerprint.len(),
        changed = changed.len(),
        "Classified fingerprints"
    );

    let mut updates = Vec::with_capacity(by_checksum.len() + by_fingerprint.len());
    for row in by_checksum.iter().chain(&by_fingerprint) {
        let mtime = or_miss(&row.file_name, tree.mtime(&row.file_name));
        let checksum = or_miss(&row.file_name, tree.checksum(&row.file_name));
        if let (Some(mtime), Some(checksum)) = (mtime, checksum) {
            updates.push(MtimeUpdate {
                id: row.id,
                mtime,
                checksum,
            });
        }
    }
    store.update_mtimes(&updates)?;

    let changed_ids: Vec<FingerprintId> = changed.iter().map(|r| r.id).collect();
    let changed_data = store.get_changed_file_data(&changed_ids)?;

    let mut unstable_nodes: HashSet<String> = HashSet::new();
    let mut unstable_files: HashSet<String> = failing_files;
    for data in changed_data {
        unstable_files.insert(data.file_name);
        unstable_nodes.insert(data.node_name);
    }

    let mut stable_nodes = HashSet::new();
    for node in store.all_nodes()? {
        if node.failed || unstable_nodes.contains(&node.name) {
            unstable_nodes.insert(node.name);
        } else {
            stable_nodes.insert(node.name);
        }
    }
    for node in &unstable_nodes {
        unstable_files.insert(home_file(node).to_string());
    }
    let stable_files = all_files
        .into_iter()
        .filter(|f| !unstable_files.contains(f))
        .collect();

    info!(
        stable = stable_nodes.len(),
        unstable = unstable_nodes.len(),
        changed_fingerprints = changed_ids.len(),
        refreshed = updates.len(),
        "Stability determined"
    );

    Ok(StabilityReport {
        stable_nodes,
        unstable_nodes,
        stable_files,
        unstable_files,
        changed_fingerprints: changed_ids.into_iter().collect(),
        refreshed: updates.len(),
    })
}

/// Mark every stored node and file unstable without consulting the tree.
///
/// Used when something outside the source tree, such as the installed
/// packages, changed since the data was recorded.
pub fn all_unstable(store: &dyn FingerprintStore) -> crate::error::Result<StabilityReport> {
    let unstable_nodes: HashSet<String> = store.all_nodes()?.into_iter().map(|n| n.name).collect();
    let mut unstable_files: HashSet<String> = store
        .filenames_fingerprints()?
        .into_iter()
        .map(|r| r.file_name)
        .collect();
    for node in &unstable_nodes {
        unstable_files.insert(home_file(node).to_string());
    }
    info!(unstable = unstable_nodes.len(), "Every test unstable");
    Ok(StabilityReport {
        unstable_nodes,
        unstable_files,
        ..Default::default()
    })
}
