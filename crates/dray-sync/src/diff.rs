//! Minimal transfer sets between two snapshots.
//!
//! Change detection relies on checksums alone. Modification times are
//! ignored, and so are backend ETags, which under multipart or block
//! uploads are not a hash of the whole file.

use crate::keyset::{KeyEntry, KeySet};

/// Entries selected for transfer, plus how many were left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSet {
    pub entries: Vec<KeyEntry>,
    pub skipped: usize,
}

impl TransferSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sum of entry sizes.
    pub fn bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Split into (entries matching `pred`, the rest), keeping order.
    pub fn partition(self, pred: impl Fn(&KeyEntry) -> bool) -> (Vec<KeyEntry>, Vec<KeyEntry>) {
        self.entries.into_iter().partition(|e| pred(e))
    }
}

/// Local entries the remote lacks or holds with a different checksum.
///
/// A remote entry counts as current only when its content exists and its
/// sidecar checksum equals the local one. A missing sidecar forces an upload
/// so the sidecar gets written.
pub fn push_diff(local: &KeySet, remote: &KeySet) -> TransferSet {
    let mut set = TransferSet::default();
    for entry in local.iter() {
        let current = remote.get(&entry.key).is_some_and(|r| {
            r.has_content() && r.content_sum.is_some() && r.content_sum == entry.content_sum
        });
        if current {
            set.skipped += 1;
        } else {
            set.entries.push(entry.clone());
        }
    }
    set
}

/// Remote content objects that are missing locally or stale.
///
/// A local file is kept when the remote sidecar matches its checksum, or
/// when the remote has no sidecar to compare against. A sidecar that
/// disagrees with the local checksum triggers a fresh download, so a
/// corrupted local copy heals on the next pull.
pub fn pull_diff(remote: &KeySet, local: &KeySet) -> TransferSet {
    let mut set = TransferSet::default();
    for entry in remote.iter().filter(|e| e.remote_location.is_some()) {
        let keep = local.get(&entry.key).is_some_and(|l| match entry.content_sum {
            Some(sum) => l.content_sum == Some(sum),
            None => true,
        });
        if keep {
            set.skipped += 1;
        } else {
            set.entries.push(entry.clone());
        }
    }
    set
}
