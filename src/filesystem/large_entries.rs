use std::cmp::Reverse;

use crate::filesystem::{ChangeTree, Entry};

impl ChangeTree {
    /// Smallest set of entries whose transfer size exceeds `threshold`, largest first.
    ///
    /// A directory is only reported when none of its descendants exceeds the threshold on its own,
    /// so no reported entry is an ancestor of another.
    pub fn large_entries(&self, threshold: u64) -> Vec<&Entry> {
        let mut found = Vec::new();
        collect_large_entries(self.root(), threshold, &mut found);
        found.sort_by_key(|entry| Reverse(entry.transfer_size()));
        found
    }
}

fn collect_large_entries<'a>(entry: &'a Entry, threshold: u64, found: &mut Vec<&'a Entry>) {
    if entry.transfer_size() <= threshold {
        return;
    }
    match entry.children() {
        Some(children) => {
            let before = found.len();
            for (_, child) in children.iter() {
                collect_large_entries(child, threshold, found);
            }
            if found.len() == before {
                found.push(entry);
            }
        }
        None => found.push(entry),
    }
}
