//! Export of a change tree in the ncdu JSON dump format, so that the pending changes can be
//! browsed with `ncdu -f <file>`.

use serde_json::{Value, json};

use crate::filesystem::{Action, ChangeTree, Entry, EntryKind};

const NCDU_MAJOR_VERSION: u64 = 1;
const NCDU_MINOR_VERSION: u64 = 2;

impl ChangeTree {
    /// Builds the ncdu dump. `root_name` labels the top-level directory.
    pub fn export(&self, root_name: &str, timestamp: i64) -> Value {
        json!([
            NCDU_MAJOR_VERSION,
            NCDU_MINOR_VERSION,
            {
                "progname": env!("CARGO_PKG_NAME"),
                "progver": env!("CARGO_PKG_VERSION"),
                "timestamp": timestamp
            },
            export_entry(self.root(), root_name)
        ])
    }
}

fn export_entry(entry: &Entry, name: &str) -> Value {
    match entry.kind() {
        EntryKind::Directory(children) => {
            let mut node = vec![json!({ "name": name })];
            node.extend(
                children
                    .iter()
                    .map(|(child_name, child)| export_entry(child, child_name)),
            );
            Value::Array(node)
        }
        EntryKind::Link => json!({ "name": name, "notreg": true }),
        EntryKind::File if entry.action() == Some(&Action::Excluded) => {
            json!({ "name": name, "excluded": "pattern" })
        }
        EntryKind::File => json!({ "name": name, "asize": entry.size() }),
    }
}
