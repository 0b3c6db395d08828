//! Change tree of a filesystem subtree.
//!
//! The tree records, for every path the sync tool reports on, the planned action and the size
//! involved, and aggregates the number of bytes that will actually be transferred.

mod large_entries;
mod ncdu;
mod tree;

pub use tree::{
    Action, ChangeTree, DESTINATION_KEY, Entry, EntryKind, LINK_SUFFIX, Metadata, SOURCE_KEY,
    TreeError,
};
