use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};

use derive_more::Display;
use hashlink::LinkedHashMap;
use snafu::{OptionExt, Snafu};

/// Suffix rclone appends to objects that stand in for symbolic links (`--links`).
pub const LINK_SUFFIX: &str = ".rclonelink";

/// Metadata key holding the old path of a renamed entry.
pub const SOURCE_KEY: &str = "source";
/// Metadata key holding the new path of a renamed entry.
pub const DESTINATION_KEY: &str = "destination";

pub type Metadata = HashMap<String, String>;

/// What the sync tool plans to do with an entry.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Action {
    #[display("copy")]
    Copy,
    #[display("delete")]
    Delete,
    #[display("move-source")]
    MoveSource,
    #[display("move-dest")]
    MoveDest,
    #[display("excluded")]
    Excluded,
    #[display("make directory")]
    MakeDirectory,
    #[display("set directory modification time")]
    SetDirectoryModTime,
    #[display("remove directory")]
    RemoveDirectory,
    #[display("{_0}")]
    Other(String),
}

impl Action {
    /// Maps the `skipped` field of an rclone dry-run record to an action.
    pub fn from_skipped(skipped: &str) -> Self {
        match skipped {
            "copy" => Action::Copy,
            "delete" => Action::Delete,
            "move" => Action::MoveSource,
            "excluded" => Action::Excluded,
            "make directory" => Action::MakeDirectory,
            "set directory modification time" => Action::SetDirectoryModTime,
            "remove directory" => Action::RemoveDirectory,
            other => Action::Other(other.to_string()),
        }
    }

    /// Directory-level actions can be reported more than once for the same path.
    pub fn is_directory_level(&self) -> bool {
        matches!(
            self,
            Action::MakeDirectory | Action::SetDirectoryModTime | Action::RemoveDirectory
        )
    }
}

/// Kind of a node in the change tree.
#[derive(Debug, Clone)]
pub enum EntryKind {
    File,
    Link,
    Directory(Children),
}

#[derive(Debug, Clone, Default)]
pub struct Children {
    entries: LinkedHashMap<String, Entry>,
    transfer_size: OnceCell<u64>,
}

impl Children {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }
}

/// A single node of the change tree.
#[derive(Debug, Clone)]
pub struct Entry {
    path: String,
    size: u64,
    action: Option<Action>,
    metadata: Metadata,
    kind: EntryKind,
}

impl Entry {
    fn directory(path: String) -> Self {
        Entry {
            path,
            size: 0,
            action: None,
            metadata: Metadata::new(),
            kind: EntryKind::Directory(Children::default()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw size as reported by the tool. Directories carry no size of their own.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    #[cfg(test)]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory(_))
    }

    pub fn children(&self) -> Option<&Children> {
        match &self.kind {
            EntryKind::Directory(children) => Some(children),
            EntryKind::File | EntryKind::Link => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Children> {
        match &mut self.kind {
            EntryKind::Directory(children) => Some(children),
            EntryKind::File | EntryKind::Link => None,
        }
    }

    /// Bytes that will actually be moved for this entry and everything below it.
    pub fn transfer_size(&self) -> u64 {
        match &self.kind {
            EntryKind::File | EntryKind::Link => match self.action {
                Some(Action::Copy) => self.size,
                _ => 0,
            },
            EntryKind::Directory(children) => *children.transfer_size.get_or_init(|| {
                children.entries.values().map(Entry::transfer_size).sum()
            }),
        }
    }

    /// Names under which the sync tool knows this entry.
    pub fn tool_paths(&self) -> Vec<String> {
        match self.kind {
            EntryKind::Link => vec![format!("{}{}", self.path, LINK_SUFFIX), self.path.clone()],
            EntryKind::File | EntryKind::Directory(_) => vec![self.path.clone()],
        }
    }
}

/// Hierarchical model of the changes the sync tool plans (or performed) for a subtree.
#[derive(Debug, Clone)]
pub struct ChangeTree {
    root: Entry,
}

impl Default for ChangeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeTree {
    pub fn new() -> Self {
        ChangeTree {
            root: Entry::directory(String::new()),
        }
    }

    pub fn root(&self) -> &Entry {
        &self.root
    }

    /// Inserts an entry, creating placeholder directories for missing ancestors.
    ///
    /// A trailing [`LINK_SUFFIX`] marks the entry as a link stored under its logical path.
    pub fn insert(
        &mut self,
        path: &str,
        size: u64,
        action: Action,
        metadata: Metadata,
    ) -> Result<(), TreeError> {
        let (logical, is_link) = match path.strip_suffix(LINK_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (path, false),
        };
        let components = split_path(logical);

        let mut dir = &mut self.root;
        if let Some((_, parents)) = components.split_last() {
            for (depth, part) in parents.iter().enumerate() {
                let EntryKind::Directory(children) = &mut dir.kind else {
                    return NotADirectorySnafu { path: dir.path.as_str() }.fail();
                };
                children.transfer_size.take();
                dir = children
                    .entries
                    .entry(part.to_string())
                    .or_insert_with(|| Entry::directory(components[..=depth].join("/")));
            }
        }
        let Some(name) = components.last() else {
            return assign_directory_action(dir, action, metadata);
        };
        let EntryKind::Directory(children) = &mut dir.kind else {
            return NotADirectorySnafu { path: dir.path.as_str() }.fail();
        };
        children.transfer_size.take();

        match children.entries.get_mut(*name) {
            None => {
                let kind = if action.is_directory_level() {
                    EntryKind::Directory(Children::default())
                } else if is_link {
                    EntryKind::Link
                } else {
                    EntryKind::File
                };
                let size = if matches!(kind, EntryKind::Directory(_)) { 0 } else { size };
                children.entries.insert(
                    name.to_string(),
                    Entry {
                        path: logical.to_string(),
                        size,
                        action: Some(action),
                        metadata,
                        kind,
                    },
                );
                Ok(())
            }
            Some(existing) if existing.is_directory() => {
                assign_directory_action(existing, action, metadata)
            }
            Some(_) => DuplicateInsertionSnafu { path: logical }.fail(),
        }
    }

    pub fn lookup(&self, path: &str) -> Result<&Entry, TreeError> {
        let mut current = &self.root;
        for part in split_path(path) {
            current = current
                .children()
                .and_then(|children| children.entries.get(part))
                .context(NotFoundSnafu { path })?;
        }
        Ok(current)
    }

    /// Sets a metadata field on an existing entry.
    pub fn annotate(
        &mut self,
        path: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), TreeError> {
        let mut current = &mut self.root;
        for part in split_path(path) {
            current = current
                .children_mut()
                .and_then(|children| children.entries.get_mut(part))
                .context(NotFoundSnafu { path })?;
        }
        current.metadata.insert(key.into(), value.into());
        Ok(())
    }

    pub fn transfer_size(&self) -> u64 {
        self.root.transfer_size()
    }

    /// Depth-first iteration over the entries with a pending action, skipping excluded subtrees.
    pub fn files_to_sync<'t, 'e>(&'t self, excluded: &'e HashSet<String>) -> FilesToSync<'t, 'e> {
        FilesToSync {
            stack: vec![&self.root],
            excluded,
        }
    }
}

pub struct FilesToSync<'t, 'e> {
    stack: Vec<&'t Entry>,
    excluded: &'e HashSet<String>,
}

impl<'t> Iterator for FilesToSync<'t, '_> {
    type Item = &'t Entry;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.stack.pop() {
            if self.excluded.contains(&entry.path) {
                continue;
            }
            if let Some(children) = entry.children() {
                let start = self.stack.len();
                self.stack.extend(children.entries.values());
                self.stack[start..].reverse();
            }
            if entry.action.is_some() {
                return Some(entry);
            }
        }
        None
    }
}

/// Directories accept an action only while they are placeholders or hold a re-observable action.
fn assign_directory_action(
    directory: &mut Entry,
    action: Action,
    metadata: Metadata,
) -> Result<(), TreeError> {
    let reassignable = directory
        .action
        .as_ref()
        .is_none_or(Action::is_directory_level);
    if !reassignable {
        return DuplicateInsertionSnafu {
            path: directory.path.as_str(),
        }
        .fail();
    }
    directory.action = Some(action);
    directory.metadata.extend(metadata);
    Ok(())
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

#[derive(Debug, Snafu)]
pub enum TreeError {
    #[snafu(display("An entry with an assigned action already exists at '{path}'"))]
    DuplicateInsertion { path: String },
    #[snafu(display("Cannot insert below '{path}', it is not a directory"))]
    NotADirectory { path: String },
    #[snafu(display("No entry at '{path}'"))]
    NotFound { path: String },
}

impl TreeError {
    /// Protocol violations that indicate a bug rather than bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TreeError::DuplicateInsertion { .. } | TreeError::NotADirectory { .. }
        )
    }
}
