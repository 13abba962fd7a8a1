//! In-memory group/entry store
//!
//! Groups and entries live in id-keyed maps. Each group keeps ordered
//! child-group and entry id lists, so traversal and cascading deletes walk
//! ids, never references.

use crate::crypto::Algorithm;
use crate::error::{Error, Result};
use crate::tree::model::{Entry, EntryFields, EntryId, Group, GroupId, ItemId};
use crate::tree::search::{Search, SearchScope};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default key transformation rounds for new databases
pub const DEFAULT_ROUNDS: u32 = 50_000;

/// Ordering used when listing siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Order as stored in the database
    #[default]
    Database,
    /// Case-insensitive by group name / entry title
    Alphabetical,
}

/// What a delete removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removed {
    pub groups: usize,
    pub entries: usize,
}

/// Root aggregate: settings plus the group/entry tree
#[derive(Debug, Clone)]
pub struct Database {
    algorithm: Algorithm,
    rounds: u32,
    path: Option<PathBuf>,
    groups: HashMap<GroupId, Group>,
    entries: HashMap<EntryId, Entry>,
    /// Children of the implicit root
    root: Vec<GroupId>,
    meta_streams: Vec<Entry>,
    next_group_id: u32,
    retired_entries: HashSet<EntryId>,
}

impl Database {
    /// Create an empty database
    pub fn new(algorithm: Algorithm, rounds: u32) -> Self {
        Database {
            algorithm,
            rounds,
            path: None,
            groups: HashMap::new(),
            entries: HashMap::new(),
            root: Vec::new(),
            meta_streams: Vec::new(),
            next_group_id: 1,
            retired_entries: HashSet::new(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.algorithm = algorithm;
    }

    /// Key transformation rounds
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn set_rounds(&mut self, rounds: u32) -> Result<()> {
        if rounds == 0 {
            return Err(Error::ValidationError(
                "Key transformation rounds must be greater than 0".to_string(),
            ));
        }
        self.rounds = rounds;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path<P: AsRef<Path>>(&mut self, path: P) {
        self.path = Some(path.as_ref().to_path_buf());
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Get a group, returning an error if not found
    pub fn group_required(&self, id: GroupId) -> Result<&Group> {
        self.groups.get(&id).ok_or(Error::GroupNotFound(id.0))
    }

    /// Get an entry, returning an error if not found
    pub fn entry_required(&self, id: EntryId) -> Result<&Entry> {
        self.entries.get(&id).ok_or(Error::EntryNotFound(id.0))
    }

    /// Top-level groups
    pub fn root_groups(&self) -> &[GroupId] {
        &self.root
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of regular entries (meta streams excluded)
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.entries.is_empty()
    }

    /// Opaque desktop-client entries carried through load and save
    pub fn meta_streams(&self) -> &[Entry] {
        &self.meta_streams
    }

    fn siblings(&self, parent: Option<GroupId>) -> Result<&Vec<GroupId>> {
        match parent {
            None => Ok(&self.root),
            Some(id) => Ok(&self.group_required(id)?.groups),
        }
    }

    fn siblings_mut(&mut self, parent: Option<GroupId>) -> Option<&mut Vec<GroupId>> {
        match parent {
            None => Some(&mut self.root),
            Some(id) => self.groups.get_mut(&id).map(|g| &mut g.groups),
        }
    }

    fn alloc_group_id(&mut self) -> Result<GroupId> {
        if self.next_group_id == u32::MAX {
            return Err(Error::ValidationError("Group ids exhausted".to_string()));
        }
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        Ok(id)
    }

    fn alloc_entry_id(&self) -> EntryId {
        loop {
            let id = EntryId::random();
            if !self.entries.contains_key(&id) && !self.retired_entries.contains(&id) {
                return id;
            }
        }
    }

    /// Add a group under `parent` (`None` for top level)
    pub fn add_group(&mut self, parent: Option<GroupId>, name: &str) -> Result<GroupId> {
        if let Some(parent_id) = parent {
            if !self.groups.contains_key(&parent_id) {
                return Err(Error::ParentNotFound(parent_id.0));
            }
        }
        if name.trim().is_empty() {
            return Err(Error::ValidationError("Group name must not be empty".to_string()));
        }

        let id = self.alloc_group_id()?;
        let mut group = Group::new(id, parent, name.to_string());
        if let Some(parent_group) = parent.and_then(|p| self.groups.get(&p)) {
            group.icon = parent_group.icon;
        }
        self.groups.insert(id, group);
        if let Some(siblings) = self.siblings_mut(parent) {
            siblings.push(id);
        }

        debug!("Added group {} under {:?}", id, parent);
        Ok(id)
    }

    /// Rename a group
    pub fn rename_group(&mut self, id: GroupId, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::ValidationError("Group name must not be empty".to_string()));
        }
        let group = self.groups.get_mut(&id).ok_or(Error::GroupNotFound(id.0))?;
        group.name = name.to_string();
        group.times.touch();
        Ok(())
    }

    /// Add an entry to a group; the title is mandatory
    pub fn add_entry(&mut self, group: GroupId, fields: &EntryFields) -> Result<EntryId> {
        if !self.groups.contains_key(&group) {
            return Err(Error::ParentNotFound(group.0));
        }
        validate_fields(fields)?;

        let id = self.alloc_entry_id();
        let mut entry = Entry::new(id, group)?;
        entry.apply(fields)?;

        self.entries.insert(id, entry);
        if let Some(parent) = self.groups.get_mut(&group) {
            parent.entries.push(id);
        }

        debug!("Added entry {} to group {}", id, group);
        Ok(id)
    }

    /// Replace the editable fields of an entry
    pub fn update_entry(&mut self, id: EntryId, fields: &EntryFields) -> Result<()> {
        validate_fields(fields)?;
        let entry = self.entries.get_mut(&id).ok_or(Error::EntryNotFound(id.0))?;

        // Build the new state first so a failure leaves the entry untouched
        let mut updated = entry.clone();
        updated.apply(fields)?;
        updated.times.touch();
        *entry = updated;
        Ok(())
    }

    pub fn set_group_icon(&mut self, id: GroupId, icon: u32) -> Result<()> {
        let group = self.groups.get_mut(&id).ok_or(Error::GroupNotFound(id.0))?;
        group.icon = icon;
        group.times.touch();
        Ok(())
    }

    /// Copy an entry into `group` under a fresh id
    ///
    /// Timestamps and attachment travel with the copy.
    pub fn duplicate_entry(&mut self, id: EntryId, group: GroupId) -> Result<EntryId> {
        if !self.groups.contains_key(&group) {
            return Err(Error::ParentNotFound(group.0));
        }
        let mut copy = self.entry_required(id)?.clone();
        let new_id = self.alloc_entry_id();
        copy.id = new_id;
        copy.group = group;

        self.entries.insert(new_id, copy);
        if let Some(parent) = self.groups.get_mut(&group) {
            parent.entries.push(new_id);
        }
        debug!("Copied entry {} to {} in group {}", id, new_id, group);
        Ok(new_id)
    }

    /// Move an entry into another group
    ///
    /// Returns `false` when the entry already lives there.
    pub fn move_entry(&mut self, id: EntryId, new_group: GroupId) -> Result<bool> {
        if !self.groups.contains_key(&new_group) {
            return Err(Error::ParentNotFound(new_group.0));
        }
        let old_group = self.entry_required(id)?.group;
        if old_group == new_group {
            return Ok(false);
        }

        if let Some(old) = self.groups.get_mut(&old_group) {
            old.entries.retain(|e| *e != id);
        }
        if let Some(new) = self.groups.get_mut(&new_group) {
            new.entries.push(id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.group = new_group;
            entry.times.touch();
        }

        debug!("Moved entry {} from group {} to {}", id, old_group, new_group);
        Ok(true)
    }

    /// Delete a single entry
    pub fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        let entry = self.entries.remove(&id).ok_or(Error::EntryNotFound(id.0))?;
        if let Some(group) = self.groups.get_mut(&entry.group) {
            group.entries.retain(|e| *e != id);
        }
        self.retired_entries.insert(id);
        debug!("Deleted entry {}", id);
        Ok(())
    }

    /// Delete a group with its whole subtree
    ///
    /// This cascades over every descendant group and entry and cannot be
    /// undone once the database is saved.
    pub fn delete_group(&mut self, id: GroupId) -> Result<Removed> {
        let parent = self.group_required(id)?.parent;
        let subtree = self.subtree(id);

        let mut removed = Removed::default();
        for group_id in &subtree {
            if let Some(group) = self.groups.remove(group_id) {
                for entry_id in group.entries {
                    if self.entries.remove(&entry_id).is_some() {
                        self.retired_entries.insert(entry_id);
                        removed.entries += 1;
                    }
                }
                removed.groups += 1;
            }
        }
        if let Some(siblings) = self.siblings_mut(parent) {
            siblings.retain(|g| *g != id);
        }

        debug!(
            "Deleted group {} ({} groups, {} entries)",
            id, removed.groups, removed.entries
        );
        Ok(removed)
    }

    /// Delete a group (cascading) or an entry
    pub fn delete(&mut self, id: ItemId) -> Result<Removed> {
        match id {
            ItemId::Group(group) => self.delete_group(group),
            ItemId::Entry(entry) => {
                self.delete_entry(entry)?;
                Ok(Removed {
                    groups: 0,
                    entries: 1,
                })
            }
        }
    }

    /// `id` and all its descendant groups, pre-order
    pub fn subtree(&self, id: GroupId) -> Vec<GroupId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(group) = self.groups.get(&current) {
                result.push(current);
                stack.extend(group.groups.iter().rev());
            }
        }
        result
    }

    /// Ancestors of a group, nearest first, ending at a top-level group
    pub fn ancestors(&self, id: GroupId) -> Result<Vec<GroupId>> {
        let mut chain = Vec::new();
        let mut current = self.group_required(id)?.parent;
        while let Some(parent) = current {
            if chain.len() > self.groups.len() {
                return Err(Error::MalformedRecord(format!(
                    "Group {} has a cyclic parent chain",
                    id
                )));
            }
            chain.push(parent);
            current = self.group_required(parent)?.parent;
        }
        Ok(chain)
    }

    /// Child groups of `parent` (`None` for top level)
    pub fn child_groups(&self, parent: Option<GroupId>, order: SortOrder) -> Result<Vec<&Group>> {
        let mut groups: Vec<&Group> = self
            .siblings(parent)?
            .iter()
            .filter_map(|id| self.groups.get(id))
            .collect();
        if order == SortOrder::Alphabetical {
            groups.sort_by_cached_key(|g| g.name.to_lowercase());
        }
        Ok(groups)
    }

    /// Entries directly inside a group
    pub fn entries_in(&self, group: GroupId, order: SortOrder) -> Result<Vec<&Entry>> {
        let mut entries: Vec<&Entry> = self
            .group_required(group)?
            .entries
            .iter()
            .filter_map(|id| self.entries.get(id))
            .collect();
        if order == SortOrder::Alphabetical {
            entries.sort_by_cached_key(|e| e.title.to_lowercase());
        }
        Ok(entries)
    }

    /// All groups in pre-order with their depth (0 = top level)
    pub fn groups_in_tree_order(&self) -> Vec<(&Group, u16)> {
        let mut result = Vec::with_capacity(self.groups.len());
        let mut stack: Vec<(GroupId, u16)> = self.root.iter().rev().map(|g| (*g, 0)).collect();
        while let Some((id, level)) = stack.pop() {
            if let Some(group) = self.groups.get(&id) {
                result.push((group, level));
                stack.extend(group.groups.iter().rev().map(|g| (*g, level.saturating_add(1))));
            }
        }
        result
    }

    /// All regular entries, grouped by their group in pre-order
    pub fn entries_in_tree_order(&self) -> Vec<&Entry> {
        self.groups_in_tree_order()
            .into_iter()
            .flat_map(|(group, _)| group.entries.iter())
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    /// Find a top-level group by exact name
    pub fn find_root_group(&self, name: &str) -> Option<GroupId> {
        self.root
            .iter()
            .copied()
            .find(|id| self.groups.get(id).map(|g| g.name == name).unwrap_or(false))
    }

    /// Case-insensitive search over title, username, URL and comment
    pub fn search(&self, query: &str, scope: SearchScope) -> Result<Search<'_>> {
        if let SearchScope::Group(id) = scope {
            self.group_required(id)?;
        }
        Ok(Search::new(self, query, scope))
    }

    /// Check the structural invariants of the tree
    pub fn validate(&self) -> Result<()> {
        let mut seen_groups = HashSet::new();
        for (group, _) in self.groups_in_tree_order() {
            if !seen_groups.insert(group.id) {
                return Err(Error::MalformedRecord(format!(
                    "Group {} is reachable twice",
                    group.id
                )));
            }
        }
        if seen_groups.len() != self.groups.len() {
            return Err(Error::MalformedRecord(
                "Some groups are not reachable from the root".to_string(),
            ));
        }

        for group in self.groups.values() {
            self.ancestors(group.id)?;
            let listed = self.siblings(group.parent)?.contains(&group.id);
            if !listed {
                return Err(Error::MalformedRecord(format!(
                    "Group {} is missing from its parent's child list",
                    group.id
                )));
            }
        }

        for entry in self.entries.values() {
            let parent = self
                .groups
                .get(&entry.group)
                .ok_or(Error::ParentNotFound(entry.group.0))?;
            if !parent.entries.contains(&entry.id) {
                return Err(Error::MalformedRecord(format!(
                    "Entry {} is missing from its group's entry list",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Insert a group read from a file; its parent must already be present
    pub(crate) fn insert_loaded_group(&mut self, group: Group) -> Result<()> {
        if group.id.0 == 0 || group.id.0 == u32::MAX || self.groups.contains_key(&group.id) {
            return Err(Error::MalformedRecord(format!("Invalid or duplicate group id {}", group.id)));
        }
        if let Some(parent) = group.parent {
            if !self.groups.contains_key(&parent) {
                return Err(Error::MalformedRecord(format!(
                    "Group {} references unknown parent {}",
                    group.id, parent
                )));
            }
        }

        let id = group.id;
        let parent = group.parent;
        self.next_group_id = self.next_group_id.max(id.0.saturating_add(1));
        self.groups.insert(id, group);
        if let Some(siblings) = self.siblings_mut(parent) {
            siblings.push(id);
        }
        Ok(())
    }

    /// Insert an entry read from a file
    pub(crate) fn insert_loaded_entry(&mut self, entry: Entry) -> Result<()> {
        if !self.groups.contains_key(&entry.group) {
            return Err(Error::MalformedRecord(format!(
                "Entry {} references unknown group {}",
                entry.id, entry.group
            )));
        }
        if entry.is_meta_stream() {
            self.meta_streams.push(entry);
            return Ok(());
        }
        if self.entries.contains_key(&entry.id) {
            return Err(Error::MalformedRecord(format!("Duplicate entry id {}", entry.id)));
        }

        let id = entry.id;
        let group = entry.group;
        self.entries.insert(id, entry);
        if let Some(parent) = self.groups.get_mut(&group) {
            parent.entries.push(id);
        }
        Ok(())
    }
}

impl PartialEq for Database {
    /// Structural equality: settings, hierarchy, ids and field values
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm
            && self.rounds == other.rounds
            && self.root == other.root
            && self.groups == other.groups
            && self.entries == other.entries
            && self.meta_streams == other.meta_streams
    }
}

fn validate_fields(fields: &EntryFields) -> Result<()> {
    if fields.title.trim().is_empty() {
        return Err(Error::ValidationError("Entry title is mandatory".to_string()));
    }
    Ok(())
}
