//! Entry search
//!
//! A lazy pre-order walk: each group's own entries come first, then its
//! child groups in sibling order. The walk is finite and can be restarted.

use crate::tree::model::{Entry, GroupId};
use crate::tree::store::Database;

/// Where to search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Every group in the database
    Database,
    /// A group and all its descendants
    Group(GroupId),
}

/// Lazy, restartable sequence of matching entries
#[derive(Clone)]
pub struct Search<'a> {
    db: &'a Database,
    needle: String,
    scope: SearchScope,
    /// Groups still to visit; the next one is at the end
    pending: Vec<GroupId>,
    /// Group whose entries are being scanned and the next index
    current: Option<(GroupId, usize)>,
}

impl<'a> Search<'a> {
    pub(crate) fn new(db: &'a Database, query: &str, scope: SearchScope) -> Self {
        let mut search = Search {
            db,
            needle: query.to_lowercase(),
            scope,
            pending: Vec::new(),
            current: None,
        };
        search.restart();
        search
    }

    /// Start over from the first entry in scope
    pub fn restart(&mut self) {
        self.current = None;
        self.pending = match self.scope {
            SearchScope::Database => self.db.root_groups().iter().rev().copied().collect(),
            SearchScope::Group(id) => vec![id],
        };
    }

    pub fn query(&self) -> &str {
        &self.needle
    }

    fn matches(&self, entry: &Entry) -> bool {
        if self.needle.is_empty() {
            return true;
        }
        [&entry.title, &entry.username, &entry.url, &entry.comment]
            .iter()
            .any(|field| field.to_lowercase().contains(&self.needle))
    }
}

impl<'a> Iterator for Search<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        let db = self.db;
        loop {
            if let Some((group_id, index)) = self.current {
                match db.group(group_id) {
                    Some(group) if index < group.entries().len() => {
                        self.current = Some((group_id, index + 1));
                        if let Some(entry) = db.entry(group.entries()[index]) {
                            if self.matches(entry) {
                                return Some(entry);
                            }
                        }
                        continue;
                    }
                    Some(group) => {
                        self.pending.extend(group.child_groups().iter().rev());
                    }
                    None => {}
                }
                self.current = None;
            }

            let next_group = self.pending.pop()?;
            self.current = Some((next_group, 0));
        }
    }
}
