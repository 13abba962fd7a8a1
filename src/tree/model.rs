//! Group and entry records

use crate::crypto::ProtectedString;
use crate::error::Result;
use chrono::{Local, NaiveDate, NaiveDateTime, SubsecRound};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Group identifier, stable across saves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry identifier, stable across saves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn random() -> Self {
        EntryId(Uuid::new_v4())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either kind of tree item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemId {
    Group(GroupId),
    Entry(EntryId),
}

/// Current local time at second precision (the file format has no sub-seconds)
pub fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

/// Expiry value meaning "never expires"
pub fn never_expires() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2999, 12, 28)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Timestamps carried by groups and entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub created: NaiveDateTime,
    pub modified: NaiveDateTime,
    pub accessed: NaiveDateTime,
    pub expires: NaiveDateTime,
}

impl Times {
    pub fn now() -> Self {
        let now = now();
        Times {
            created: now,
            modified: now,
            accessed: now,
            expires: never_expires(),
        }
    }

    /// Record a modification
    pub fn touch(&mut self) {
        let now = now();
        self.modified = now;
        self.accessed = now;
    }

    pub fn never_expires(&self) -> bool {
        self.expires == never_expires()
    }
}

/// A password group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    /// `None` for top-level groups under the implicit root
    pub parent: Option<GroupId>,
    pub name: String,
    pub icon: u32,
    pub times: Times,
    pub flags: u32,
    pub(crate) groups: Vec<GroupId>,
    pub(crate) entries: Vec<EntryId>,
}

impl Group {
    pub(crate) fn new(id: GroupId, parent: Option<GroupId>, name: String) -> Self {
        Group {
            id,
            parent,
            name,
            icon: 0,
            times: Times::now(),
            flags: 0,
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Child groups in sibling order
    pub fn child_groups(&self) -> &[GroupId] {
        &self.groups
    }

    /// Entries in database order
    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }
}

/// A password entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    pub group: GroupId,
    pub icon: u32,
    pub title: String,
    pub url: String,
    pub username: String,
    pub password: ProtectedString,
    pub comment: String,
    pub times: Times,
    pub binary_desc: String,
    pub binary: Vec<u8>,
}

impl Entry {
    pub(crate) fn new(id: EntryId, group: GroupId) -> Result<Self> {
        Ok(Entry {
            id,
            group,
            icon: 0,
            title: String::new(),
            url: String::new(),
            username: String::new(),
            password: ProtectedString::empty()?,
            comment: String::new(),
            times: Times::now(),
            binary_desc: String::new(),
            binary: Vec::new(),
        })
    }

    /// Desktop clients keep UI state in specially marked entries
    pub fn is_meta_stream(&self) -> bool {
        !self.binary.is_empty()
            && self.binary_desc == "bin-stream"
            && self.title == "Meta-Info"
            && self.username == "SYSTEM"
            && self.url == "$"
    }

    pub(crate) fn apply(&mut self, fields: &EntryFields) -> Result<()> {
        self.title = fields.title.clone();
        self.url = fields.url.clone();
        self.username = fields.username.clone();
        self.password = ProtectedString::new(&fields.password)?;
        self.comment = fields.comment.clone();
        if let Some(icon) = fields.icon {
            self.icon = icon;
        }
        Ok(())
    }
}

/// Editable entry fields
#[derive(Clone, Default)]
pub struct EntryFields {
    /// Mandatory
    pub title: String,
    pub url: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub comment: String,
    pub icon: Option<u32>,
}

impl EntryFields {
    pub fn new(title: impl Into<String>) -> Self {
        EntryFields {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Zeroizing::new(password.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn icon(mut self, icon: u32) -> Self {
        self.icon = Some(icon);
        self
    }

    /// Read the current values of an entry back into editable form
    pub fn from_entry(entry: &Entry) -> Result<Self> {
        Ok(EntryFields {
            title: entry.title.clone(),
            url: entry.url.clone(),
            username: entry.username.clone(),
            password: entry.password.reveal()?,
            comment: entry.comment.clone(),
            icon: Some(entry.icon),
        })
    }
}

impl fmt::Debug for EntryFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryFields")
            .field("title", &self.title)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("comment", &self.comment)
            .finish()
    }
}
