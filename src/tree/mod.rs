//! Group/entry tree
//!
//! Holds the decrypted database content in memory. Mutations validate
//! before they apply, so a failed call leaves the tree unchanged.

mod model;
mod search;
mod store;

pub use model::{
    never_expires, now, Entry, EntryFields, EntryId, Group, GroupId, ItemId, Times,
};
pub use search::{Search, SearchScope};
pub use store::{Database, Removed, SortOrder, DEFAULT_ROUNDS};
