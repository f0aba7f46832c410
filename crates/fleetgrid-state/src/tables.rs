//! redb table definitions for the group store.
//!
//! Keys are group names; values are JSON-serialized [`GroupSpec`](crate::GroupSpec)s.

use redb::TableDefinition;

/// Group definitions keyed by group name.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
