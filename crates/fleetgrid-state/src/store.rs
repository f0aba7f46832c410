//! GroupStore — redb-backed persistence of group definitions.
//!
//! Only [`GroupSpec`]s are stored. Instances are runtime state owned by the
//! [`Registry`](crate::Registry) and are rebuilt from the container runtime
//! after a restart.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::GROUPS;
use crate::types::GroupSpec;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe group store backed by redb.
#[derive(Clone)]
pub struct GroupStore {
    db: Arc<Database>,
}

impl GroupStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "group store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory group store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace a group definition.
    pub fn put_group(&self, spec: &GroupSpec) -> StateResult<()> {
        let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(spec.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %spec.name, "group stored");
        Ok(())
    }

    pub fn get_group(&self, name: &str) -> StateResult<Option<GroupSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let spec: GroupSpec =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(spec))
            }
            None => Ok(None),
        }
    }

    /// List all stored groups, ordered by name.
    pub fn list_groups(&self) -> StateResult<Vec<GroupSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let spec: GroupSpec =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(spec);
        }
        Ok(results)
    }

    /// Delete a group definition. Returns true if it existed.
    pub fn delete_group(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %name, existed, "group deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            platform: Platform::Paper,
            policy: GroupPolicy {
                min_instances: 1,
                max_instances: 4,
                scale_up_threshold: 20.0,
                scale_down_threshold: 5.0,
                cooldown_secs: 30,
                signal: SignalKind::PlayersPerInstance,
                max_players: 20,
            },
            template: ContainerTemplate {
                image: format!("{name}:latest"),
                memory_bytes: 1 << 30,
                cpu_millis: 1000,
                env: BTreeMap::from([("EULA".to_string(), "true".to_string())]),
                command: None,
                port_range: PortRange { start: 30000, end: 30010 },
                host_address: "127.0.0.1".to_string(),
            },
        }
    }

    #[test]
    fn group_put_and_get() {
        let store = GroupStore::open_in_memory().unwrap();
        store.put_group(&spec("lobby")).unwrap();

        let got = store.get_group("lobby").unwrap().unwrap();
        assert_eq!(got, spec("lobby"));
    }

    #[test]
    fn group_get_nonexistent_returns_none() {
        let store = GroupStore::open_in_memory().unwrap();
        assert!(store.get_group("missing").unwrap().is_none());
    }

    #[test]
    fn group_update_in_place() {
        let store = GroupStore::open_in_memory().unwrap();
        let mut s = spec("lobby");
        store.put_group(&s).unwrap();

        s.policy.max_instances = 8;
        store.put_group(&s).unwrap();

        let got = store.get_group("lobby").unwrap().unwrap();
        assert_eq!(got.policy.max_instances, 8);
        assert_eq!(store.list_groups().unwrap().len(), 1);
    }

    #[test]
    fn group_list_is_name_ordered() {
        let store = GroupStore::open_in_memory().unwrap();
        store.put_group(&spec("skywars")).unwrap();
        store.put_group(&spec("bedwars")).unwrap();

        let names: Vec<_> = store
            .list_groups()
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["bedwars", "skywars"]);
    }

    #[test]
    fn group_delete() {
        let store = GroupStore::open_in_memory().unwrap();
        store.put_group(&spec("lobby")).unwrap();

        assert!(store.delete_group("lobby").unwrap());
        assert!(!store.delete_group("lobby").unwrap());
        assert!(store.get_group("lobby").unwrap().is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("groups.redb");

        {
            let store = GroupStore::open(&db_path).unwrap();
            store.put_group(&spec("lobby")).unwrap();
        }

        let store = GroupStore::open(&db_path).unwrap();
        let got = store.get_group("lobby").unwrap();
        assert_eq!(got.unwrap().template.image, "lobby:latest");
    }
}
