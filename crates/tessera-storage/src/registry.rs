//! Databases addressed by a small id.

use crate::database::Database;
use std::collections::BTreeMap;
use tessera_common::{DatabaseConfig, DbId, Result, TesseraError};

/// Owns every open database, for code that needs more than one (for
/// example a primary and its mirror).
#[derive(Default)]
pub struct DatabaseRegistry {
    databases: BTreeMap<DbId, Database>,
    config: DatabaseConfig,
}

impl DatabaseRegistry {
    /// Creates a registry whose databases use `config`.
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            databases: BTreeMap::new(),
            config,
        }
    }

    /// Returns the database with `id`, creating it with the registry's config.
    pub fn open(&mut self, id: DbId) -> Result<&mut Database> {
        let config = self.config.clone();
        self.open_with(id, config)
    }

    /// Returns the database with `id`, creating it with `config` if absent.
    pub fn open_with(&mut self, id: DbId, config: DatabaseConfig) -> Result<&mut Database> {
        if !self.databases.contains_key(&id) {
            let db = Database::new(id, config)?;
            self.databases.insert(id, db);
        }
        self.databases
            .get_mut(&id)
            .ok_or_else(|| TesseraError::Internal(format!("database {} vanished", id)))
    }

    pub fn get(&self, id: DbId) -> Option<&Database> {
        self.databases.get(&id)
    }

    pub fn get_mut(&mut self, id: DbId) -> Option<&mut Database> {
        self.databases.get_mut(&id)
    }

    /// Mutable access to two distinct databases at once.
    pub fn pair_mut(&mut self, a: DbId, b: DbId) -> Option<(&mut Database, &mut Database)> {
        if a == b {
            return None;
        }
        let mut first = None;
        let mut second = None;
        for (id, db) in self.databases.iter_mut() {
            if *id == a {
                first = Some(db);
            } else if *id == b {
                second = Some(db);
            }
        }
        Some((first?, second?))
    }

    /// Removes and returns a database.
    pub fn close(&mut self, id: DbId) -> Option<Database> {
        self.databases.remove(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = DbId> + '_ {
        self.databases.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let mut registry = DatabaseRegistry::default();
        registry.open(1).unwrap().add_checkpoint();
        assert_eq!(registry.open(1).unwrap().log().checkpoint(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(1).unwrap().id(), 1);
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn test_open_with_bad_config() {
        let mut registry = DatabaseRegistry::default();
        let config = DatabaseConfig {
            max_tables: 0,
            ..Default::default()
        };
        assert!(registry.open_with(4, config).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pair_mut() {
        let mut registry = DatabaseRegistry::default();
        registry.open(0).unwrap();
        registry.open(5).unwrap();

        let (primary, mirror) = registry.pair_mut(5, 0).unwrap();
        assert_eq!(primary.id(), 5);
        assert_eq!(mirror.id(), 0);
        assert!(registry.pair_mut(0, 0).is_none());
        assert!(registry.pair_mut(0, 9).is_none());

        assert!(registry.close(5).is_some());
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec![0]);
    }
}
