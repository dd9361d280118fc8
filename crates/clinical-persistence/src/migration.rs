//! Schema migrations (§4.4), applied in ascending `from_version` order at
//! startup. A failed migration rolls back everything already applied this
//! run, in reverse order, before surfacing the error.

use crate::store::InMemoryPersistence;
use clinical_core::effects::StorageError;

/// A single schema step. `from_version`/`to_version` must be consecutive;
/// the runner enforces this so migrations can't silently be reordered.
pub trait Migration: Send + Sync {
    fn from_version(&self) -> u32;
    fn to_version(&self) -> u32;
    fn apply(&self, store: &InMemoryPersistence) -> Result<(), StorageError>;
    fn rollback(&self, store: &InMemoryPersistence) -> Result<(), StorageError>;
}

/// Runs a fixed migration chain against `store`, starting from its current
/// `schema_version`. Migrations whose `from_version` is below the store's
/// current version are skipped.
pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Self {
        migrations.sort_by_key(|m| m.from_version());
        Self { migrations }
    }

    /// Apply every migration whose `from_version` is >= the store's current
    /// version, in order. On failure, roll back everything applied during
    /// this call (not migrations that were already committed in a prior
    /// run) in reverse order, then return the original error.
    pub fn run(&self, store: &InMemoryPersistence) -> Result<(), StorageError> {
        let start = store.schema_version();
        let pending: Vec<&Box<dyn Migration>> = self
            .migrations
            .iter()
            .filter(|m| m.from_version() >= start)
            .collect();

        let mut applied = Vec::new();
        for migration in &pending {
            if migration.from_version() != store.schema_version() {
                return Err(StorageError::MigrationFailed {
                    message: format!(
                        "migration chain gap: expected from_version {}, found {}",
                        store.schema_version(),
                        migration.from_version()
                    ),
                });
            }
            match migration.apply(store) {
                Ok(()) => {
                    store.set_schema_version(migration.to_version());
                    applied.push(migration);
                }
                Err(err) => {
                    tracing::warn!(
                        from = migration.from_version(),
                        to = migration.to_version(),
                        error = %err,
                        "migration failed, rolling back"
                    );
                    for done in applied.iter().rev() {
                        if let Err(rollback_err) = done.rollback(store) {
                            tracing::warn!(
                                error = %rollback_err,
                                "rollback itself failed; store schema state may be inconsistent"
                            );
                        }
                        store.set_schema_version(done.from_version());
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
