use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::directory::{InMemoryGuests, InMemoryPayments};
use crate::engine::Engine;
use crate::limits::*;

/// Per-property engines. Each property gets its own Engine, WAL, guest store,
/// payment ledger and compactor.
/// Property = database name from the pgwire connection.
///
/// Only the catalog, reservations and check-ins live in the WAL. Guests and payments
/// sit in the in-memory directory and ledger, so they are empty after a restart and
/// have to be registered again before replayed reservations can check in.
pub struct PropertyManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl PropertyManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `property`. Names that sanitize to the same
    /// file name share an engine.
    pub fn get_or_create(&self, property: &str) -> std::io::Result<Arc<Engine>> {
        if property.len() > MAX_PROPERTY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "property name too long",
            ));
        }

        // Keep the name usable as a file name inside data_dir.
        let safe_name: String = property
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty property name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        if self.engines.len() >= MAX_PROPERTIES {
            return Err(std::io::Error::other("too many properties"));
        }

        // The entry lock keeps two first connections from opening the same WAL twice.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::open(
                    wal_path,
                    Arc::new(InMemoryGuests::new()),
                    Arc::new(InMemoryPayments::new()),
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::PROPERTIES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened property {property:?}");
        let replayed = engine.reservation_count();
        if replayed > 0 {
            tracing::warn!(
                "property {property:?}: {replayed} reservations replayed, guests and payments start empty"
            );
        }
        Ok(engine)
    }
}
