#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use fleet_contracts::registry::{BatchRecord, DriverRecord, RegistrySnapshot, VehicleRecord};
use fleet_contracts::Validate;

use crate::clock::Clock;
use crate::error::{QueryError, StorageError};
use crate::repo::RegistrySource;

/// In-process registry of drivers, vehicles and batches. Stands in for the CRUD
/// service that owns these records; fetches return a stamped copy.
#[derive(Clone)]
pub struct InMemoryRegistry {
    snapshot: Arc<Mutex<RegistrySnapshot>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshot: Arc::new(Mutex::new(RegistrySnapshot::default())),
            clock,
        }
    }

    fn with_snapshot<R>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> R) -> R {
        let mut g = match self.snapshot.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        f(&mut g)
    }

    pub fn upsert_driver(&self, rec: DriverRecord) -> Result<(), StorageError> {
        rec.validate()?;
        self.with_snapshot(|s| {
            s.drivers.retain(|d| d.driver_id != rec.driver_id);
            s.drivers.push(rec);
        });
        Ok(())
    }

    pub fn upsert_vehicle(&self, rec: VehicleRecord) -> Result<(), StorageError> {
        rec.validate()?;
        self.with_snapshot(|s| {
            s.vehicles.retain(|v| v.vehicle_id != rec.vehicle_id);
            s.vehicles.push(rec);
        });
        Ok(())
    }

    pub fn upsert_batch(&self, rec: BatchRecord) -> Result<(), StorageError> {
        rec.validate()?;
        self.with_snapshot(|s| {
            s.batches.retain(|b| b.batch_id != rec.batch_id);
            s.batches.push(rec);
        });
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let now = self.clock.now();
        self.with_snapshot(|s| {
            let mut out = s.clone();
            out.fetched_at = now;
            out
        })
    }
}

impl RegistrySource for InMemoryRegistry {
    async fn fetch_registry(&self) -> Result<RegistrySnapshot, QueryError> {
        Ok(self.snapshot())
    }
}
