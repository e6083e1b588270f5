//! Patient repository: validated CRUD through the store handle.
//!
//! All mutations go through `StoreHandle::write`, so each one bumps the
//! store timestamp that sync compares.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use tracing::{debug, info, warn};

use pv_core::error::{PvError, PvResult};
use pv_models::{Patient, StoreHandle};

use crate::event_bus::{AppEvent, EventBus};
use crate::service::{Service, ServiceState, StateCell};
use crate::sync::SyncCoordinator;

/// Result of [`PatientRepository::save_and_push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub id: i64,
    /// Remote blob id when the push succeeded.
    pub pushed_to: Option<String>,
    /// Why the push did not happen. The save itself stands either way.
    pub push_error: Option<String>,
}

pub struct PatientRepository {
    state: StateCell,
    store: StoreHandle,
    event_bus: EventBus,
    coordinator: Option<Arc<SyncCoordinator>>,
}

impl PatientRepository {
    pub fn new(store: StoreHandle, event_bus: EventBus) -> Self {
        Self {
            state: StateCell::new(),
            store,
            event_bus,
            coordinator: None,
        }
    }

    /// Attach the coordinator used by [`PatientRepository::save_and_push`].
    pub fn with_coordinator(mut self, coordinator: Arc<SyncCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Today's date according to the store clock.
    fn today(&self) -> NaiveDate {
        DateTime::from_timestamp(self.store.clock().now(), 0)
            .map(|dt| dt.date_naive())
            .unwrap_or(NaiveDate::MAX)
    }

    /// Insert or update `patient`. On insert the new id is written back.
    ///
    /// Validation failures never touch the store.
    pub fn save(&self, patient: &mut Patient) -> PvResult<i64> {
        patient.validate_on(self.today())?;

        let mut staged = patient.clone();
        let id = self.store.write(|conn| staged.save(conn))?;
        patient.id = Some(id);

        debug!("saved patient {id}");
        self.event_bus.emit(AppEvent::PatientSaved { id });
        Ok(id)
    }

    /// Delete `patient`. Returns false if it was never saved or is gone.
    pub fn delete(&self, patient: &Patient) -> PvResult<bool> {
        let Some(id) = patient.id else {
            return Ok(false);
        };
        self.delete_by_id(id)
    }

    pub fn delete_by_id(&self, id: i64) -> PvResult<bool> {
        let removed = self.store.write(|conn| Patient::delete(conn, id))?;
        if removed {
            debug!("deleted patient {id}");
            self.event_bus.emit(AppEvent::PatientDeleted { id });
        }
        Ok(removed)
    }

    /// Every patient, ordered by last then first name.
    pub fn load_all(&self) -> PvResult<Vec<Patient>> {
        self.store.read(|conn| Patient::load_all(conn))
    }

    pub fn fetch(&self, id: i64) -> PvResult<Option<Patient>> {
        self.store.read(|conn| Patient::find_by_id(conn, id))
    }

    /// Case-insensitive substring search over first name, last name and
    /// record number. An empty query returns everyone.
    pub fn search(&self, query: &str) -> PvResult<Vec<Patient>> {
        let mut patients = self.load_all()?;
        patients.retain(|p| p.matches(query));
        Ok(patients)
    }

    /// Save, then ask the coordinator to push. A failed push is reported in
    /// the result and logged; it does not undo the save.
    pub async fn save_and_push(&self, patient: &mut Patient) -> PvResult<SaveReport> {
        let id = self.save(patient)?;

        let Some(coordinator) = &self.coordinator else {
            return Ok(SaveReport {
                id,
                pushed_to: None,
                push_error: Some("sync is not configured".into()),
            });
        };

        match coordinator.push().await {
            Ok(blob) => {
                info!("patient {id} saved and pushed to {}", blob.id);
                Ok(SaveReport { id, pushed_to: Some(blob.id), push_error: None })
            }
            Err(e) => {
                warn!("patient {id} saved but push failed: {e}");
                Ok(SaveReport { id, pushed_to: None, push_error: Some(e.to_string()) })
            }
        }
    }
}

impl Service for PatientRepository {
    fn name(&self) -> &str {
        "patients"
    }

    fn state(&self) -> ServiceState {
        self.state.get()
    }

    fn init(&self) -> PvResult<()> {
        if !self.store.is_open() {
            self.state.set(ServiceState::Failed);
            return Err(PvError::StoreUnavailable("patient store is not open".into()));
        }
        self.state.set(ServiceState::Running);
        Ok(())
    }

    fn shutdown(&self) -> PvResult<()> {
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}
