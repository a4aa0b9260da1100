use std::collections::HashMap;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Facility registry plus the facility → spaces index.
///
/// Records are never removed: a deleted facility stays fetchable by id but
/// drops out of every listing and frees its `(owner, data_uri)` pair.
#[derive(Debug, Default)]
pub struct Directory {
    facilities: HashMap<Ulid, Facility>,
    /// Facility ids in registration order.
    order: Vec<Ulid>,
    by_owner: HashMap<Account, Vec<Ulid>>,
    /// `(owner, data_uri)` → id, for existing facilities only.
    by_key: HashMap<(Account, String), Ulid>,
    /// Facility id → space ids in creation order, deleted ones included.
    spaces: HashMap<Ulid, Vec<Ulid>>,
}

impl Directory {
    pub fn facility(&self, id: &Ulid) -> Option<&Facility> {
        self.facilities.get(id)
    }

    /// The facility, if it exists and has not been deleted.
    pub fn live_facility(&self, id: &Ulid) -> Option<&Facility> {
        self.facilities.get(id).filter(|f| f.exists())
    }

    /// Existing facility owned by `caller`.
    pub fn owned_facility(&self, id: &Ulid, caller: &Account) -> Result<&Facility, EngineError> {
        let facility = self.live_facility(id).ok_or(EngineError::FacilityNotFound(*id))?;
        if &facility.owner != caller {
            return Err(EngineError::NotFacilityOwner(*id));
        }
        Ok(facility)
    }

    pub fn facility_ids(&self) -> Vec<Ulid> {
        self.order
            .iter()
            .filter(|id| self.live_facility(id).is_some())
            .copied()
            .collect()
    }

    pub fn facility_ids_of(&self, owner: &Account) -> Vec<Ulid> {
        self.by_owner
            .get(owner)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.live_facility(id).is_some())
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deleted facilities first, then live ones, each group in registration
    /// order. Compaction writes them in this order so a freed key is reused
    /// only after its old holder is gone.
    pub(super) fn compaction_order(&self) -> Vec<&Facility> {
        let (deleted, live): (Vec<&Facility>, Vec<&Facility>) = self
            .order
            .iter()
            .filter_map(|id| self.facilities.get(id))
            .partition(|f| !f.exists());
        deleted.into_iter().chain(live).collect()
    }

    pub fn live_count(&self) -> usize {
        self.by_key.len()
    }

    pub fn space_ids(&self, facility_id: &Ulid) -> &[Ulid] {
        self.spaces.get(facility_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn key_holder(&self, owner: &Account, data_uri: &str) -> Option<Ulid> {
        self.by_key.get(&(owner.clone(), data_uri.to_string())).copied()
    }

    /// Record a directory event. Space events other than `SpaceAdded` do
    /// not touch the directory.
    pub(super) fn apply(&mut self, event: &Event) {
        match event {
            Event::FacilityCreated {
                id,
                owner,
                data_uri,
                active,
            } => {
                self.facilities.insert(
                    *id,
                    Facility {
                        id: *id,
                        owner: owner.clone(),
                        data_uri: data_uri.clone(),
                        active: *active,
                        existence: Existence::Exists,
                    },
                );
                self.order.push(*id);
                self.by_owner.entry(owner.clone()).or_default().push(*id);
                self.by_key.insert((owner.clone(), data_uri.clone()), *id);
            }
            Event::FacilityUpdated { id, data_uri, active } => {
                let Some(facility) = self.facilities.get_mut(id) else {
                    return;
                };
                let old_key = (facility.owner.clone(), facility.data_uri.clone());
                if self.by_key.get(&old_key) == Some(id) {
                    self.by_key.remove(&old_key);
                }
                facility.data_uri = data_uri.clone();
                facility.active = *active;
                self.by_key.insert((facility.owner.clone(), data_uri.clone()), *id);
            }
            Event::FacilityDeleted { id } => {
                let Some(facility) = self.facilities.get_mut(id) else {
                    return;
                };
                facility.existence = Existence::Deleted;
                let key = (facility.owner.clone(), facility.data_uri.clone());
                if self.by_key.get(&key) == Some(id) {
                    self.by_key.remove(&key);
                }
            }
            Event::SpaceAdded { id, facility_id, .. } => {
                self.spaces.entry(*facility_id).or_default().push(*id);
            }
            _ => {}
        }
    }

    pub(super) fn restore_order(&mut self) {
        self.order.sort();
        for ids in self.by_owner.values_mut() {
            ids.sort();
        }
        for ids in self.spaces.values_mut() {
            ids.sort();
        }
    }
}

fn check_uri(data_uri: &str) -> Result<(), EngineError> {
    if data_uri.len() > MAX_URI_LEN {
        return Err(EngineError::LimitExceeded("data URI too long"));
    }
    Ok(())
}

fn check_facility_uri(data_uri: &str) -> Result<(), EngineError> {
    if data_uri.is_empty() {
        return Err(EngineError::EmptyUri);
    }
    check_uri(data_uri)
}

impl Engine {
    pub async fn register_facility(
        &self,
        owner: &Account,
        data_uri: String,
        active: bool,
    ) -> Result<Ulid, EngineError> {
        check_facility_uri(&data_uri)?;
        let mut dir = self.directory.write().await;
        if dir.live_count() >= MAX_FACILITIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        if dir.key_holder(owner, &data_uri).is_some() {
            return Err(EngineError::DuplicateFacility {
                owner: owner.clone(),
                data_uri,
            });
        }

        let id = self.next_id()?;
        let event = Event::FacilityCreated {
            id,
            owner: owner.clone(),
            data_uri,
            active,
        };
        self.persist_directory(&mut dir, &event).await?;
        info!(facility_id = %id, %owner, "facility registered");
        Ok(id)
    }

    pub async fn update_facility(
        &self,
        caller: &Account,
        id: Ulid,
        data_uri: String,
        active: bool,
    ) -> Result<(), EngineError> {
        check_facility_uri(&data_uri)?;
        let mut dir = self.directory.write().await;
        let owner = dir.owned_facility(&id, caller)?.owner.clone();
        if let Some(holder) = dir.key_holder(&owner, &data_uri)
            && holder != id
        {
            return Err(EngineError::DuplicateFacility { owner, data_uri });
        }

        let event = Event::FacilityUpdated { id, data_uri, active };
        self.persist_directory(&mut dir, &event).await
    }

    /// Soft-delete a facility and every space under it.
    pub async fn delete_facility(&self, caller: &Account, id: Ulid) -> Result<(), EngineError> {
        let mut dir = self.directory.write().await;
        dir.owned_facility(&id, caller)?;
        for space_id in dir.space_ids(&id) {
            if let Some(ss) = self.get_space_state(space_id)
                && ss.read().await.has_pending_stays()
            {
                return Err(EngineError::HasActiveStays(id));
            }
        }

        let event = Event::FacilityDeleted { id };
        self.persist_directory(&mut dir, &event).await?;
        info!(facility_id = %id, "facility deleted");
        Ok(())
    }

    pub async fn add_space(
        &self,
        caller: &Account,
        facility_id: Ulid,
        capacity: u32,
        price_per_night: Wei,
        active: bool,
        data_uri: String,
    ) -> Result<Ulid, EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidArgument("capacity must be positive"));
        }
        check_uri(&data_uri)?;
        let mut dir = self.directory.write().await;
        dir.owned_facility(&facility_id, caller)?;
        if dir.space_ids(&facility_id).len() >= MAX_SPACES_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many spaces in facility"));
        }

        let id = self.next_id()?;
        let event = Event::SpaceAdded {
            id,
            facility_id,
            capacity,
            price_per_night,
            active,
            data_uri,
        };
        self.persist_directory(&mut dir, &event).await?;
        info!(space_id = %id, %facility_id, capacity, "space added");
        Ok(id)
    }

    /// Capacity may shrink only down to the busiest booked day.
    pub async fn update_space(
        &self,
        caller: &Account,
        space_id: Ulid,
        capacity: u32,
        price_per_night: Wei,
        active: bool,
        data_uri: String,
    ) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidArgument("capacity must be positive"));
        }
        check_uri(&data_uri)?;
        let dir = self.directory.write().await;
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let mut guard = ss.write().await;
        if !guard.space.exists() {
            return Err(EngineError::SpaceNotFound(space_id));
        }
        dir.owned_facility(&guard.space.facility_id, caller)?;
        if let Some((day, booked)) = guard.calendar.peak()
            && booked > capacity
        {
            return Err(EngineError::CapacityExceeded { space_id, day, capacity });
        }

        let event = Event::SpaceUpdated {
            id: space_id,
            facility_id: guard.space.facility_id,
            capacity,
            price_per_night,
            active,
            data_uri,
        };
        self.persist(&mut guard, &event).await
    }

    pub async fn delete_space(&self, caller: &Account, space_id: Ulid) -> Result<(), EngineError> {
        let dir = self.directory.write().await;
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let mut guard = ss.write().await;
        if !guard.space.exists() {
            return Err(EngineError::SpaceNotFound(space_id));
        }
        dir.owned_facility(&guard.space.facility_id, caller)?;
        if guard.has_pending_stays() {
            return Err(EngineError::HasActiveStays(space_id));
        }

        let event = Event::SpaceDeleted {
            id: space_id,
            facility_id: guard.space.facility_id,
        };
        self.persist(&mut guard, &event).await?;
        info!(%space_id, "space deleted");
        Ok(())
    }
}
