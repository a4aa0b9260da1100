use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::{Engine, EngineError};

impl Engine {
    /// Fetch a facility by id, deleted or not.
    pub async fn facility(&self, id: &Ulid) -> Option<Facility> {
        self.directory.read().await.facility(id).cloned()
    }

    /// Existing facilities in registration order.
    pub async fn facility_ids(&self) -> Vec<Ulid> {
        self.directory.read().await.facility_ids()
    }

    pub async fn facility_ids_of(&self, owner: &Account) -> Vec<Ulid> {
        self.directory.read().await.facility_ids_of(owner)
    }

    /// Existing facilities, optionally narrowed to one owner.
    pub async fn facilities(&self, owner: Option<&Account>) -> Vec<Facility> {
        let dir = self.directory.read().await;
        let ids = match owner {
            Some(owner) => dir.facility_ids_of(owner),
            None => dir.facility_ids(),
        };
        ids.iter().filter_map(|id| dir.facility(id).cloned()).collect()
    }

    pub async fn space(&self, id: &Ulid) -> Option<Space> {
        let _dir = self.directory.read().await;
        let ss = self.get_space_state(id)?;
        let guard = ss.read().await;
        Some(guard.space.clone())
    }

    /// Existing spaces of an existing facility, in creation order.
    pub async fn spaces_of(&self, facility_id: &Ulid) -> Result<Vec<Space>, EngineError> {
        let dir = self.directory.read().await;
        if dir.live_facility(facility_id).is_none() {
            return Err(EngineError::FacilityNotFound(*facility_id));
        }
        let mut spaces = Vec::new();
        for space_id in dir.space_ids(facility_id) {
            if let Some(ss) = self.get_space_state(space_id) {
                let guard = ss.read().await;
                if guard.space.exists() {
                    spaces.push(guard.space.clone());
                }
            }
        }
        Ok(spaces)
    }

    pub async fn space_ids_of(&self, facility_id: &Ulid) -> Result<Vec<Ulid>, EngineError> {
        Ok(self.spaces_of(facility_id).await?.into_iter().map(|s| s.id).collect())
    }

    /// Spaces a guest could book right now: existing and active.
    pub async fn active_space_ids_of(&self, facility_id: &Ulid) -> Result<Vec<Ulid>, EngineError> {
        Ok(self
            .spaces_of(facility_id)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .map(|s| s.id)
            .collect())
    }

    pub async fn stay(&self, id: &Ulid) -> Option<Stay> {
        let _dir = self.directory.read().await;
        let space_id = self.get_space_for_stay(id)?;
        let ss = self.get_space_state(&space_id)?;
        let guard = ss.read().await;
        guard.stays.get(id).cloned()
    }

    /// A guest's stays in booking order, across every space.
    pub async fn stays_of_guest(&self, guest: &Account) -> Vec<Stay> {
        let _dir = self.directory.read().await;
        let ids = self
            .guest_stays
            .get(guest)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut stays = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(ss) = self
                .get_space_for_stay(&id)
                .and_then(|space_id| self.get_space_state(&space_id))
            else {
                continue;
            };
            if let Some(stay) = ss.read().await.stays.get(&id) {
                stays.push(stay.clone());
            }
        }
        stays
    }

    /// Every stay booked on a space, in booking order.
    pub async fn stays_of_space(&self, space_id: &Ulid) -> Result<Vec<Stay>, EngineError> {
        let _dir = self.directory.read().await;
        let ss = self
            .get_space_state(space_id)
            .ok_or(EngineError::SpaceNotFound(*space_id))?;
        let guard = ss.read().await;
        Ok(guard.stays_in_order().cloned().collect())
    }

    /// Remaining units on each day of `[day_start, day_start + days)`.
    pub async fn availability(
        &self,
        space_id: &Ulid,
        day_start: Day,
        days: u32,
    ) -> Result<Vec<u32>, EngineError> {
        if days == 0 {
            return Err(EngineError::InvalidArgument("number of days must be positive"));
        }
        if days > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let range = DayRange::new(day_start, days)
            .ok_or(EngineError::InvalidArgument("day range out of bounds"))?;
        let _dir = self.directory.read().await;
        let ss = self
            .get_space_state(space_id)
            .ok_or(EngineError::SpaceNotFound(*space_id))?;
        let guard = ss.read().await;
        if !guard.space.exists() {
            return Err(EngineError::SpaceNotFound(*space_id));
        }
        Ok(availability::query(&guard, range))
    }
}
