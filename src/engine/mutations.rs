use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    BOOKING_REJECTIONS_TOTAL, PAYOUTS_TOTAL, STAYS_BOOKED_TOTAL, STAY_TRANSITIONS_TOTAL,
};

use super::availability::{admit, admit_reschedule, stay_price, stay_range};
use super::directory::Directory;
use super::payout::split_payout;
use super::{Engine, EngineError, SpaceState, WalCommand};

fn record_rejection(action: &'static str, e: &EngineError) {
    metrics::counter!(BOOKING_REJECTIONS_TOTAL, "reason" => e.kind()).increment(1);
    debug!(action, reason = e.kind(), "stay request rejected: {e}");
}

/// The space must exist and be active, and so must its facility.
fn check_bookable(dir: &Directory, ss: &SpaceState) -> Result<(), EngineError> {
    let space = &ss.space;
    if !space.exists() {
        return Err(EngineError::SpaceNotFound(space.id));
    }
    let facility = dir
        .live_facility(&space.facility_id)
        .ok_or(EngineError::FacilityNotFound(space.facility_id))?;
    if !facility.active {
        return Err(EngineError::Inactive(facility.id));
    }
    if !space.active {
        return Err(EngineError::Inactive(space.id));
    }
    Ok(())
}

fn stay_of(ss: &SpaceState, stay_id: Ulid) -> Result<Stay, EngineError> {
    ss.stays.get(&stay_id).cloned().ok_or(EngineError::StayNotFound(stay_id))
}

fn require_status(stay: &Stay, status: StayStatus, action: &'static str) -> Result<(), EngineError> {
    if stay.status != status {
        return Err(EngineError::InvalidTransition {
            stay_id: stay.id,
            status: stay.status,
            action,
        });
    }
    Ok(())
}

/// The owner of the facility a space belongs to. Deleted facilities still
/// have an owner on record.
fn owner_of(dir: &Directory, ss: &SpaceState) -> Result<Account, EngineError> {
    dir.facility(&ss.space.facility_id)
        .map(|f| f.owner.clone())
        .ok_or(EngineError::FacilityNotFound(ss.space.facility_id))
}

impl Engine {
    /// Book `units` of a space for `days` nights starting on `day_start`.
    /// `payment` moves into escrow in full; the caller becomes the guest.
    #[allow(clippy::too_many_arguments)]
    pub async fn book_stay(
        &self,
        guest: &Account,
        space_id: Ulid,
        day_start: Day,
        days: u32,
        units: u32,
        payment: Wei,
        data_uri: String,
    ) -> Result<Stay, EngineError> {
        self.try_book_stay(guest, space_id, day_start, days, units, payment, data_uri)
            .await
            .inspect_err(|e| record_rejection("book", e))
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_book_stay(
        &self,
        guest: &Account,
        space_id: Ulid,
        day_start: Day,
        days: u32,
        units: u32,
        payment: Wei,
        data_uri: String,
    ) -> Result<Stay, EngineError> {
        let range = stay_range(day_start, days, units)?;
        if data_uri.len() > MAX_URI_LEN {
            return Err(EngineError::LimitExceeded("data URI too long"));
        }
        let dir = self.directory.read().await;
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let mut guard = ss.write().await;
        check_bookable(&dir, &guard)?;
        if guard.stays.len() >= MAX_STAYS_PER_SPACE {
            warn!(%space_id, "stay limit reached");
            return Err(EngineError::LimitExceeded("too many stays on space"));
        }

        let price_per_night = guard.space.price_per_night;
        let required = stay_price(price_per_night, days, units)?;
        if payment < required {
            return Err(EngineError::InsufficientPayment {
                required,
                offered: payment,
            });
        }
        admit(&guard, range, units, self.today())?;

        let id = self.next_id()?;
        let token_id = self
            .collaborators
            .issuer
            .mint(guest, id)
            .await
            .map_err(|e| EngineError::MintFailure(e.to_string()))?;

        let event = Event::StayBooked {
            id,
            space_id,
            guest: guest.clone(),
            range,
            units,
            amount_paid: payment,
            price_per_night,
            token_id,
            data_uri,
        };
        if let Err(e) = self.persist(&mut guard, &event).await {
            if let Err(burn) = self.collaborators.issuer.burn(token_id).await {
                error!(stay_id = %id, token_id, "booking failed and token burn failed: {burn}");
            }
            return Err(e);
        }

        metrics::counter!(STAYS_BOOKED_TOTAL).increment(1);
        info!(stay_id = %id, %space_id, %guest, day_start, days, units, "stay booked");
        stay_of(&guard, id)
    }

    /// Move a booked stay to a new range and unit count on the same space.
    /// Either the stay moves or it stays exactly as it was.
    #[allow(clippy::too_many_arguments)]
    pub async fn modify_stay(
        &self,
        caller: &Account,
        stay_id: Ulid,
        day_start: Day,
        days: u32,
        units: u32,
        additional_payment: Wei,
    ) -> Result<Stay, EngineError> {
        self.try_modify_stay(caller, stay_id, day_start, days, units, additional_payment)
            .await
            .inspect_err(|e| record_rejection("modify", e))
    }

    async fn try_modify_stay(
        &self,
        caller: &Account,
        stay_id: Ulid,
        day_start: Day,
        days: u32,
        units: u32,
        additional_payment: Wei,
    ) -> Result<Stay, EngineError> {
        let range = stay_range(day_start, days, units)?;
        let dir = self.directory.read().await;
        let mut guard = self.resolve_stay_write(&stay_id).await?;
        let stay = stay_of(&guard, stay_id)?;
        if &stay.guest != caller {
            return Err(EngineError::Unauthorized(stay_id));
        }
        require_status(&stay, StayStatus::Booked, "modify")?;
        check_bookable(&dir, &guard)?;

        let price_per_night = guard.space.price_per_night;
        let required = stay_price(price_per_night, days, units)?;
        let offered = stay
            .amount_paid
            .checked_add(additional_payment)
            .ok_or(EngineError::LimitExceeded("payment overflow"))?;
        if offered < required {
            return Err(EngineError::InsufficientPayment { required, offered });
        }
        let escrow = stay
            .escrow
            .checked_add(additional_payment)
            .ok_or(EngineError::LimitExceeded("payment overflow"))?;
        admit_reschedule(&guard, (stay.range, stay.units), (range, units), self.today())?;

        let event = Event::StayModified {
            id: stay_id,
            space_id: stay.space_id,
            range,
            units,
            amount_paid: offered,
            escrow,
            price_per_night,
        };
        self.persist(&mut guard, &event).await?;

        metrics::counter!(STAY_TRANSITIONS_TOTAL, "transition" => "modify").increment(1);
        info!(%stay_id, day_start, days, units, "stay modified");
        stay_of(&guard, stay_id)
    }

    /// Cancel a booked stay. The whole escrow goes to the owner and charity;
    /// nothing is refunded to the guest.
    pub async fn cancel_stay(&self, caller: &Account, stay_id: Ulid) -> Result<Payout, EngineError> {
        let dir = self.directory.read().await;
        let mut guard = self.resolve_stay_write(&stay_id).await?;
        let stay = stay_of(&guard, stay_id)?;
        if &stay.guest != caller {
            return Err(EngineError::Unauthorized(stay_id));
        }
        require_status(&stay, StayStatus::Booked, "cancel")?;
        let owner = owner_of(&dir, &guard)?;

        let payout = split_payout(stay.escrow, &owner, &self.config);
        let event = Event::StayCancelled {
            id: stay_id,
            space_id: stay.space_id,
            payout: payout.clone(),
        };
        self.settle(&mut guard, &event, &payout, "cancel").await?;
        info!(%stay_id, amount = %payout.total(), "stay cancelled");
        Ok(payout)
    }

    /// Facility owner checks the guest in on or after the first night. The
    /// first night's worth of escrow is released.
    pub async fn check_in(&self, caller: &Account, stay_id: Ulid) -> Result<Payout, EngineError> {
        let dir = self.directory.read().await;
        let mut guard = self.resolve_stay_write(&stay_id).await?;
        let stay = stay_of(&guard, stay_id)?;
        let owner = owner_of(&dir, &guard)?;
        if &owner != caller {
            return Err(EngineError::NotFacilityOwner(guard.space.facility_id));
        }
        require_status(&stay, StayStatus::Booked, "check in")?;
        let today = self.today();
        if today < stay.range.start {
            return Err(EngineError::CheckInTooEarly {
                day_start: stay.range.start,
                today,
            });
        }

        let first_night = stay
            .price_per_night
            .saturating_mul(Wei::from(stay.units))
            .min(stay.escrow);
        let payout = split_payout(first_night, &owner, &self.config);
        let event = Event::StayCheckedIn {
            id: stay_id,
            space_id: stay.space_id,
            payout: payout.clone(),
        };
        self.settle(&mut guard, &event, &payout, "check_in").await?;
        info!(%stay_id, amount = %payout.total(), "stay checked in");
        Ok(payout)
    }

    /// Facility owner checks the guest out; the rest of the escrow is
    /// released. The calendar keeps the stay's days.
    pub async fn check_out(&self, caller: &Account, stay_id: Ulid) -> Result<Payout, EngineError> {
        let dir = self.directory.read().await;
        let mut guard = self.resolve_stay_write(&stay_id).await?;
        let stay = stay_of(&guard, stay_id)?;
        let owner = owner_of(&dir, &guard)?;
        if &owner != caller {
            return Err(EngineError::NotFacilityOwner(guard.space.facility_id));
        }
        require_status(&stay, StayStatus::CheckedIn, "check out")?;

        let payout = split_payout(stay.escrow, &owner, &self.config);
        let event = Event::StayCheckedOut {
            id: stay_id,
            space_id: stay.space_id,
            payout: payout.clone(),
        };
        self.settle(&mut guard, &event, &payout, "check_out").await?;
        info!(%stay_id, amount = %payout.total(), "stay checked out");
        Ok(payout)
    }

    /// Pay both legs, then commit the transition. A rejected payout leaves
    /// the stay untouched.
    async fn settle(
        &self,
        ss: &mut SpaceState,
        event: &Event,
        payout: &Payout,
        transition: &'static str,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.collaborators.rail.pay(payout).await {
            metrics::counter!(PAYOUTS_TOTAL, "status" => "failed").increment(1);
            warn!(stay_id = %event.subject(), transition, "payout rejected: {e}");
            return Err(EngineError::PayoutFailure(e.to_string()));
        }
        metrics::counter!(PAYOUTS_TOTAL, "status" => "settled").increment(1);

        if let Err(e) = self.persist(ss, event).await {
            error!(
                stay_id = %event.subject(),
                transition,
                owner = %payout.owner,
                owner_amount = %payout.owner_amount,
                charity_amount = %payout.charity_amount,
                "payout settled but transition was not committed: {e}"
            );
            return Err(e);
        }
        metrics::counter!(STAY_TRANSITIONS_TOTAL, "transition" => transition).increment(1);
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// Holds the directory write lock throughout, so no append can slip in
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let dir = self.directory.write().await;
        let mut events = Vec::new();

        for facility in dir.compaction_order() {
            events.push(Event::FacilityCreated {
                id: facility.id,
                owner: facility.owner.clone(),
                data_uri: facility.data_uri.clone(),
                active: facility.active,
            });
            for space_id in dir.space_ids(&facility.id) {
                let Some(ss) = self.get_space_state(space_id) else {
                    continue;
                };
                let guard = ss.read().await;
                self.emit_space(&guard, &facility.owner, &mut events);
            }
            if !facility.exists() {
                events.push(Event::FacilityDeleted { id: facility.id });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// One space and its stays. Cancelled stays are written first, each on an
    /// empty calendar, and the space is created with room for the largest of
    /// them; its real capacity follows once they are out of the way.
    fn emit_space(&self, ss: &SpaceState, owner: &Account, events: &mut Vec<Event>) {
        let space = &ss.space;
        let (cancelled, held): (Vec<&Stay>, Vec<&Stay>) = ss
            .stays_in_order()
            .partition(|s| s.status == StayStatus::Cancelled);
        let replay_capacity = cancelled
            .iter()
            .map(|s| s.units)
            .max()
            .unwrap_or(0)
            .max(space.capacity);

        events.push(Event::SpaceAdded {
            id: space.id,
            facility_id: space.facility_id,
            capacity: replay_capacity,
            price_per_night: space.price_per_night,
            active: space.active,
            data_uri: space.data_uri.clone(),
        });
        for stay in &cancelled {
            self.emit_stay(stay, owner, events);
        }
        if replay_capacity != space.capacity {
            events.push(Event::SpaceUpdated {
                id: space.id,
                facility_id: space.facility_id,
                capacity: space.capacity,
                price_per_night: space.price_per_night,
                active: space.active,
                data_uri: space.data_uri.clone(),
            });
        }
        for stay in &held {
            self.emit_stay(stay, owner, events);
        }
        if !space.exists() {
            events.push(Event::SpaceDeleted {
                id: space.id,
                facility_id: space.facility_id,
            });
        }
    }

    /// A stay as booked at its current parameters, then the transition that
    /// brought it to its current status. The payout carries the total already
    /// released from escrow.
    fn emit_stay(&self, stay: &Stay, owner: &Account, events: &mut Vec<Event>) {
        events.push(Event::StayBooked {
            id: stay.id,
            space_id: stay.space_id,
            guest: stay.guest.clone(),
            range: stay.range,
            units: stay.units,
            amount_paid: stay.amount_paid,
            price_per_night: stay.price_per_night,
            token_id: stay.token_id,
            data_uri: stay.data_uri.clone(),
        });
        let payout = split_payout(stay.amount_paid.saturating_sub(stay.escrow), owner, &self.config);
        let (id, space_id) = (stay.id, stay.space_id);
        match stay.status {
            StayStatus::Booked => {}
            StayStatus::CheckedIn => events.push(Event::StayCheckedIn { id, space_id, payout }),
            StayStatus::CheckedOut => events.push(Event::StayCheckedOut { id, space_id, payout }),
            StayStatus::Cancelled => events.push(Event::StayCancelled { id, space_id, payout }),
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
