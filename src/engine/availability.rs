use tracing::error;

use crate::limits::MAX_STAY_DAYS;
use crate::model::*;

use super::calendar::Overbooked;
use super::{EngineError, SpaceState};

// ── Admission policy ──────────────────────────────────────────────

/// Validate raw stay parameters and build the reserved range.
pub(crate) fn stay_range(day_start: Day, days: u32, units: u32) -> Result<DayRange, EngineError> {
    if days == 0 {
        return Err(EngineError::InvalidArgument("number of days must be positive"));
    }
    if units == 0 {
        return Err(EngineError::InvalidArgument("number of units must be positive"));
    }
    if days > MAX_STAY_DAYS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    DayRange::new(day_start, days).ok_or(EngineError::InvalidArgument("day range out of bounds"))
}

/// Grace-day policy: a stay may start yesterday, but no earlier.
pub(crate) fn check_not_past(range: &DayRange, today: Day) -> Result<(), EngineError> {
    if range.start < today - 1 {
        return Err(EngineError::PastDate {
            day_start: range.start,
            today,
        });
    }
    Ok(())
}

/// `price * days * units`, refusing to wrap.
pub(crate) fn stay_price(price_per_night: Wei, days: u32, units: u32) -> Result<Wei, EngineError> {
    price_per_night
        .checked_mul(Wei::from(days))
        .and_then(|p| p.checked_mul(Wei::from(units)))
        .ok_or(EngineError::LimitExceeded("payment overflow"))
}

/// Would `units` more on every day of `range` fit? Reads only.
pub fn admit(state: &SpaceState, range: DayRange, units: u32, today: Day) -> Result<(), EngineError> {
    check_not_past(&range, today)?;
    state
        .calendar
        .check(state.space.capacity, &[(range, i64::from(units))])
        .map_err(|e| overbooked(state, e))
}

/// Would moving a reservation from `old` to `new` fit? The old range is
/// released and the new one reserved as one net change. Reads only.
pub fn admit_reschedule(
    state: &SpaceState,
    old: (DayRange, u32),
    new: (DayRange, u32),
    today: Day,
) -> Result<(), EngineError> {
    check_not_past(&new.0, today)?;
    state
        .calendar
        .check(state.space.capacity, &reschedule_deltas(old, new))
        .map_err(|e| overbooked(state, e))
}

// ── Calendar mutation ─────────────────────────────────────────────

pub fn reserve(state: &mut SpaceState, range: DayRange, units: u32) -> Result<(), EngineError> {
    let capacity = state.space.capacity;
    state
        .calendar
        .adjust(capacity, range, i64::from(units))
        .map_err(|e| overbooked(state, e))
}

/// Give back units held by a stay. Driving any day below zero means the stay
/// records and the calendar have diverged, which is reported as `Internal`.
pub fn release(state: &mut SpaceState, range: DayRange, units: u32) -> Result<(), EngineError> {
    let capacity = state.space.capacity;
    state
        .calendar
        .adjust(capacity, range, -i64::from(units))
        .map_err(|e| overbooked(state, e))
}

pub fn reschedule(
    state: &mut SpaceState,
    old: (DayRange, u32),
    new: (DayRange, u32),
) -> Result<(), EngineError> {
    let capacity = state.space.capacity;
    state
        .calendar
        .apply(capacity, &reschedule_deltas(old, new))
        .map_err(|e| overbooked(state, e))
}

/// Remaining units per day over `range`.
pub fn query(state: &SpaceState, range: DayRange) -> Vec<u32> {
    state.calendar.remaining(state.space.capacity, range)
}

fn reschedule_deltas(old: (DayRange, u32), new: (DayRange, u32)) -> [(DayRange, i64); 2] {
    [(old.0, -i64::from(old.1)), (new.0, i64::from(new.1))]
}

fn overbooked(state: &SpaceState, e: Overbooked) -> EngineError {
    if e.is_underflow() {
        error!(
            space_id = %state.space.id,
            day = e.day,
            "calendar would drop below zero; stay records and calendar disagree"
        );
        return EngineError::Internal(format!(
            "space {} day {} would hold {} units",
            state.space.id, e.day, e.booked
        ));
    }
    EngineError::CapacityExceeded {
        space_id: state.space.id,
        day: e.day,
        capacity: state.space.capacity,
    }
}
