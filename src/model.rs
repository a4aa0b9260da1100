use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Day index counted from the configured day zero.
pub type Day = i64;

/// Unix seconds — the only wall-clock type.
pub type Secs = i64;

/// Money in minor currency units.
pub type Wei = u128;

/// Identifier handed back by the possession-token issuer.
pub type TokenId = u64;

pub const SECONDS_PER_DAY: Secs = 86_400;

/// Canonical timestamp → day conversion. Floors, so instants before day zero
/// land on negative days rather than rounding towards zero.
pub fn day_index(now: Secs, day_zero: Secs) -> Day {
    (now - day_zero).div_euclid(SECONDS_PER_DAY)
}

/// Opaque caller identity (facility owner, guest, charity beneficiary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Account(String);

impl Account {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Account {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Half-open day range `[start, start + days)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub start: Day,
    pub days: u32,
}

impl DayRange {
    /// `None` for an empty range or one whose end is past `Day::MAX`.
    pub fn new(start: Day, days: u32) -> Option<Self> {
        if days == 0 {
            return None;
        }
        start.checked_add(Day::from(days))?;
        Some(Self { start, days })
    }

    pub fn end(&self) -> Day {
        self.start.saturating_add(Day::from(self.days))
    }

    pub fn iter(&self) -> impl Iterator<Item = Day> {
        self.start..self.end()
    }
}

/// Soft-delete tag. Records are never removed, only marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Existence {
    Exists,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facility {
    pub id: Ulid,
    pub owner: Account,
    pub data_uri: String,
    pub active: bool,
    pub existence: Existence,
}

impl Facility {
    pub fn exists(&self) -> bool {
        self.existence == Existence::Exists
    }
}

/// A bucket of identical rentable units inside a facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub id: Ulid,
    pub facility_id: Ulid,
    /// Max units that may be booked on any single day.
    pub capacity: u32,
    pub price_per_night: Wei,
    pub active: bool,
    pub existence: Existence,
    pub data_uri: String,
}

impl Space {
    pub fn exists(&self) -> bool {
        self.existence == Existence::Exists
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StayStatus {
    Booked,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl StayStatus {
    /// Whether a stay in this state still counts against the calendar.
    /// Check-out leaves the occupied days booked; only cancellation frees them.
    pub fn holds_capacity(self) -> bool {
        !matches!(self, StayStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StayStatus::Booked => "booked",
            StayStatus::CheckedIn => "checked_in",
            StayStatus::CheckedOut => "checked_out",
            StayStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stay {
    pub id: Ulid,
    pub space_id: Ulid,
    pub guest: Account,
    pub range: DayRange,
    pub units: u32,
    /// Everything the guest has paid in, across booking and modifications.
    pub amount_paid: Wei,
    /// Portion of `amount_paid` not yet released to owner and charity.
    pub escrow: Wei,
    /// Nightly rate the stay was last priced at.
    pub price_per_night: Wei,
    pub status: StayStatus,
    pub token_id: TokenId,
    pub data_uri: String,
}

/// One payout event: the owner leg and the charity leg, settled together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub owner: Account,
    pub owner_amount: Wei,
    pub charity: Account,
    pub charity_amount: Wei,
}

impl Payout {
    pub fn total(&self) -> Wei {
        self.owner_amount + self.charity_amount
    }
}

/// The event types — flat, no nesting. This is the WAL record format and
/// what subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: Ulid,
        owner: Account,
        data_uri: String,
        active: bool,
    },
    FacilityUpdated {
        id: Ulid,
        data_uri: String,
        active: bool,
    },
    FacilityDeleted {
        id: Ulid,
    },
    SpaceAdded {
        id: Ulid,
        facility_id: Ulid,
        capacity: u32,
        price_per_night: Wei,
        active: bool,
        data_uri: String,
    },
    SpaceUpdated {
        id: Ulid,
        facility_id: Ulid,
        capacity: u32,
        price_per_night: Wei,
        active: bool,
        data_uri: String,
    },
    SpaceDeleted {
        id: Ulid,
        facility_id: Ulid,
    },
    StayBooked {
        id: Ulid,
        space_id: Ulid,
        guest: Account,
        range: DayRange,
        units: u32,
        amount_paid: Wei,
        price_per_night: Wei,
        token_id: TokenId,
        data_uri: String,
    },
    StayModified {
        id: Ulid,
        space_id: Ulid,
        range: DayRange,
        units: u32,
        amount_paid: Wei,
        escrow: Wei,
        price_per_night: Wei,
    },
    StayCancelled {
        id: Ulid,
        space_id: Ulid,
        payout: Payout,
    },
    StayCheckedIn {
        id: Ulid,
        space_id: Ulid,
        payout: Payout,
    },
    StayCheckedOut {
        id: Ulid,
        space_id: Ulid,
        payout: Payout,
    },
}

impl Event {
    /// Id of the record the event is about.
    pub fn subject(&self) -> Ulid {
        match self {
            Event::FacilityCreated { id, .. }
            | Event::FacilityUpdated { id, .. }
            | Event::FacilityDeleted { id }
            | Event::SpaceAdded { id, .. }
            | Event::SpaceUpdated { id, .. }
            | Event::SpaceDeleted { id, .. }
            | Event::StayBooked { id, .. }
            | Event::StayModified { id, .. }
            | Event::StayCancelled { id, .. }
            | Event::StayCheckedIn { id, .. }
            | Event::StayCheckedOut { id, .. } => *id,
        }
    }

    /// Channel the event is published on: facility events on the facility,
    /// space events on the owning facility, stay events on the space.
    pub fn channel(&self) -> Ulid {
        match self {
            Event::FacilityCreated { id, .. }
            | Event::FacilityUpdated { id, .. }
            | Event::FacilityDeleted { id } => *id,
            Event::SpaceAdded { facility_id, .. }
            | Event::SpaceUpdated { facility_id, .. }
            | Event::SpaceDeleted { facility_id, .. } => *facility_id,
            Event::StayBooked { space_id, .. }
            | Event::StayModified { space_id, .. }
            | Event::StayCancelled { space_id, .. }
            | Event::StayCheckedIn { space_id, .. }
            | Event::StayCheckedOut { space_id, .. } => *space_id,
        }
    }

    /// Status a stay lands in after this event, if it is a stay event.
    pub fn stay_status(&self) -> Option<StayStatus> {
        match self {
            Event::StayBooked { .. } | Event::StayModified { .. } => Some(StayStatus::Booked),
            Event::StayCancelled { .. } => Some(StayStatus::Cancelled),
            Event::StayCheckedIn { .. } => Some(StayStatus::CheckedIn),
            Event::StayCheckedOut { .. } => Some(StayStatus::CheckedOut),
            _ => None,
        }
    }
}
