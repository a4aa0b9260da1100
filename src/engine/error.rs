use ulid::Ulid;

use crate::model::{Account, Day, StayStatus, Wei};

#[derive(Debug)]
pub enum EngineError {
    EmptyUri,
    DuplicateFacility {
        owner: Account,
        data_uri: String,
    },
    FacilityNotFound(Ulid),
    NotFacilityOwner(Ulid),
    SpaceNotFound(Ulid),
    StayNotFound(Ulid),
    InsufficientPayment {
        required: Wei,
        offered: Wei,
    },
    PastDate {
        day_start: Day,
        today: Day,
    },
    CapacityExceeded {
        space_id: Ulid,
        day: Day,
        capacity: u32,
    },
    InvalidTransition {
        stay_id: Ulid,
        status: StayStatus,
        action: &'static str,
    },
    /// Caller is not the stay's guest.
    Unauthorized(Ulid),
    PayoutFailure(String),
    MintFailure(String),
    Inactive(Ulid),
    HasActiveStays(Ulid),
    CheckInTooEarly {
        day_start: Day,
        today: Day,
    },
    InvalidArgument(&'static str),
    LimitExceeded(&'static str),
    /// Engine bookkeeping disagrees with itself. Never caused by caller input.
    Internal(String),
    WalError(String),
}

impl EngineError {
    /// Short stable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::EmptyUri => "empty_uri",
            EngineError::DuplicateFacility { .. } => "duplicate_facility",
            EngineError::FacilityNotFound(_) => "facility_not_found",
            EngineError::NotFacilityOwner(_) => "not_facility_owner",
            EngineError::SpaceNotFound(_) => "space_not_found",
            EngineError::StayNotFound(_) => "stay_not_found",
            EngineError::InsufficientPayment { .. } => "insufficient_payment",
            EngineError::PastDate { .. } => "past_date",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::PayoutFailure(_) => "payout_failure",
            EngineError::MintFailure(_) => "mint_failure",
            EngineError::Inactive(_) => "inactive",
            EngineError::HasActiveStays(_) => "has_active_stays",
            EngineError::CheckInTooEarly { .. } => "check_in_too_early",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Internal(_) => "internal",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EmptyUri => write!(f, "data URI must be provided"),
            EngineError::DuplicateFacility { owner, data_uri } => {
                write!(f, "facility already exists for owner {owner} and URI {data_uri}")
            }
            EngineError::FacilityNotFound(id) => write!(f, "facility does not exist: {id}"),
            EngineError::NotFacilityOwner(id) => write!(f, "only the owner of facility {id} may do this"),
            EngineError::SpaceNotFound(id) => write!(f, "space does not exist: {id}"),
            EngineError::StayNotFound(id) => write!(f, "stay does not exist: {id}"),
            EngineError::InsufficientPayment { required, offered } => {
                write!(f, "insufficient payment: {offered} offered, {required} required")
            }
            EngineError::PastDate { day_start, today } => {
                write!(f, "day {day_start} is too far in the past (today is day {today})")
            }
            EngineError::CapacityExceeded { space_id, day, capacity } => {
                write!(f, "space {space_id} has no room on day {day} (capacity {capacity})")
            }
            EngineError::InvalidTransition { stay_id, status, action } => {
                write!(f, "cannot {action} stay {stay_id} while it is {status}")
            }
            EngineError::Unauthorized(id) => write!(f, "only the guest of stay {id} may do this"),
            EngineError::PayoutFailure(e) => write!(f, "payout failed: {e}"),
            EngineError::MintFailure(e) => write!(f, "token mint failed: {e}"),
            EngineError::Inactive(id) => write!(f, "not active: {id}"),
            EngineError::HasActiveStays(id) => {
                write!(f, "cannot delete {id}: it still has booked or checked-in stays")
            }
            EngineError::CheckInTooEarly { day_start, today } => {
                write!(f, "check-in opens on day {day_start} (today is day {today})")
            }
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Internal(msg) => write!(f, "internal error: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
