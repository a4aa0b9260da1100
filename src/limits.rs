// Hard limits on untrusted input. Everything arriving over the wire is
// checked against these before it reaches the engine state.

pub const MAX_URI_LEN: usize = 2048;
pub const MAX_ACCOUNT_LEN: usize = 256;

/// Longest single stay, in nights.
pub const MAX_STAY_DAYS: u32 = 366;
/// Widest availability query, in days.
pub const MAX_QUERY_DAYS: u32 = 3660;

pub const MAX_FACILITIES_PER_TENANT: usize = 100_000;
pub const MAX_SPACES_PER_FACILITY: usize = 1_000;
pub const MAX_STAYS_PER_SPACE: usize = 100_000;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;
