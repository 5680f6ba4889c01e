//! Hard bounds on caller input. Violations surface as `EngineError::LimitExceeded`
//! or `EngineError::InvalidInterval`.

pub const MIN_GRANULARITY_MINUTES: u32 = 5;
pub const MAX_GRANULARITY_MINUTES: u32 = 240;

pub const MAX_SERVICES_PER_REQUEST: usize = 16;

/// Longest appointment the engine will schedule (12 hours).
pub const MAX_TOTAL_DURATION_MINUTES: u32 = 12 * 60;

pub const MAX_MUTATIONS_PER_COMMIT: usize = 64;

pub const MAX_CONFIRMATION_CODE_LEN: usize = 16;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
