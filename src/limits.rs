//! Hard caps and retry tuning.

/// Max bytes in `resource_id`, `time_slot` or `owner_id`.
pub const MAX_FIELD_LEN: usize = 256;

/// Max bytes of SQL accepted by the wire front end.
pub const MAX_QUERY_LEN: usize = 16 * 1024;

/// Inline retries for a failed slot release before it is handed to the reconciler.
pub const RELEASE_RETRIES: usize = 3;

/// First backoff delay for inline release retries; doubles per attempt.
pub const RELEASE_BACKOFF_MS: u64 = 20;

/// Max payload bytes of one WAL entry. A larger length prefix on replay is
/// treated as a torn tail.
pub const MAX_WAL_ENTRY: usize = 64 * 1024;

/// Slot claims younger than this are left alone by the periodic orphan sweep,
/// since their record write may still be in flight.
pub const ORPHAN_MIN_AGE_MS: u64 = 5 * 60 * 1000;

/// How often the reconciler sweeps the slot index for orphaned claims.
pub const ORPHAN_SWEEP_INTERVAL_MS: u64 = 5 * 60 * 1000;
