use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 100_000;

/// Resource and owner identifiers, in bytes.
pub const MAX_ID_LEN: usize = 256;

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_IN_CLAUSE_IDS: usize = 1000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Two years.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * MAX_SPAN_DURATION_MS;
