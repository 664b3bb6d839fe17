use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_SERVICES_PER_TENANT: usize = 100_000;
pub const MAX_APPOINTMENTS_PER_SERVICE: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_PAGE_SIZE: usize = 500;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
