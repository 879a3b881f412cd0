mod base;

pub use base::CREATE_SCHEMA_SQL;

/// Version written into `meta` by `CREATE_SCHEMA_SQL`.
pub const SCHEMA_VERSION: &str = "1";
