pub mod cli;
pub mod config;
pub mod database;
pub mod directory;
pub mod error;
pub mod list_options;
pub mod logging;
pub mod membership;
pub mod pack_specs;
pub mod packs;
pub mod queries;
pub mod schema;
pub mod stats;
pub mod system_packs;

pub use database::Database;
pub use error::FleetPackError;
