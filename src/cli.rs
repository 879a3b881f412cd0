use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{Config, CONFIG};
use crate::database::Database;
use crate::error::FleetPackError;
use crate::logging::setup_logging;
use crate::membership::Membership;
use crate::pack_specs::{PackSpec, PackSpecs};
use crate::packs::{PackListOptions, Packs};
use crate::queries::{Queries, Query};
use crate::stats::ExecutionStats;
use crate::system_packs::SystemPacks;

#[derive(Parser)]
#[command(
    name = "fleetpack",
    version,
    about = "FleetPack: declarative query packs for host fleets"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Upsert queries from a JSON array (or a TOML file with [[queries]] tables)
    ApplyQueries {
        /// File containing the query documents
        #[arg(long = "file", short = 'f')]
        file: PathBuf,

        /// User id recorded as the author of every applied query
        #[arg(long = "author-id")]
        author_id: Option<i64>,
    },

    /// Apply pack specs from a JSON array (or a TOML file with [[packs]] tables)
    ApplyPacks {
        /// File containing the pack specs
        #[arg(long = "file", short = 'f')]
        file: PathBuf,
    },

    /// Print pack specs as JSON (all user packs unless a name is given)
    GetPacks {
        /// Name of a single pack
        #[arg(long = "name", short = 'n')]
        name: Option<String>,
    },

    /// List packs
    ListPacks {
        /// Include the global and team packs
        #[arg(long = "include-system", default_value_t = false)]
        include_system: bool,
    },

    /// List the packs that currently apply to a host
    PacksForHost {
        #[arg(long = "host-id")]
        host_id: i64,
    },

    /// Create the global pack if it does not exist
    EnsureGlobalPack,

    /// Create or repair the pack for a team
    EnsureTeamPack {
        #[arg(long = "team-id")]
        team_id: i64,
    },

    /// Rename system packs that still carry legacy names and prune orphaned stats
    MigrateData,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), FleetPackError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "fleetpack").ok_or_else(|| {
            FleetPackError::Error("Could not determine project directories".to_string())
        })?;

        let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));
        let _logger = setup_logging(&project_dirs, &config.logging)?;
        debug!("Command: {:?}", args.command);

        let db_path = config.database.db_path(Some(&project_dirs));
        let db = Database::open(&db_path, &config.database)?;

        Self::run(&db, args.command)
    }

    pub fn run(db: &Database, command: Command) -> Result<(), FleetPackError> {
        match command {
            Command::ApplyQueries { file, author_id } => {
                let queries: Vec<Query> = read_documents(&file, "queries")?;
                Queries::apply_queries(db, author_id, &queries)?;
                println!("Applied {} queries", queries.len());
            }
            Command::ApplyPacks { file } => {
                let specs: Vec<PackSpec> = read_documents(&file, "packs")?;
                PackSpecs::apply_pack_specs(db, &specs)?;
                println!("Applied {} packs", specs.len());
            }
            Command::GetPacks { name } => match name {
                Some(name) => print_json(&PackSpecs::get_pack_spec(db, &name)?)?,
                None => print_json(&PackSpecs::get_pack_specs(db)?)?,
            },
            Command::ListPacks { include_system } => {
                let packs = Packs::list_packs(
                    db,
                    &PackListOptions {
                        include_system_packs: include_system,
                    },
                )?;
                print_json(&packs)?;
            }
            Command::PacksForHost { host_id } => {
                print_json(&Membership::list_packs_for_host(db, host_id)?)?;
            }
            Command::EnsureGlobalPack => {
                print_json(&SystemPacks::ensure_global_pack(db)?)?;
            }
            Command::EnsureTeamPack { team_id } => {
                print_json(&SystemPacks::ensure_team_pack(db, team_id)?)?;
            }
            Command::MigrateData => {
                let renamed = SystemPacks::migrate_data(db)?;
                let pruned = ExecutionStats::prune_orphaned_stats(db)?;
                info!("Data migration renamed {} packs, pruned {} stats rows", renamed, pruned);
                println!("Renamed {} packs", renamed);
                println!("Pruned {} stats rows", pruned);
            }
        }
        Ok(())
    }
}

/// Reads a list of documents. `.toml` files hold them as an array of tables
/// under `key`; anything else is read as a JSON array.
fn read_documents<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Vec<T>, FleetPackError> {
    let text = fs::read_to_string(path)?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => {
            let mut table: toml::Table = toml::from_str(&text)
                .map_err(|e| FleetPackError::Error(format!("{}: {}", path.display(), e)))?;
            match table.remove(key) {
                Some(value) => value
                    .try_into()
                    .map_err(|e| FleetPackError::Error(format!("{}: {}", path.display(), e))),
                None => Ok(Vec::new()),
            }
        }
        _ => Ok(serde_json::from_str(&text)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), FleetPackError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
