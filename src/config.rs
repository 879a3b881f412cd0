use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub fleetpack: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const FLEETPACK_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            fleetpack: Self::FLEETPACK_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.fleetpack.clone();
        self.fleetpack = self.fleetpack.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.fleetpack.as_str()) {
            eprintln!(
                "Config error: fleetpack log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::FLEETPACK_LEVEL
            );
            self.fleetpack = Self::FLEETPACK_LEVEL.to_owned();
        }
    }

    /// flexi_logger spec string, e.g. "info" or "debug"
    pub fn log_spec(&self) -> String {
        format!("fleetpack={}", self.fleetpack)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Directory holding the database file. Empty means the project data dir.
    pub dir: String,
    pool_size: u32,
    busy_timeout_ms: u64,
}

impl DatabaseConfig {
    const DB_FILENAME: &str = "fleetpack.db";
    const POOL_SIZE: u32 = 8;
    const BUSY_TIMEOUT_MS: u64 = 5_000;

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms
    }

    pub fn db_path(&self, project_dirs: Option<&ProjectDirs>) -> PathBuf {
        if self.dir.is_empty() {
            match project_dirs {
                Some(dirs) => dirs.data_local_dir().join(Self::DB_FILENAME),
                None => PathBuf::from(Self::DB_FILENAME),
            }
        } else {
            Path::new(&self.dir).join(Self::DB_FILENAME)
        }
    }

    fn default() -> Self {
        DatabaseConfig {
            dir: String::new(),
            pool_size: Self::POOL_SIZE,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!(
                "Config error: database pool_size of 0 is invalid - using default of '{}'",
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
        self.dir = self.dir.trim().to_owned();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's data directory,
    /// then applies `FLEETPACK_` environment overrides (e.g. `FLEETPACK_DATABASE__DIR`).
    /// If the file is missing it is written with defaults; if it fails to parse,
    /// defaults are used.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let default_config = Config::default();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        Self::from_figment(Self::figment(&config_path))
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("FLEETPACK_").split("__"))
    }

    fn from_figment(figment: Figment) -> Self {
        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!("Could not load configuration: {}. Using default configuration.", err);
            Config::default()
        });

        config.ensure_valid();
        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
    }

    /// Returns the global config, falling back to defaults if it was never set.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }
}
