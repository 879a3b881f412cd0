use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetPackError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Bad input: empty or duplicate names, or a spec that references an unknown
    /// query, label, team or host. `name` is the offending name.
    #[error("{message}")]
    Validation { name: String, message: String },

    /// The addressed identifier or name does not exist (or no longer exists).
    #[error("{entity} {key} was not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} '{name}' already exists")]
    AlreadyExists { entity: &'static str, name: String },

    #[error("{operation}: deadline exceeded")]
    DeadlineExceeded { operation: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<FleetPackError>,
    },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl FleetPackError {
    pub fn unknown(kind: &str, name: &str) -> Self {
        FleetPackError::Validation {
            name: name.to_owned(),
            message: format!("unknown {} '{}'", kind, name),
        }
    }

    pub fn empty_name(kind: &str) -> Self {
        FleetPackError::Validation {
            name: String::new(),
            message: format!("{} name must not be empty", kind),
        }
    }

    pub fn duplicate(kind: &str, name: &str) -> Self {
        FleetPackError::Validation {
            name: name.to_owned(),
            message: format!("duplicate {} '{}'", kind, name),
        }
    }

    pub fn not_found_id(entity: &'static str, id: i64) -> Self {
        FleetPackError::NotFound {
            entity,
            key: format!("with id {}", id),
        }
    }

    pub fn not_found_name(entity: &'static str, name: &str) -> Self {
        FleetPackError::NotFound {
            entity,
            key: format!("'{}'", name),
        }
    }

    /// Strips `Context` layers to get at the classifying error.
    pub fn root(&self) -> &FleetPackError {
        match self {
            FleetPackError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), FleetPackError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root(), FleetPackError::Validation { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), FleetPackError::AlreadyExists { .. })
    }

    /// Classification errors are passed through untouched; only backend failures
    /// get the operation name wrapped around them.
    fn with_context(self, context: &str) -> Self {
        match self {
            FleetPackError::DatabaseError(_)
            | FleetPackError::PoolError(_)
            | FleetPackError::IoError(_) => FleetPackError::Context {
                context: context.to_owned(),
                source: Box::new(self),
            },
            other => other,
        }
    }
}

pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T, FleetPackError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<FleetPackError>,
{
    fn context(self, context: &str) -> Result<T, FleetPackError> {
        self.map_err(|e| e.into().with_context(context))
    }
}

/// True when `err` is a UNIQUE constraint violation.
pub fn is_unique_violation(err: &RusqliteError) -> bool {
    matches!(
        err,
        RusqliteError::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
