//! Persisted stand-ins for the collaborators the core reads from: query
//! authors, the label directory and its per-host evaluation feed, teams and
//! hosts. The reconciler and the membership resolver only use the lookup and
//! snapshot reads here.

use std::collections::HashMap;

use log::debug;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::database::{placeholders, Database};
use crate::error::{is_unique_violation, FleetPackError, ResultExt};

/// Label every host belongs to; the global pack targets it.
pub const ALL_HOSTS_LABEL: &str = "All Hosts";

/// Resolves `names` against `table.name_col`, returning name → id for the
/// names that exist. `table`, `id_col` and `name_col` are internal constants.
fn ids_by_name(
    conn: &Connection,
    table: &str,
    id_col: &str,
    name_col: &str,
    names: &[String],
) -> Result<HashMap<String, i64>, FleetPackError> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        "SELECT {}, {} FROM {} WHERE {} IN ({})",
        name_col,
        id_col,
        table,
        name_col,
        placeholders(names.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(names.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    rows.collect::<Result<HashMap<_, _>, _>>()
        .map_err(FleetPackError::DatabaseError)
}

// ========================================
// Users
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub name: String,
    pub email: String,
}

pub struct Users;

impl Users {
    pub fn new_user(db: &Database, name: &str, email: &str) -> Result<User, FleetPackError> {
        let conn = db.get_connection()?;
        let user_id: i64 = conn
            .query_row(
                "INSERT INTO users (name, email) VALUES (?, ?) RETURNING user_id",
                params![name, email],
                |row| row.get(0),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    FleetPackError::AlreadyExists {
                        entity: "User",
                        name: email.to_owned(),
                    }
                } else {
                    FleetPackError::DatabaseError(e)
                }
            })
            .context("creating user")?;

        Ok(User {
            user_id,
            name: name.to_owned(),
            email: email.to_owned(),
        })
    }

    pub fn delete_user(db: &Database, user_id: i64) -> Result<(), FleetPackError> {
        let conn = db.get_connection()?;
        let rows = conn
            .execute("DELETE FROM users WHERE user_id = ?", [user_id])
            .context("deleting user")?;
        if rows == 0 {
            return Err(FleetPackError::not_found_id("User", user_id));
        }
        Ok(())
    }
}

// ========================================
// Labels and the evaluation feed
// ========================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub query: String,
}

pub struct Labels;

impl Labels {
    /// Upserts labels by name in one transaction.
    pub fn apply_label_specs(db: &Database, specs: &[LabelSpec]) -> Result<(), FleetPackError> {
        db.write("apply label specs", |c| {
            let mut stmt = c.prepare(
                "INSERT INTO labels (name, description, query) VALUES (?, ?, ?)
                 ON CONFLICT (name) DO UPDATE SET
                    description = excluded.description,
                    query = excluded.query",
            )?;
            for spec in specs {
                if spec.name.is_empty() {
                    return Err(FleetPackError::empty_name("label"));
                }
                db.check_deadline("apply label specs")?;
                stmt.execute(params![spec.name, spec.description, spec.query])?;
            }
            Ok(())
        })
        .context("applying label specs")
    }

    /// Ids of the named labels, in input order. Names that do not exist are skipped.
    pub fn label_ids_by_name(db: &Database, names: &[String]) -> Result<Vec<i64>, FleetPackError> {
        let conn = db.get_connection()?;
        let found = Self::ids_by_name(&conn, names)?;
        Ok(names.iter().filter_map(|n| found.get(n).copied()).collect())
    }

    pub(crate) fn ids_by_name(
        conn: &Connection,
        names: &[String],
    ) -> Result<HashMap<String, i64>, FleetPackError> {
        ids_by_name(conn, "labels", "label_id", "name", names).context("resolving label names")
    }

    /// Records the latest evaluation results for `host_id`.
    ///
    /// `Some(b)` stores the result; `None` resets the label to "unknown" for
    /// this host by removing any earlier result.
    pub fn record_label_query_executions(
        db: &Database,
        host_id: i64,
        results: &HashMap<i64, Option<bool>>,
        updated_at: i64,
    ) -> Result<(), FleetPackError> {
        db.write("record label executions", |c| {
            let mut upsert = c.prepare(
                "INSERT INTO label_evaluations (host_id, label_id, matches, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (host_id, label_id) DO UPDATE SET
                    matches = excluded.matches,
                    updated_at = excluded.updated_at",
            )?;
            let mut clear =
                c.prepare("DELETE FROM label_evaluations WHERE host_id = ? AND label_id = ?")?;

            for (label_id, result) in results {
                match result {
                    Some(matches) => {
                        upsert.execute(params![host_id, label_id, matches, updated_at])?;
                    }
                    None => {
                        clear.execute(params![host_id, label_id])?;
                    }
                }
            }
            Ok(())
        })
        .context("recording label query executions")?;

        debug!(
            "Recorded {} label results for host {}",
            results.len(),
            host_id
        );
        Ok(())
    }

    /// Latest recorded result; `None` when the label has not been evaluated on the host.
    pub fn label_evaluation(
        db: &Database,
        host_id: i64,
        label_id: i64,
    ) -> Result<Option<bool>, FleetPackError> {
        let conn = db.get_connection()?;
        conn.query_row(
            "SELECT matches FROM label_evaluations WHERE host_id = ? AND label_id = ?",
            [host_id, label_id],
            |row| row.get(0),
        )
        .optional()
        .context("reading label evaluation")
    }
}

// ========================================
// Teams
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub team_id: i64,
    pub name: String,
}

pub struct Teams;

impl Teams {
    pub fn new_team(db: &Database, name: &str) -> Result<Team, FleetPackError> {
        if name.is_empty() {
            return Err(FleetPackError::empty_name("team"));
        }
        let conn = db.get_connection()?;
        let team_id: i64 = conn
            .query_row(
                "INSERT INTO teams (name) VALUES (?) RETURNING team_id",
                [name],
                |row| row.get(0),
            )
            .map_err(|e| Self::map_unique(e, name))
            .context("creating team")?;

        Ok(Team {
            team_id,
            name: name.to_owned(),
        })
    }

    pub fn save_team(db: &Database, team: &Team) -> Result<Team, FleetPackError> {
        if team.name.is_empty() {
            return Err(FleetPackError::empty_name("team"));
        }
        let conn = db.get_connection()?;
        let rows = conn
            .execute(
                "UPDATE teams SET name = ? WHERE team_id = ?",
                params![team.name, team.team_id],
            )
            .map_err(|e| Self::map_unique(e, &team.name))
            .context("saving team")?;
        if rows == 0 {
            return Err(FleetPackError::not_found_id("Team", team.team_id));
        }
        Ok(team.clone())
    }

    pub fn team(db: &Database, team_id: i64) -> Result<Team, FleetPackError> {
        let conn = db.get_connection()?;
        Self::get_by_id(&conn, team_id)?.ok_or_else(|| FleetPackError::not_found_id("Team", team_id))
    }

    pub(crate) fn get_by_id(conn: &Connection, team_id: i64) -> Result<Option<Team>, FleetPackError> {
        conn.query_row(
            "SELECT team_id, name FROM teams WHERE team_id = ?",
            [team_id],
            |row| {
                Ok(Team {
                    team_id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()
        .context("selecting team")
    }

    pub(crate) fn ids_by_name(
        conn: &Connection,
        names: &[String],
    ) -> Result<HashMap<String, i64>, FleetPackError> {
        ids_by_name(conn, "teams", "team_id", "name", names).context("resolving team names")
    }

    fn map_unique(e: rusqlite::Error, name: &str) -> FleetPackError {
        if is_unique_violation(&e) {
            FleetPackError::AlreadyExists {
                entity: "Team",
                name: name.to_owned(),
            }
        } else {
            FleetPackError::DatabaseError(e)
        }
    }
}

// ========================================
// Hosts
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub host_id: i64,
    pub hostname: String,
    pub team_id: Option<i64>,
}

pub struct Hosts;

impl Hosts {
    pub fn new_host(
        db: &Database,
        hostname: &str,
        team_id: Option<i64>,
    ) -> Result<Host, FleetPackError> {
        if hostname.is_empty() {
            return Err(FleetPackError::empty_name("host"));
        }
        let conn = db.get_connection()?;
        let host_id: i64 = conn
            .query_row(
                "INSERT INTO hosts (hostname, team_id) VALUES (?, ?) RETURNING host_id",
                params![hostname, team_id],
                |row| row.get(0),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    FleetPackError::AlreadyExists {
                        entity: "Host",
                        name: hostname.to_owned(),
                    }
                } else {
                    FleetPackError::DatabaseError(e)
                }
            })
            .context("creating host")?;

        Ok(Host {
            host_id,
            hostname: hostname.to_owned(),
            team_id,
        })
    }

    pub fn host(db: &Database, host_id: i64) -> Result<Host, FleetPackError> {
        let conn = db.get_connection()?;
        conn.query_row(
            "SELECT host_id, hostname, team_id FROM hosts WHERE host_id = ?",
            [host_id],
            |row| {
                Ok(Host {
                    host_id: row.get(0)?,
                    hostname: row.get(1)?,
                    team_id: row.get(2)?,
                })
            },
        )
        .optional()
        .context("selecting host")?
        .ok_or_else(|| FleetPackError::not_found_id("Host", host_id))
    }

    pub fn set_host_team(
        db: &Database,
        host_id: i64,
        team_id: Option<i64>,
    ) -> Result<(), FleetPackError> {
        let conn = db.get_connection()?;
        let rows = conn
            .execute(
                "UPDATE hosts SET team_id = ? WHERE host_id = ?",
                params![team_id, host_id],
            )
            .context("setting host team")?;
        if rows == 0 {
            return Err(FleetPackError::not_found_id("Host", host_id));
        }
        Ok(())
    }

    pub(crate) fn ids_by_hostname(
        conn: &Connection,
        hostnames: &[String],
    ) -> Result<HashMap<String, i64>, FleetPackError> {
        ids_by_name(conn, "hosts", "host_id", "hostname", hostnames).context("resolving hostnames")
    }
}
