use std::collections::HashMap;

use log::info;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::database::{now, placeholders, Database};
use crate::error::{is_unique_violation, FleetPackError, ResultExt};
use crate::list_options::ListOptions;

pub(crate) const PACK_COLUMNS: &str =
    "p.pack_id, p.name, p.description, p.platform, p.disabled, p.pack_type, p.created_at, p.updated_at";

/// A named collection of scheduled queries plus the targets that decide which
/// hosts receive it. `pack_type` is `None` for user packs and carries the
/// scope tag (`global`, `team-<id>`) for system packs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    pub pack_id: i64,
    pub name: String,
    pub description: String,
    pub platform: String,
    pub disabled: bool,
    pub pack_type: Option<String>,
    pub label_ids: Vec<i64>,
    pub host_ids: Vec<i64>,
    pub team_ids: Vec<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Pack {
    pub fn is_system(&self) -> bool {
        self.pack_type.is_some()
    }

    /// Maps a row selected with `PACK_COLUMNS`. Targets are left empty.
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Pack {
            pack_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            platform: row.get(3)?,
            disabled: row.get(4)?,
            pack_type: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            ..Default::default()
        })
    }
}

/// The pack fields attached to a query listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSummary {
    pub pack_id: i64,
    pub name: String,
    pub pack_type: Option<String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackListOptions {
    pub include_system_packs: bool,
}

/// A query bound into a pack with its per-entry overrides. Optional fields are
/// `None` when they were never set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledQuery {
    pub scheduled_query_id: i64,
    pub pack_id: i64,
    pub query_id: i64,
    pub query_name: String,
    pub name: String,
    pub description: String,
    pub interval: u32,
    pub snapshot: Option<bool>,
    pub removed: Option<bool>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub shard: Option<u32>,
    pub denylist: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetKind {
    Label,
    Host,
    Team,
}

impl TargetKind {
    pub(crate) const ALL: [TargetKind; 3] = [TargetKind::Label, TargetKind::Host, TargetKind::Team];

    pub(crate) fn table(self) -> &'static str {
        match self {
            TargetKind::Label => "pack_labels",
            TargetKind::Host => "pack_hosts",
            TargetKind::Team => "pack_teams",
        }
    }

    pub(crate) fn column(self) -> &'static str {
        match self {
            TargetKind::Label => "label_id",
            TargetKind::Host => "host_id",
            TargetKind::Team => "team_id",
        }
    }

    fn ids_mut(self, pack: &mut Pack) -> &mut Vec<i64> {
        match self {
            TargetKind::Label => &mut pack.label_ids,
            TargetKind::Host => &mut pack.host_ids,
            TargetKind::Team => &mut pack.team_ids,
        }
    }

    fn ids(self, pack: &Pack) -> &[i64] {
        match self {
            TargetKind::Label => &pack.label_ids,
            TargetKind::Host => &pack.host_ids,
            TargetKind::Team => &pack.team_ids,
        }
    }
}

pub struct Packs;

impl Packs {
    /// Creates a user pack. System packs only come from `SystemPacks`.
    pub fn new_pack(db: &Database, pack: &Pack) -> Result<Pack, FleetPackError> {
        if pack.name.is_empty() {
            return Err(FleetPackError::empty_name("pack"));
        }
        if pack.pack_type.is_some() {
            return Err(FleetPackError::Validation {
                name: pack.name.clone(),
                message: format!("cannot create system pack '{}'", pack.name),
            });
        }

        let pack_id = db
            .write("new pack", |c| {
                let pack_id = Self::insert_pack_row(c, pack)?;
                for kind in TargetKind::ALL {
                    db.check_deadline("new pack")?;
                    Self::replace_targets(c, pack_id, kind, kind.ids(pack))?;
                }
                Ok(pack_id)
            })
            .context("creating pack")?;

        info!("Created pack '{}' ({})", pack.name, pack_id);
        Self::pack(db, pack_id)
    }

    /// Updates the pack row and fully replaces its targets. System packs are
    /// read-only here.
    pub fn save_pack(db: &Database, pack: &Pack) -> Result<(), FleetPackError> {
        if pack.name.is_empty() {
            return Err(FleetPackError::empty_name("pack"));
        }

        db.write("save pack", |c| {
            let stored: Option<(String, Option<String>)> = c
                .query_row(
                    "SELECT name, pack_type FROM packs WHERE pack_id = ?",
                    [pack.pack_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match stored {
                None => return Err(FleetPackError::not_found_id("Pack", pack.pack_id)),
                Some((name, Some(_))) => {
                    return Err(FleetPackError::Validation {
                        message: format!("pack '{}' is a system pack", name),
                        name,
                    })
                }
                Some(_) => {}
            }

            let rows = c
                .execute(
                    "UPDATE packs SET name = ?, description = ?, platform = ?, disabled = ?, updated_at = ?
                     WHERE pack_id = ?",
                    params![
                        pack.name,
                        pack.description,
                        pack.platform,
                        pack.disabled,
                        now(),
                        pack.pack_id
                    ],
                )
                .map_err(|e| Self::map_unique(e, &pack.name))?;
            if rows == 0 {
                return Err(FleetPackError::not_found_id("Pack", pack.pack_id));
            }
            for kind in TargetKind::ALL {
                db.check_deadline("save pack")?;
                Self::replace_targets(c, pack.pack_id, kind, kind.ids(pack))?;
            }
            Ok(())
        })
        .context("saving pack")
    }

    pub fn pack(db: &Database, pack_id: i64) -> Result<Pack, FleetPackError> {
        db.check_deadline("get pack")?;
        let conn = db.get_connection()?;
        Self::get_by_id(&conn, pack_id)?.ok_or_else(|| FleetPackError::not_found_id("Pack", pack_id))
    }

    pub fn pack_by_name(db: &Database, name: &str) -> Result<Option<Pack>, FleetPackError> {
        db.check_deadline("get pack by name")?;
        let conn = db.get_connection()?;
        let sql = format!("SELECT {} FROM packs p WHERE p.name = ?", PACK_COLUMNS);
        let pack = conn
            .query_row(&sql, [name], Pack::from_row)
            .optional()
            .context("selecting pack by name")?;
        Self::with_targets(&conn, pack)
    }

    pub fn delete_pack(db: &Database, name: &str) -> Result<(), FleetPackError> {
        let conn = db.get_connection()?;
        let rows = conn
            .execute("DELETE FROM packs WHERE name = ?", [name])
            .context("deleting pack")?;
        if rows == 0 {
            return Err(FleetPackError::not_found_name("Pack", name));
        }
        info!("Deleted pack '{}'", name);
        Ok(())
    }

    /// All packs ordered by id. System packs are only included when asked for.
    pub fn list_packs(db: &Database, opts: &PackListOptions) -> Result<Vec<Pack>, FleetPackError> {
        db.check_deadline("list packs")?;
        let conn = db.get_connection()?;
        let filter = if opts.include_system_packs {
            ""
        } else {
            "WHERE p.pack_type IS NULL"
        };
        let sql = format!(
            "SELECT {} FROM packs p {} ORDER BY p.pack_id",
            PACK_COLUMNS, filter
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut packs = stmt
            .query_map([], Pack::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("listing packs")?;

        Self::load_targets(&conn, &mut packs)?;
        Ok(packs)
    }

    pub fn list_scheduled_queries_in_pack(
        db: &Database,
        pack_id: i64,
        opts: &ListOptions,
    ) -> Result<Vec<ScheduledQuery>, FleetPackError> {
        db.check_deadline("list scheduled queries in pack")?;
        let conn = db.get_connection()?;
        let sql = opts.append_to_sql(
            "SELECT sq.scheduled_query_id, sq.pack_id, sq.query_id, q.name, sq.name, sq.description,
                    sq.interval, sq.snapshot, sq.removed, sq.platform, sq.version, sq.shard, sq.denylist
             FROM scheduled_queries sq
             JOIN queries q ON q.query_id = sq.query_id
             WHERE sq.pack_id = ?",
            &[
                ("name", "sq.name"),
                ("query_name", "q.name"),
                ("interval", "sq.interval"),
            ],
            "sq.position",
        )?;

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([pack_id], |row| {
            Ok(ScheduledQuery {
                scheduled_query_id: row.get(0)?,
                pack_id: row.get(1)?,
                query_id: row.get(2)?,
                query_name: row.get(3)?,
                name: row.get(4)?,
                description: row.get(5)?,
                interval: row.get(6)?,
                snapshot: row.get(7)?,
                removed: row.get(8)?,
                platform: row.get(9)?,
                version: row.get(10)?,
                shard: row.get(11)?,
                denylist: row.get(12)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .context("listing scheduled queries in pack")
    }

    // ========================================
    // Primitives shared with the reconciler and system packs
    // ========================================

    pub(crate) fn insert_pack_row(conn: &Connection, pack: &Pack) -> Result<i64, FleetPackError> {
        let ts = now();
        conn.query_row(
            "INSERT INTO packs (name, description, platform, disabled, pack_type, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING pack_id",
            params![
                pack.name,
                pack.description,
                pack.platform,
                pack.disabled,
                pack.pack_type,
                ts,
                ts
            ],
            |row| row.get(0),
        )
        .map_err(|e| Self::map_unique(e, &pack.name))
    }

    /// Replaces one target set of a pack. `ids` order is kept.
    pub(crate) fn replace_targets(
        conn: &Connection,
        pack_id: i64,
        kind: TargetKind,
        ids: &[i64],
    ) -> Result<(), FleetPackError> {
        conn.execute(
            &format!("DELETE FROM {} WHERE pack_id = ?", kind.table()),
            [pack_id],
        )?;

        if ids.is_empty() {
            return Ok(());
        }

        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} (pack_id, {}, position) VALUES (?, ?, ?)",
            kind.table(),
            kind.column()
        ))?;
        for (position, id) in ids.iter().enumerate() {
            stmt.execute(params![pack_id, id, position as i64])?;
        }
        Ok(())
    }

    pub(crate) fn rename(conn: &Connection, pack_id: i64, name: &str) -> Result<(), FleetPackError> {
        let rows = conn
            .execute(
                "UPDATE packs SET name = ?, updated_at = ? WHERE pack_id = ?",
                params![name, now(), pack_id],
            )
            .map_err(|e| Self::map_unique(e, name))?;
        if rows == 0 {
            return Err(FleetPackError::not_found_id("Pack", pack_id));
        }
        Ok(())
    }

    pub(crate) fn get_by_id(conn: &Connection, pack_id: i64) -> Result<Option<Pack>, FleetPackError> {
        let sql = format!("SELECT {} FROM packs p WHERE p.pack_id = ?", PACK_COLUMNS);
        let pack = conn
            .query_row(&sql, [pack_id], Pack::from_row)
            .optional()
            .context("selecting pack")?;
        Self::with_targets(conn, pack)
    }

    pub(crate) fn get_by_type(
        conn: &Connection,
        pack_type: &str,
    ) -> Result<Option<Pack>, FleetPackError> {
        let sql = format!("SELECT {} FROM packs p WHERE p.pack_type = ?", PACK_COLUMNS);
        let pack = conn
            .query_row(&sql, [pack_type], Pack::from_row)
            .optional()
            .context("selecting pack by type")?;
        Self::with_targets(conn, pack)
    }

    fn with_targets(conn: &Connection, pack: Option<Pack>) -> Result<Option<Pack>, FleetPackError> {
        match pack {
            Some(pack) => {
                let mut packs = [pack];
                Self::load_targets(conn, &mut packs)?;
                let [pack] = packs;
                Ok(Some(pack))
            }
            None => Ok(None),
        }
    }

    /// Fills in the target sets of `packs` with one query per target kind.
    pub(crate) fn load_targets(conn: &Connection, packs: &mut [Pack]) -> Result<(), FleetPackError> {
        if packs.is_empty() {
            return Ok(());
        }

        let index: HashMap<i64, usize> = packs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.pack_id, i))
            .collect();
        let pack_ids: Vec<i64> = packs.iter().map(|p| p.pack_id).collect();

        for kind in TargetKind::ALL {
            let sql = format!(
                "SELECT pack_id, {} FROM {} WHERE pack_id IN ({}) ORDER BY pack_id, position",
                kind.column(),
                kind.table(),
                placeholders(pack_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(pack_ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;

            for row in rows {
                let (pack_id, target_id) = row.context("loading pack targets")?;
                if let Some(&i) = index.get(&pack_id) {
                    kind.ids_mut(&mut packs[i]).push(target_id);
                }
            }
        }

        Ok(())
    }

    fn map_unique(e: rusqlite::Error, name: &str) -> FleetPackError {
        if is_unique_violation(&e) {
            FleetPackError::AlreadyExists {
                entity: "Pack",
                name: name.to_owned(),
            }
        } else {
            FleetPackError::DatabaseError(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_db;
    use crate::directory::{Hosts, LabelSpec, Labels, Teams};
    use crate::system_packs::{SystemPacks, GLOBAL_PACK_TYPE};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn seed_targets(db: &Database) -> (Vec<i64>, i64, i64) {
        Labels::apply_label_specs(
            db,
            &["l1", "l2", "l3"]
                .iter()
                .map(|n| LabelSpec {
                    name: n.to_string(),
                    ..Default::default()
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let labels =
            Labels::label_ids_by_name(db, &["l1".into(), "l2".into(), "l3".into()]).unwrap();
        let team = Teams::new_team(db, "team1").unwrap();
        let host = Hosts::new_host(db, "h1.local", None).unwrap();
        (labels, team.team_id, host.host_id)
    }

    #[test]
    fn test_new_and_save_pack() {
        let (_dir, db) = test_db();
        let (labels, team_id, host_id) = seed_targets(&db);

        let pack = Packs::new_pack(
            &db,
            &Pack {
                name: "foo".into(),
                host_ids: vec![host_id],
                label_ids: vec![labels[0]],
                team_ids: vec![team_id],
                ..Default::default()
            },
        )
        .unwrap();
        assert_ne!(pack.pack_id, 0);
        assert_eq!(pack.label_ids, vec![labels[0]]);
        assert_eq!(pack.host_ids, vec![host_id]);
        assert_eq!(pack.team_ids, vec![team_id]);

        let updated = Pack {
            name: "bar".into(),
            host_ids: vec![],
            label_ids: vec![labels[2], labels[1]],
            team_ids: vec![],
            ..pack.clone()
        };
        Packs::save_pack(&db, &updated).unwrap();

        let reloaded = Packs::pack(&db, pack.pack_id).unwrap();
        assert_eq!(reloaded.name, "bar");
        assert_eq!(reloaded.label_ids, vec![labels[2], labels[1]]);
        assert!(reloaded.host_ids.is_empty());
        assert!(reloaded.team_ids.is_empty());
    }

    #[test]
    fn test_save_missing_pack_is_not_found() {
        let (_dir, db) = test_db();
        let err = Packs::save_pack(
            &db,
            &Pack {
                pack_id: 42,
                name: "ghost".into(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_pack_by_name_and_delete() {
        let (_dir, db) = test_db();
        let pack = Packs::new_pack(
            &db,
            &Pack {
                name: "foo".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let found = Packs::pack_by_name(&db, "foo").unwrap();
        assert_eq!(found.map(|p| p.pack_id), Some(pack.pack_id));
        assert!(Packs::pack_by_name(&db, "bar").unwrap().is_none());

        assert!(Packs::new_pack(&db, &pack).unwrap_err().is_already_exists());

        Packs::delete_pack(&db, "foo").unwrap();
        assert!(Packs::pack(&db, pack.pack_id).unwrap_err().is_not_found());
        assert!(Packs::delete_pack(&db, "foo").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_packs_filters_system_packs() {
        let (_dir, db) = test_db();
        Packs::new_pack(
            &db,
            &Pack {
                name: "user".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let conn = db.get_connection().unwrap();
        Packs::insert_pack_row(
            &conn,
            &Pack {
                name: "system".into(),
                pack_type: Some("global".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let user_only = Packs::list_packs(&db, &PackListOptions::default()).unwrap();
        assert_eq!(user_only.len(), 1);
        assert_eq!(user_only[0].name, "user");

        let all = Packs::list_packs(
            &db,
            &PackListOptions {
                include_system_packs: true,
            },
        )
        .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[1].is_system());
    }

    #[test]
    fn test_system_packs_are_read_only() {
        let (_dir, db) = test_db();
        let global = SystemPacks::ensure_global_pack(&db).unwrap();

        let err = Packs::save_pack(
            &db,
            &Pack {
                name: "renamed".into(),
                disabled: true,
                ..global.clone()
            },
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(Packs::pack(&db, global.pack_id).unwrap(), global);
        assert_eq!(SystemPacks::ensure_global_pack(&db).unwrap(), global);

        let err = Packs::new_pack(
            &db,
            &Pack {
                name: "Fake Global".into(),
                pack_type: Some(GLOBAL_PACK_TYPE.into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert!(Packs::pack_by_name(&db, "Fake Global").unwrap().is_none());
    }

    #[test]
    fn test_reads_respect_deadline() {
        let (_dir, db) = test_db();
        let pack = Packs::new_pack(
            &db,
            &Pack {
                name: "p".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let bounded = db.with_timeout(Duration::ZERO);
        let expired = |err: FleetPackError| {
            matches!(err.root(), FleetPackError::DeadlineExceeded { .. })
        };
        assert!(expired(Packs::pack(&bounded, pack.pack_id).unwrap_err()));
        assert!(expired(Packs::pack_by_name(&bounded, "p").unwrap_err()));
        assert!(expired(
            Packs::list_packs(&bounded, &PackListOptions::default()).unwrap_err()
        ));
        assert!(expired(
            Packs::list_scheduled_queries_in_pack(&bounded, pack.pack_id, &ListOptions::default())
                .unwrap_err()
        ));
    }
}
