//! Declarative pack documents and their reconciliation into stored packs.
//!
//! Applying a batch happens in two phases. Every name in every spec is first
//! resolved to an id with plain reads; any unresolved or duplicated name
//! rejects the batch before a write transaction is opened. The second phase is
//! a single immediate transaction of short statements. It resolves the names
//! again under the lock, upserts each pack, replaces its targets and reconciles
//! its entries in place, keyed by display name. An entry that keeps its name
//! and its query keeps its id and statistics.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{info, Level};
use logging_timer::timer;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::database::{now, placeholders, Database};
use crate::directory::{Hosts, Labels, Teams};
use crate::error::{FleetPackError, ResultExt};
use crate::packs::{Packs, TargetKind};
use crate::queries::Queries;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub targets: PackSpecTargets,
    #[serde(default)]
    pub queries: Vec<PackSpecQuery>,
}

/// Targets by name: label names, team names and hostnames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpecTargets {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// One scheduled entry. `name` defaults to `query_name` when blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpecQuery {
    #[serde(alias = "query")]
    pub query_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denylist: Option<bool>,
}

impl PackSpecQuery {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.query_name
        } else {
            &self.name
        }
    }
}

struct ResolvedEntry<'a> {
    query_id: i64,
    entry: &'a PackSpecQuery,
}

struct ResolvedSpec<'a> {
    spec: &'a PackSpec,
    label_ids: Vec<i64>,
    team_ids: Vec<i64>,
    host_ids: Vec<i64>,
    entries: Vec<ResolvedEntry<'a>>,
}

impl ResolvedSpec<'_> {
    fn target_ids(&self, kind: TargetKind) -> &[i64] {
        match kind {
            TargetKind::Label => &self.label_ids,
            TargetKind::Host => &self.host_ids,
            TargetKind::Team => &self.team_ids,
        }
    }
}

/// Name lookups for every spec in a batch, each done with a single query.
struct NameIndex {
    labels: HashMap<String, i64>,
    teams: HashMap<String, i64>,
    hosts: HashMap<String, i64>,
    queries: HashMap<String, i64>,
    system_packs: HashSet<String>,
}

impl NameIndex {
    fn load(conn: &Connection, specs: &[PackSpec]) -> Result<Self, FleetPackError> {
        fn distinct<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
            names.cloned().collect::<BTreeSet<_>>().into_iter().collect()
        }

        let labels = distinct(specs.iter().flat_map(|s| s.targets.labels.iter()));
        let teams = distinct(specs.iter().flat_map(|s| s.targets.teams.iter()));
        let hosts = distinct(specs.iter().flat_map(|s| s.targets.hosts.iter()));
        let queries = distinct(specs.iter().flat_map(|s| s.queries.iter().map(|q| &q.query_name)));
        let packs = distinct(specs.iter().map(|s| &s.name));

        Ok(NameIndex {
            labels: Labels::ids_by_name(conn, &labels)?,
            teams: Teams::ids_by_name(conn, &teams)?,
            hosts: Hosts::ids_by_hostname(conn, &hosts)?,
            queries: Queries::saved_ids_by_name(conn, &queries)?,
            system_packs: system_pack_names(conn, &packs)?,
        })
    }
}

fn system_pack_names(conn: &Connection, names: &[String]) -> Result<HashSet<String>, FleetPackError> {
    if names.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!(
        "SELECT name FROM packs WHERE pack_type IS NOT NULL AND name IN ({})",
        placeholders(names.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(names.iter()), |row| row.get::<_, String>(0))?;
    rows.collect::<Result<HashSet<_>, _>>()
        .context("resolving system pack names")
}

/// Maps `names` to ids in order. Unknown and repeated names are validation errors.
fn resolve_targets(
    kind: &str,
    names: &[String],
    found: &HashMap<String, i64>,
) -> Result<Vec<i64>, FleetPackError> {
    let mut seen = HashSet::with_capacity(names.len());
    names
        .iter()
        .map(|name| {
            if !seen.insert(name.as_str()) {
                return Err(FleetPackError::duplicate(kind, name));
            }
            found
                .get(name)
                .copied()
                .ok_or_else(|| FleetPackError::unknown(kind, name))
        })
        .collect()
}

pub struct PackSpecs;

impl PackSpecs {
    /// Applies `specs` as one unit: either every pack ends up matching its
    /// spec or nothing changes.
    pub fn apply_pack_specs(db: &Database, specs: &[PackSpec]) -> Result<(), FleetPackError> {
        let _tmr = timer!(Level::Trace; "PackSpecs::apply_pack_specs", "{} specs", specs.len());

        let mut conn = db.get_connection()?;
        // Reject bad batches before taking the write lock
        Self::resolve(&conn, specs)?;

        Self::apply_resolved(db, &mut conn, specs).context("applying pack specs")?;

        info!("Applied {} pack specs", specs.len());
        Ok(())
    }

    /// Write phase of `apply_pack_specs`. Names are resolved again under the
    /// write lock so a query or target deleted since the first resolution is
    /// reported as unknown instead of failing a foreign key.
    fn apply_resolved(
        db: &Database,
        conn: &mut Connection,
        specs: &[PackSpec],
    ) -> Result<(), FleetPackError> {
        db.immediate_transaction(conn, "apply pack specs", |c| {
            let resolved = Self::resolve(c, specs)?;
            for r in &resolved {
                db.check_deadline("apply pack specs")?;
                let pack_id = Self::upsert_pack_row(c, r.spec)?;

                for kind in TargetKind::ALL {
                    Packs::replace_targets(c, pack_id, kind, r.target_ids(kind))?;
                }

                Self::reconcile_entries(db, c, pack_id, &r.entries)?;
            }
            Ok(())
        })
    }

    pub fn get_pack_spec(db: &Database, name: &str) -> Result<PackSpec, FleetPackError> {
        db.check_deadline("get pack spec")?;
        let conn = db.get_connection()?;
        let row = conn
            .query_row(
                "SELECT pack_id, name, description, platform, disabled FROM packs WHERE name = ?",
                [name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        PackSpec {
                            name: row.get(1)?,
                            description: row.get(2)?,
                            platform: row.get(3)?,
                            disabled: row.get(4)?,
                            ..Default::default()
                        },
                    ))
                },
            )
            .optional()
            .context("selecting pack spec")?
            .ok_or_else(|| FleetPackError::not_found_name("Pack", name))?;

        let mut specs = [row];
        Self::load_spec_details(&conn, &mut specs)?;
        let [(_, spec)] = specs;
        Ok(spec)
    }

    /// Specs for every user pack, ordered by pack id. System packs are not
    /// managed through specs and are left out.
    pub fn get_pack_specs(db: &Database) -> Result<Vec<PackSpec>, FleetPackError> {
        let _tmr = timer!(Level::Trace; "PackSpecs::get_pack_specs");
        db.check_deadline("get pack specs")?;
        let conn = db.get_connection()?;

        let mut stmt = conn.prepare(
            "SELECT pack_id, name, description, platform, disabled FROM packs
             WHERE pack_type IS NULL
             ORDER BY pack_id",
        )?;
        let mut specs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    PackSpec {
                        name: row.get(1)?,
                        description: row.get(2)?,
                        platform: row.get(3)?,
                        disabled: row.get(4)?,
                        ..Default::default()
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("listing pack specs")?;

        Self::load_spec_details(&conn, &mut specs)?;
        Ok(specs.into_iter().map(|(_, spec)| spec).collect())
    }

    // ========================================
    // Resolution
    // ========================================

    fn resolve<'a>(
        conn: &Connection,
        specs: &'a [PackSpec],
    ) -> Result<Vec<ResolvedSpec<'a>>, FleetPackError> {
        let index = NameIndex::load(conn, specs)?;

        specs
            .iter()
            .map(|spec| {
                if spec.name.is_empty() {
                    return Err(FleetPackError::empty_name("pack"));
                }
                if index.system_packs.contains(&spec.name) {
                    return Err(FleetPackError::Validation {
                        name: spec.name.clone(),
                        message: format!("pack '{}' is a system pack", spec.name),
                    });
                }

                let label_ids = resolve_targets("label", &spec.targets.labels, &index.labels)?;
                let team_ids = resolve_targets("team", &spec.targets.teams, &index.teams)?;
                let host_ids = resolve_targets("host", &spec.targets.hosts, &index.hosts)?;

                let mut seen = HashSet::with_capacity(spec.queries.len());
                let entries = spec
                    .queries
                    .iter()
                    .map(|entry| {
                        let query_id = index
                            .queries
                            .get(&entry.query_name)
                            .copied()
                            .ok_or_else(|| FleetPackError::unknown("query", &entry.query_name))?;
                        if !seen.insert(entry.display_name()) {
                            return Err(FleetPackError::duplicate(
                                "scheduled query",
                                entry.display_name(),
                            ));
                        }
                        Ok(ResolvedEntry { query_id, entry })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(ResolvedSpec {
                    spec,
                    label_ids,
                    team_ids,
                    host_ids,
                    entries,
                })
            })
            .collect()
    }

    // ========================================
    // Writes (inside the apply transaction)
    // ========================================

    fn upsert_pack_row(conn: &Connection, spec: &PackSpec) -> Result<i64, FleetPackError> {
        let ts = now();
        conn.query_row(
            "INSERT INTO packs (name, description, platform, disabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET
                description = excluded.description,
                platform = excluded.platform,
                disabled = excluded.disabled,
                updated_at = excluded.updated_at
             WHERE packs.pack_type IS NULL
             RETURNING pack_id",
            params![spec.name, spec.description, spec.platform, spec.disabled, ts, ts],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| FleetPackError::Validation {
            name: spec.name.clone(),
            message: format!("pack '{}' is a system pack", spec.name),
        })
    }

    /// Deletes entries whose display name is gone or whose query changed,
    /// along with their statistics, then upserts the rest by (pack, display
    /// name) with their new positions. A retargeted entry is re-created under
    /// a new id so stats gathered for the old query never carry over.
    fn reconcile_entries(
        db: &Database,
        conn: &Connection,
        pack_id: i64,
        entries: &[ResolvedEntry],
    ) -> Result<(), FleetPackError> {
        let wanted: HashMap<&str, i64> = entries
            .iter()
            .map(|e| (e.entry.display_name(), e.query_id))
            .collect();

        let stale = {
            let mut stmt = conn.prepare(
                "SELECT scheduled_query_id, name, query_id FROM scheduled_queries WHERE pack_id = ?",
            )?;
            let rows = stmt.query_map([pack_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let mut stale = Vec::new();
            for row in rows {
                let (id, name, query_id) = row?;
                if wanted.get(name.as_str()) != Some(&query_id) {
                    stale.push(id);
                }
            }
            stale
        };

        let mut delete_entry =
            conn.prepare("DELETE FROM scheduled_queries WHERE scheduled_query_id = ?")?;
        let mut delete_stats =
            conn.prepare("DELETE FROM scheduled_query_stats WHERE scheduled_query_id = ?")?;
        for id in stale {
            delete_entry.execute([id])?;
            delete_stats.execute([id])?;
        }

        let mut upsert = conn.prepare(
            "INSERT INTO scheduled_queries
                (pack_id, query_id, name, description, position, interval,
                 snapshot, removed, platform, version, shard, denylist)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (pack_id, name) DO UPDATE SET
                description = excluded.description,
                position = excluded.position,
                interval = excluded.interval,
                snapshot = excluded.snapshot,
                removed = excluded.removed,
                platform = excluded.platform,
                version = excluded.version,
                shard = excluded.shard,
                denylist = excluded.denylist",
        )?;
        for (position, resolved) in entries.iter().enumerate() {
            db.check_deadline("apply pack specs")?;
            let e = resolved.entry;
            upsert.execute(params![
                pack_id,
                resolved.query_id,
                e.display_name(),
                e.description,
                position as i64,
                e.interval,
                e.snapshot,
                e.removed,
                e.platform,
                e.version,
                e.shard,
                e.denylist
            ])?;
        }

        Ok(())
    }

    // ========================================
    // Projection back to specs
    // ========================================

    /// Fills in targets and entries for each `(pack_id, spec)` in stored order.
    fn load_spec_details(
        conn: &Connection,
        specs: &mut [(i64, PackSpec)],
    ) -> Result<(), FleetPackError> {
        if specs.is_empty() {
            return Ok(());
        }

        let index: HashMap<i64, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, (pack_id, _))| (*pack_id, i))
            .collect();
        let pack_ids: Vec<i64> = specs.iter().map(|(pack_id, _)| *pack_id).collect();
        let in_list = placeholders(pack_ids.len());

        for (kind, table, name_col) in [
            (TargetKind::Label, "labels", "name"),
            (TargetKind::Team, "teams", "name"),
            (TargetKind::Host, "hosts", "hostname"),
        ] {
            let sql = format!(
                "SELECT t.pack_id, d.{name_col}
                 FROM {link} t
                 JOIN {table} d ON d.{col} = t.{col}
                 WHERE t.pack_id IN ({in_list})
                 ORDER BY t.pack_id, t.position",
                link = kind.table(),
                col = kind.column(),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(pack_ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (pack_id, name) = row.context("loading pack spec targets")?;
                if let Some(&i) = index.get(&pack_id) {
                    let targets = &mut specs[i].1.targets;
                    match kind {
                        TargetKind::Label => targets.labels.push(name),
                        TargetKind::Team => targets.teams.push(name),
                        TargetKind::Host => targets.hosts.push(name),
                    }
                }
            }
        }

        let sql = format!(
            "SELECT sq.pack_id, q.name, sq.name, sq.description, sq.interval,
                    sq.snapshot, sq.removed, sq.platform, sq.version, sq.shard, sq.denylist
             FROM scheduled_queries sq
             JOIN queries q ON q.query_id = sq.query_id
             WHERE sq.pack_id IN ({})
             ORDER BY sq.pack_id, sq.position",
            in_list
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(pack_ids.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                PackSpecQuery {
                    query_name: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    interval: row.get(4)?,
                    snapshot: row.get(5)?,
                    removed: row.get(6)?,
                    platform: row.get(7)?,
                    version: row.get(8)?,
                    shard: row.get(9)?,
                    denylist: row.get(10)?,
                },
            ))
        })?;

        for row in rows {
            let (pack_id, entry) = row.context("loading pack spec queries")?;
            if let Some(&i) = index.get(&pack_id) {
                specs[i].1.queries.push(entry);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_db;
    use crate::directory::LabelSpec;
    use crate::queries::Query;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    fn apply_queries(db: &Database, names: &[&str]) {
        let queries: Vec<Query> = names
            .iter()
            .map(|n| Query {
                name: n.to_string(),
                query: format!("select * from {}", n),
                ..Default::default()
            })
            .collect();
        Queries::apply_queries(db, None, &queries).unwrap();
    }

    fn apply_labels(db: &Database, names: &[&str]) {
        let specs: Vec<LabelSpec> = names
            .iter()
            .map(|n| LabelSpec {
                name: n.to_string(),
                ..Default::default()
            })
            .collect();
        Labels::apply_label_specs(db, &specs).unwrap();
    }

    fn entry(query_name: &str, name: &str, interval: u32) -> PackSpecQuery {
        PackSpecQuery {
            query_name: query_name.into(),
            name: name.into(),
            interval,
            ..Default::default()
        }
    }

    fn round_trip_specs() -> Vec<PackSpec> {
        vec![
            PackSpec {
                name: "test_pack".into(),
                targets: PackSpecTargets {
                    labels: vec!["foo".into(), "bar".into(), "bing".into()],
                    ..Default::default()
                },
                queries: vec![
                    PackSpecQuery {
                        description: "test_foo".into(),
                        ..entry("foo", "q0", 42)
                    },
                    PackSpecQuery {
                        snapshot: Some(true),
                        removed: Some(false),
                        ..entry("foo", "foo_snapshot", 600)
                    },
                    PackSpecQuery {
                        shard: Some(10),
                        platform: Some("darwin".into()),
                        version: Some("4.6.0".into()),
                        denylist: Some(false),
                        ..entry("bar", "q2", 90)
                    },
                ],
                ..Default::default()
            },
            PackSpec {
                name: "test_pack_disabled".into(),
                description: "disabled pack".into(),
                platform: "linux".into(),
                disabled: true,
                targets: PackSpecTargets {
                    labels: vec!["foo".into(), "bar".into(), "bing".into()],
                    ..Default::default()
                },
                queries: vec![entry("foo", "q0", 42), entry("bar", "q2", 90)],
            },
        ]
    }

    fn setup(db: &Database) {
        apply_queries(db, &["foo", "bar", "bing"]);
        apply_labels(db, &["foo", "bar", "bing"]);
    }

    fn entry_ids(db: &Database, pack_name: &str) -> Vec<(String, i64)> {
        let conn = db.get_connection().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT sq.name, sq.scheduled_query_id FROM scheduled_queries sq
                 JOIN packs p ON p.pack_id = sq.pack_id
                 WHERE p.name = ? ORDER BY sq.position",
            )
            .unwrap();
        let ids = stmt
            .query_map([pack_name], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        ids
    }

    #[test]
    fn test_pack_spec_round_trip() {
        let (_dir, db) = test_db();
        setup(&db);
        let expected = round_trip_specs();

        PackSpecs::apply_pack_specs(&db, &expected).unwrap();

        assert_eq!(PackSpecs::get_pack_specs(&db).unwrap(), expected);
        assert_eq!(
            PackSpecs::get_pack_spec(&db, "test_pack_disabled").unwrap(),
            expected[1]
        );
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (_dir, db) = test_db();
        setup(&db);
        let specs = round_trip_specs();

        PackSpecs::apply_pack_specs(&db, &specs).unwrap();
        let pack_id = Packs::pack_by_name(&db, "test_pack").unwrap().unwrap().pack_id;
        let ids = entry_ids(&db, "test_pack");

        PackSpecs::apply_pack_specs(&db, &specs).unwrap();
        assert_eq!(
            Packs::pack_by_name(&db, "test_pack").unwrap().unwrap().pack_id,
            pack_id
        );
        assert_eq!(entry_ids(&db, "test_pack"), ids);
        assert_eq!(PackSpecs::get_pack_specs(&db).unwrap(), specs);
    }

    #[test]
    fn test_reapply_replaces_targets_and_entries() {
        let (_dir, db) = test_db();
        setup(&db);
        let team = Teams::new_team(&db, "team1").unwrap();
        PackSpecs::apply_pack_specs(&db, &round_trip_specs()).unwrap();
        let before = entry_ids(&db, "test_pack");

        let updated = PackSpec {
            name: "test_pack".into(),
            targets: PackSpecTargets {
                labels: vec!["bing".into()],
                teams: vec![team.name.clone()],
                ..Default::default()
            },
            queries: vec![entry("bar", "q2", 120), entry("bing", "", 30)],
            ..Default::default()
        };
        PackSpecs::apply_pack_specs(&db, &[updated]).unwrap();

        let got = PackSpecs::get_pack_spec(&db, "test_pack").unwrap();
        assert_eq!(got.targets.labels, vec!["bing"]);
        assert_eq!(got.targets.teams, vec!["team1"]);
        assert_eq!(
            got.queries,
            vec![entry("bar", "q2", 120), entry("bing", "bing", 30)]
        );

        // q2 survived the rewrite and kept its id
        let after = entry_ids(&db, "test_pack");
        let q2_before = before.iter().find(|(n, _)| n == "q2").map(|(_, id)| *id);
        let q2_after = after.iter().find(|(n, _)| n == "q2").map(|(_, id)| *id);
        assert_eq!(q2_before, q2_after);

        let pack = Packs::pack_by_name(&db, "test_pack").unwrap().unwrap();
        assert_eq!(pack.team_ids, vec![team.team_id]);
    }

    #[test]
    fn test_blank_entry_name_defaults_to_query_name() {
        let (_dir, db) = test_db();
        setup(&db);
        PackSpecs::apply_pack_specs(
            &db,
            &[PackSpec {
                name: "p".into(),
                queries: vec![entry("foo", "", 60)],
                ..Default::default()
            }],
        )
        .unwrap();

        let spec = PackSpecs::get_pack_spec(&db, "p").unwrap();
        assert_eq!(spec.queries[0].name, "foo");
    }

    #[test]
    fn test_unknown_query_rejects_batch() {
        let (_dir, db) = test_db();
        setup(&db);

        Queries::delete_query(&db, "bar").unwrap();

        let specs = vec![
            PackSpec {
                name: "good".into(),
                queries: vec![entry("foo", "", 60)],
                ..Default::default()
            },
            PackSpec {
                name: "bad".into(),
                queries: vec![entry("foo", "", 60), entry("bar", "", 60)],
                ..Default::default()
            },
        ];
        let err = PackSpecs::apply_pack_specs(&db, &specs).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "unknown query 'bar'");

        // The valid spec before the failing one was not written either
        assert!(Packs::pack_by_name(&db, "good").unwrap().is_none());
        assert!(PackSpecs::get_pack_specs(&db).unwrap().is_empty());
    }

    #[test]
    fn test_unsaved_query_is_unknown() {
        let (_dir, db) = test_db();
        Queries::new_query(
            &db,
            &Query {
                name: "adhoc".into(),
                query: "select 1".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let err = PackSpecs::apply_pack_specs(
            &db,
            &[PackSpec {
                name: "p".into(),
                queries: vec![entry("adhoc", "", 60)],
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown query 'adhoc'");
    }

    #[test]
    fn test_unknown_targets_are_rejected() {
        let (_dir, db) = test_db();
        setup(&db);

        let with_targets = |targets: PackSpecTargets| PackSpec {
            name: "p".into(),
            targets,
            ..Default::default()
        };

        let err = PackSpecs::apply_pack_specs(
            &db,
            &[with_targets(PackSpecTargets {
                labels: vec!["foo".into(), "missing".into()],
                ..Default::default()
            })],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown label 'missing'");

        let err = PackSpecs::apply_pack_specs(
            &db,
            &[with_targets(PackSpecTargets {
                teams: vec!["nobody".into()],
                ..Default::default()
            })],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown team 'nobody'");

        let err = PackSpecs::apply_pack_specs(
            &db,
            &[with_targets(PackSpecTargets {
                hosts: vec!["ghost.local".into()],
                ..Default::default()
            })],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown host 'ghost.local'");

        assert!(Packs::pack_by_name(&db, "p").unwrap().is_none());
    }

    #[test]
    fn test_duplicates_within_spec_are_rejected() {
        let (_dir, db) = test_db();
        setup(&db);

        let err = PackSpecs::apply_pack_specs(
            &db,
            &[PackSpec {
                name: "p".into(),
                queries: vec![entry("foo", "same", 60), entry("bar", "same", 60)],
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "duplicate scheduled query 'same'");

        let err = PackSpecs::apply_pack_specs(
            &db,
            &[PackSpec {
                name: "p".into(),
                targets: PackSpecTargets {
                    labels: vec!["foo".into(), "foo".into()],
                    ..Default::default()
                },
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "duplicate label 'foo'");
    }

    #[test]
    fn test_empty_pack_name_is_rejected() {
        let (_dir, db) = test_db();
        let err = PackSpecs::apply_pack_specs(&db, &[PackSpec::default()]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_get_missing_pack_spec() {
        let (_dir, db) = test_db();
        let err = PackSpecs::get_pack_spec(&db, "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_expired_deadline_writes_nothing() {
        let (_dir, db) = test_db();
        setup(&db);

        let bounded = db.with_timeout(Duration::ZERO);
        let err = PackSpecs::apply_pack_specs(&bounded, &round_trip_specs()).unwrap_err();
        assert!(matches!(err.root(), FleetPackError::DeadlineExceeded { .. }));
        assert!(PackSpecs::get_pack_specs(&db).unwrap().is_empty());
    }

    #[test]
    fn test_retargeted_entry_is_recreated() {
        let (_dir, db) = test_db();
        setup(&db);
        let spec = |query: &str| PackSpec {
            name: "p".into(),
            queries: vec![entry(query, "uptime_check", 60), entry("bing", "", 30)],
            ..Default::default()
        };

        PackSpecs::apply_pack_specs(&db, &[spec("foo")]).unwrap();
        let before = entry_ids(&db, "p");

        PackSpecs::apply_pack_specs(&db, &[spec("bar")]).unwrap();
        let after = entry_ids(&db, "p");

        assert_eq!(after[0].0, "uptime_check");
        assert_ne!(after[0].1, before[0].1);
        // Same name and same query: untouched
        assert_eq!(after[1], before[1]);
        assert_eq!(
            PackSpecs::get_pack_spec(&db, "p").unwrap().queries[0].query_name,
            "bar"
        );
    }

    #[test]
    fn test_query_deleted_after_resolve_is_unknown() {
        let (_dir, db) = test_db();
        setup(&db);
        let specs = vec![PackSpec {
            name: "p".into(),
            queries: vec![entry("foo", "", 60)],
            ..Default::default()
        }];

        let mut conn = db.get_connection().unwrap();
        PackSpecs::resolve(&conn, &specs).unwrap();
        Queries::delete_query(&db, "foo").unwrap();

        let err = PackSpecs::apply_resolved(&db, &mut conn, &specs).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "unknown query 'foo'");
        assert!(Packs::pack_by_name(&db, "p").unwrap().is_none());
    }

    #[test]
    fn test_reads_respect_deadline() {
        let (_dir, db) = test_db();
        setup(&db);
        PackSpecs::apply_pack_specs(&db, &round_trip_specs()).unwrap();

        let bounded = db.with_timeout(Duration::ZERO);
        let err = PackSpecs::get_pack_specs(&bounded).unwrap_err();
        assert!(matches!(err.root(), FleetPackError::DeadlineExceeded { .. }));
        let err = PackSpecs::get_pack_spec(&bounded, "test_pack").unwrap_err();
        assert!(matches!(err.root(), FleetPackError::DeadlineExceeded { .. }));
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: PackSpec = serde_json::from_str(
            r#"{"name": "p", "targets": {"labels": ["All Hosts"]},
                "queries": [{"query": "foo", "interval": 60, "snapshot": true}]}"#,
        )
        .unwrap();
        assert_eq!(spec.targets.labels, vec!["All Hosts"]);
        assert_eq!(spec.queries[0].query_name, "foo");
        assert_eq!(spec.queries[0].display_name(), "foo");
        assert_eq!(spec.queries[0].snapshot, Some(true));
        assert_eq!(spec.queries[0].removed, None);
        assert!(!spec.disabled);
    }

    fn arb_entry() -> impl Strategy<Value = PackSpecQuery> {
        (
            0u32..86_400,
            proptest::option::of(any::<bool>()),
            proptest::option::of(any::<bool>()),
            proptest::option::of("[a-z]{1,8}"),
            proptest::option::of("[0-9]\\.[0-9]\\.[0-9]"),
            proptest::option::of(0u32..=100),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(
                |(interval, snapshot, removed, platform, version, shard, denylist)| PackSpecQuery {
                    query_name: "foo".into(),
                    name: String::new(),
                    description: String::new(),
                    interval,
                    snapshot,
                    removed,
                    platform,
                    version,
                    shard,
                    denylist,
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_optional_entry_fields_round_trip(entries in prop::collection::vec(arb_entry(), 1..5)) {
            let (_dir, db) = test_db();
            apply_queries(&db, &["foo"]);

            let queries: Vec<PackSpecQuery> = entries
                .into_iter()
                .enumerate()
                .map(|(i, e)| PackSpecQuery { name: format!("e{}", i), ..e })
                .collect();
            let spec = PackSpec {
                name: "p".into(),
                queries,
                ..Default::default()
            };

            PackSpecs::apply_pack_specs(&db, std::slice::from_ref(&spec)).unwrap();
            prop_assert_eq!(PackSpecs::get_pack_spec(&db, "p").unwrap(), spec);
        }
    }
}
