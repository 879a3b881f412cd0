use log::Level;
use logging_timer::timer;

use crate::database::Database;
use crate::directory::Hosts;
use crate::error::{FleetPackError, ResultExt};
use crate::packs::{Pack, Packs, PACK_COLUMNS};

pub struct Membership;

impl Membership {
    /// Enabled packs that apply to `host_id`, ordered by pack id.
    ///
    /// A pack applies when any of its labels currently evaluates true on the
    /// host, when it targets the host directly, or when it targets the host's
    /// team. A label with no recorded result never matches. Evaluated on every
    /// call against the latest recorded results.
    pub fn list_packs_for_host(db: &Database, host_id: i64) -> Result<Vec<Pack>, FleetPackError> {
        let _tmr = timer!(Level::Trace; "Membership::list_packs_for_host", "{}", host_id);
        db.check_deadline("list packs for host")?;

        // Fails with NotFound for an unknown host
        Hosts::host(db, host_id)?;

        let conn = db.get_connection()?;
        let sql = format!(
            "SELECT {} FROM packs p
             WHERE p.disabled = 0 AND (
                EXISTS (
                    SELECT 1 FROM pack_labels pl
                    JOIN label_evaluations le ON le.label_id = pl.label_id
                    WHERE pl.pack_id = p.pack_id AND le.host_id = ?1 AND le.matches = 1
                )
                OR EXISTS (
                    SELECT 1 FROM pack_hosts ph
                    WHERE ph.pack_id = p.pack_id AND ph.host_id = ?1
                )
                OR EXISTS (
                    SELECT 1 FROM pack_teams pt
                    JOIN hosts h ON h.team_id = pt.team_id
                    WHERE pt.pack_id = p.pack_id AND h.host_id = ?1
                )
             )
             ORDER BY p.pack_id",
            PACK_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut packs = stmt
            .query_map([host_id], Pack::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("listing packs for host")?;

        Packs::load_targets(&conn, &mut packs)?;
        Ok(packs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::now;
    use crate::database::test_support::test_db;
    use crate::directory::{LabelSpec, Labels, Teams};
    use crate::pack_specs::{PackSpec, PackSpecTargets, PackSpecs};
    use crate::system_packs::SystemPacks;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn labels(db: &Database, names: &[&str]) -> Vec<i64> {
        let specs: Vec<LabelSpec> = names
            .iter()
            .map(|n| LabelSpec {
                name: n.to_string(),
                ..Default::default()
            })
            .collect();
        Labels::apply_label_specs(db, &specs).unwrap();
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        Labels::label_ids_by_name(db, &names).unwrap()
    }

    fn label_pack(name: &str, labels: &[&str]) -> PackSpec {
        PackSpec {
            name: name.into(),
            targets: PackSpecTargets {
                labels: labels.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn record(db: &Database, host_id: i64, results: &[(i64, Option<bool>)]) {
        let results: HashMap<i64, Option<bool>> = results.iter().copied().collect();
        Labels::record_label_query_executions(db, host_id, &results, now()).unwrap();
    }

    fn pack_names(db: &Database, host_id: i64) -> Vec<String> {
        Membership::list_packs_for_host(db, host_id)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect()
    }

    #[test]
    fn test_label_membership_is_or() {
        let (_dir, db) = test_db();
        let ids = labels(&db, &["a", "b"]);
        let (a, b) = (ids[0], ids[1]);
        PackSpecs::apply_pack_specs(&db, &[label_pack("p", &["a", "b"])]).unwrap();
        let host = Hosts::new_host(&db, "h", None).unwrap().host_id;

        assert!(pack_names(&db, host).is_empty());

        record(&db, host, &[(a, Some(true))]);
        assert_eq!(pack_names(&db, host), vec!["p"]);

        record(&db, host, &[(a, Some(false)), (b, Some(true))]);
        assert_eq!(pack_names(&db, host), vec!["p"]);

        record(&db, host, &[(a, Some(true)), (b, Some(true))]);
        assert_eq!(pack_names(&db, host), vec!["p"]);

        record(&db, host, &[(b, Some(false))]);
        assert_eq!(pack_names(&db, host), vec!["p"]);

        record(&db, host, &[(a, Some(false))]);
        assert!(pack_names(&db, host).is_empty());
    }

    #[test]
    fn test_unknown_evaluation_does_not_match() {
        let (_dir, db) = test_db();
        let a = labels(&db, &["a"])[0];
        PackSpecs::apply_pack_specs(&db, &[label_pack("p", &["a"])]).unwrap();
        let host = Hosts::new_host(&db, "h", None).unwrap().host_id;

        record(&db, host, &[(a, Some(true))]);
        assert_eq!(pack_names(&db, host), vec!["p"]);

        record(&db, host, &[(a, None)]);
        assert!(pack_names(&db, host).is_empty());
    }

    #[test]
    fn test_foo_and_shmoo_packs() {
        let (_dir, db) = test_db();
        let ids = labels(&db, &["foo", "bar", "bing"]);
        let (foo, bar) = (ids[0], ids[1]);
        PackSpecs::apply_pack_specs(
            &db,
            &[
                label_pack("foo_pack", &["foo", "bar", "bing"]),
                label_pack("shmoo_pack", &["bar"]),
            ],
        )
        .unwrap();
        let h1 = Hosts::new_host(&db, "h1.local", None).unwrap().host_id;

        record(&db, h1, &[(foo, Some(true))]);
        assert_eq!(pack_names(&db, h1), vec!["foo_pack"]);

        record(&db, h1, &[(bar, Some(true))]);
        assert_eq!(pack_names(&db, h1), vec!["foo_pack", "shmoo_pack"]);

        record(&db, h1, &[(foo, Some(false))]);
        assert_eq!(pack_names(&db, h1), vec!["shmoo_pack"]);
    }

    #[test]
    fn test_host_and_team_targets() {
        let (_dir, db) = test_db();
        let team = Teams::new_team(&db, "team1").unwrap();
        let h1 = Hosts::new_host(&db, "h1.local", None).unwrap().host_id;
        let h2 = Hosts::new_host(&db, "h2.local", Some(team.team_id)).unwrap().host_id;

        PackSpecs::apply_pack_specs(
            &db,
            &[PackSpec {
                name: "direct".into(),
                targets: PackSpecTargets {
                    hosts: vec!["h1.local".into()],
                    ..Default::default()
                },
                ..Default::default()
            }],
        )
        .unwrap();
        let team_pack = SystemPacks::ensure_team_pack(&db, team.team_id).unwrap();

        assert_eq!(pack_names(&db, h1), vec!["direct"]);
        assert_eq!(pack_names(&db, h2), vec![team_pack.name.clone()]);

        Hosts::set_host_team(&db, h1, Some(team.team_id)).unwrap();
        assert_eq!(pack_names(&db, h1), vec!["direct".to_string(), team_pack.name]);
    }

    #[test]
    fn test_disabled_packs_are_excluded() {
        let (_dir, db) = test_db();
        let a = labels(&db, &["a"])[0];
        PackSpecs::apply_pack_specs(
            &db,
            &[PackSpec {
                disabled: true,
                ..label_pack("off", &["a"])
            }],
        )
        .unwrap();
        let host = Hosts::new_host(&db, "h", None).unwrap().host_id;
        record(&db, host, &[(a, Some(true))]);

        assert!(pack_names(&db, host).is_empty());
    }

    #[test]
    fn test_unknown_host_is_not_found() {
        let (_dir, db) = test_db();
        let err = Membership::list_packs_for_host(&db, 404).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_expired_deadline_is_reported() {
        let (_dir, db) = test_db();
        let host = Hosts::new_host(&db, "h", None).unwrap().host_id;

        let bounded = db.with_timeout(std::time::Duration::ZERO);
        let err = Membership::list_packs_for_host(&bounded, host).unwrap_err();
        assert!(matches!(err.root(), FleetPackError::DeadlineExceeded { .. }));
    }
}
