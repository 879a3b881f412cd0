use log::{info, warn};

use crate::database::Database;
use crate::directory::{Labels, Team, Teams, ALL_HOSTS_LABEL};
use crate::error::{FleetPackError, ResultExt};
use crate::packs::{Pack, Packs, TargetKind};

pub const GLOBAL_PACK_TYPE: &str = "global";
pub const GLOBAL_PACK_NAME: &str = "Global Schedule";

const TEAM_PACK_TYPE_PREFIX: &str = "team-";

pub fn team_pack_type(team_id: i64) -> String {
    format!("{}{}", TEAM_PACK_TYPE_PREFIX, team_id)
}

pub fn team_pack_name(team: &Team) -> String {
    format!("Team: {}", team.name)
}

/// Team id encoded in a `team-<id>` pack type.
pub fn parse_team_pack_type(pack_type: &str) -> Option<i64> {
    pack_type
        .strip_prefix(TEAM_PACK_TYPE_PREFIX)
        .and_then(|id| id.parse().ok())
}

/// Lifecycle of the singleton packs owned by a scope: one global pack and
/// one pack per team. Their names are always derived from the scope.
pub struct SystemPacks;

impl SystemPacks {
    pub fn ensure_global_pack(db: &Database) -> Result<Pack, FleetPackError> {
        let mut conn = db.get_connection()?;
        if let Some(pack) = Packs::get_by_type(&conn, GLOBAL_PACK_TYPE)? {
            return Ok(pack);
        }

        let label_id = Labels::ids_by_name(&conn, &[ALL_HOSTS_LABEL.to_owned()])?
            .get(ALL_HOSTS_LABEL)
            .copied()
            .ok_or_else(|| FleetPackError::not_found_name("Label", ALL_HOSTS_LABEL))?;

        let pack_id = db
            .immediate_transaction(&mut conn, "ensure global pack", |c| {
                // Another writer may have created it since the read above
                if let Some(pack) = Packs::get_by_type(c, GLOBAL_PACK_TYPE)? {
                    return Ok(pack.pack_id);
                }
                let pack_id = Packs::insert_pack_row(
                    c,
                    &Pack {
                        name: GLOBAL_PACK_NAME.to_owned(),
                        pack_type: Some(GLOBAL_PACK_TYPE.to_owned()),
                        ..Default::default()
                    },
                )?;
                Packs::replace_targets(c, pack_id, TargetKind::Label, &[label_id])?;
                info!("Created global pack ({})", pack_id);
                Ok(pack_id)
            })
            .context("ensuring global pack")?;

        Packs::get_by_id(&conn, pack_id)?.ok_or_else(|| FleetPackError::not_found_id("Pack", pack_id))
    }

    /// Returns the team's pack, creating it on first use. A pack whose name no
    /// longer matches the team (renamed team, legacy name) is renamed in place.
    pub fn ensure_team_pack(db: &Database, team_id: i64) -> Result<Pack, FleetPackError> {
        let mut conn = db.get_connection()?;
        let team = Teams::get_by_id(&conn, team_id)?
            .ok_or_else(|| FleetPackError::not_found_id("Team", team_id))?;
        let pack_type = team_pack_type(team_id);
        let name = team_pack_name(&team);

        if let Some(pack) = Packs::get_by_type(&conn, &pack_type)? {
            if pack.name == name {
                return Ok(pack);
            }
        }

        let pack_id = db
            .immediate_transaction(&mut conn, "ensure team pack", |c| {
                match Packs::get_by_type(c, &pack_type)? {
                    Some(pack) if pack.name == name => Ok(pack.pack_id),
                    Some(pack) => {
                        Packs::rename(c, pack.pack_id, &name)?;
                        info!("Renamed team pack '{}' to '{}'", pack.name, name);
                        Ok(pack.pack_id)
                    }
                    None => {
                        let pack_id = Packs::insert_pack_row(
                            c,
                            &Pack {
                                name: name.clone(),
                                pack_type: Some(pack_type.clone()),
                                ..Default::default()
                            },
                        )?;
                        Packs::replace_targets(c, pack_id, TargetKind::Team, &[team_id])?;
                        info!("Created team pack '{}' ({})", name, pack_id);
                        Ok(pack_id)
                    }
                }
            })
            .context("ensuring team pack")?;

        Packs::get_by_id(&conn, pack_id)?.ok_or_else(|| FleetPackError::not_found_id("Pack", pack_id))
    }

    /// Renames system packs still carrying the legacy name (the type tag
    /// itself) to their derived name. Returns how many were renamed. Safe to
    /// run repeatedly.
    pub fn migrate_data(db: &Database) -> Result<usize, FleetPackError> {
        let mut conn = db.get_connection()?;

        let renamed = db
            .immediate_transaction(&mut conn, "migrate data", |c| {
                let legacy = {
                    let mut stmt = c.prepare(
                        "SELECT pack_id, pack_type FROM packs
                         WHERE pack_type IS NOT NULL AND name = pack_type
                         ORDER BY pack_id",
                    )?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let mut renamed = 0;
                for (pack_id, pack_type) in legacy {
                    db.check_deadline("migrate data")?;
                    let name = if pack_type == GLOBAL_PACK_TYPE {
                        GLOBAL_PACK_NAME.to_owned()
                    } else if let Some(team_id) = parse_team_pack_type(&pack_type) {
                        match Teams::get_by_id(c, team_id)? {
                            Some(team) => team_pack_name(&team),
                            None => {
                                warn!("Skipping pack {}: team {} no longer exists", pack_id, team_id);
                                continue;
                            }
                        }
                    } else {
                        warn!("Skipping pack {}: unrecognized type '{}'", pack_id, pack_type);
                        continue;
                    };

                    Packs::rename(c, pack_id, &name)?;
                    info!("Renamed legacy pack '{}' to '{}'", pack_type, name);
                    renamed += 1;
                }
                Ok(renamed)
            })
            .context("migrating data")?;

        Ok(renamed)
    }
}
