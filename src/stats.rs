use log::{debug, info, warn, Level};
use logging_timer::timer;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{FleetPackError, ResultExt};

/// Execution statistics a host reports for one scheduled entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledQueryStats {
    pub scheduled_query_id: i64,
    pub average_memory: i64,
    pub denylisted: bool,
    pub executions: i64,
    pub interval: i64,
    pub last_executed: i64,
    pub output_size: i64,
    pub system_time: i64,
    pub user_time: i64,
    pub wall_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackStats {
    pub pack_name: String,
    pub query_stats: Vec<ScheduledQueryStats>,
}

/// Stats row joined with the live entry and pack it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostQueryStats {
    pub pack_id: i64,
    pub pack_name: String,
    pub scheduled_query_name: String,
    pub query_name: String,
    pub stats: ScheduledQueryStats,
}

pub struct ExecutionStats;

impl ExecutionStats {
    /// Upserts one row per (host, entry). Only the stats table is written.
    /// Rows for an unknown host or entry are skipped; the count returned is
    /// the number of rows actually stored.
    pub fn save_host_pack_stats(
        db: &Database,
        host_id: i64,
        pack_stats: &[PackStats],
    ) -> Result<usize, FleetPackError> {
        let _tmr = timer!(Level::Trace; "ExecutionStats::save_host_pack_stats", "{}", host_id);

        let (saved, skipped) = db
            .write("save host pack stats", |c| {
                let mut stmt = c.prepare(
                    "INSERT INTO scheduled_query_stats
                        (host_id, scheduled_query_id, average_memory, denylisted, executions,
                         schedule_interval, last_executed, output_size, system_time, user_time, wall_time)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
                     WHERE EXISTS (SELECT 1 FROM hosts WHERE host_id = ?1)
                       AND EXISTS (SELECT 1 FROM scheduled_queries WHERE scheduled_query_id = ?2)
                     ON CONFLICT (host_id, scheduled_query_id) DO UPDATE SET
                        average_memory = excluded.average_memory,
                        denylisted = excluded.denylisted,
                        executions = excluded.executions,
                        schedule_interval = excluded.schedule_interval,
                        last_executed = excluded.last_executed,
                        output_size = excluded.output_size,
                        system_time = excluded.system_time,
                        user_time = excluded.user_time,
                        wall_time = excluded.wall_time",
                )?;

                let (mut saved, mut skipped) = (0, 0);
                for s in pack_stats.iter().flat_map(|p| p.query_stats.iter()) {
                    let rows = stmt.execute(params![
                        host_id,
                        s.scheduled_query_id,
                        s.average_memory,
                        s.denylisted,
                        s.executions,
                        s.interval,
                        s.last_executed,
                        s.output_size,
                        s.system_time,
                        s.user_time,
                        s.wall_time
                    ])?;
                    if rows == 0 {
                        skipped += 1;
                    }
                    saved += rows;
                }
                Ok((saved, skipped))
            })
            .context("saving host pack stats")?;

        if skipped > 0 {
            warn!("Skipped {} stats rows for unknown host or entries (host {})", skipped, host_id);
        }
        debug!("Saved {} stats rows for host {}", saved, host_id);
        Ok(saved)
    }

    /// Deletes stats whose host or entry no longer exists. Entries removed by a
    /// spec reapply take their stats with them; this catches the rest (deleted
    /// packs, queries and hosts).
    pub fn prune_orphaned_stats(db: &Database) -> Result<usize, FleetPackError> {
        let pruned = db
            .write("prune orphaned stats", |c| {
                Ok(c.execute(
                    "DELETE FROM scheduled_query_stats
                     WHERE NOT EXISTS (
                        SELECT 1 FROM scheduled_queries sq
                        WHERE sq.scheduled_query_id = scheduled_query_stats.scheduled_query_id
                     )
                     OR NOT EXISTS (
                        SELECT 1 FROM hosts h WHERE h.host_id = scheduled_query_stats.host_id
                     )",
                    [],
                )?)
            })
            .context("pruning orphaned stats")?;

        if pruned > 0 {
            info!("Pruned {} orphaned stats rows", pruned);
        }
        Ok(pruned)
    }

    /// Stats for entries that still exist, ordered by pack then entry position.
    pub fn scheduled_query_stats_for_host(
        db: &Database,
        host_id: i64,
    ) -> Result<Vec<HostQueryStats>, FleetPackError> {
        db.check_deadline("scheduled query stats for host")?;
        let conn = db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT p.pack_id, p.name, sq.name, q.name,
                    s.scheduled_query_id, s.average_memory, s.denylisted, s.executions,
                    s.schedule_interval, s.last_executed, s.output_size, s.system_time,
                    s.user_time, s.wall_time
             FROM scheduled_query_stats s
             JOIN scheduled_queries sq ON sq.scheduled_query_id = s.scheduled_query_id
             JOIN packs p ON p.pack_id = sq.pack_id
             JOIN queries q ON q.query_id = sq.query_id
             WHERE s.host_id = ?
             ORDER BY p.pack_id, sq.position",
        )?;

        let rows = stmt.query_map([host_id], |row| {
            Ok(HostQueryStats {
                pack_id: row.get(0)?,
                pack_name: row.get(1)?,
                scheduled_query_name: row.get(2)?,
                query_name: row.get(3)?,
                stats: ScheduledQueryStats {
                    scheduled_query_id: row.get(4)?,
                    average_memory: row.get(5)?,
                    denylisted: row.get(6)?,
                    executions: row.get(7)?,
                    interval: row.get(8)?,
                    last_executed: row.get(9)?,
                    output_size: row.get(10)?,
                    system_time: row.get(11)?,
                    user_time: row.get(12)?,
                    wall_time: row.get(13)?,
                },
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .context("selecting scheduled query stats")
    }
}
