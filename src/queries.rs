use std::collections::HashMap;

use log::{info, Level};
use logging_timer::timer;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::database::{now, placeholders, Database};
use crate::error::{is_unique_violation, FleetPackError, ResultExt};
use crate::list_options::ListOptions;
use crate::packs::PackSummary;

const QUERY_COLUMNS: &str = "q.query_id, q.name, q.description, q.query, q.author_id,
    COALESCE(NULLIF(u.name, ''), u.email, '<deleted>'),
    q.saved, q.observer_can_run, q.created_at, q.updated_at";

const QUERY_FROM: &str = "FROM queries q LEFT JOIN users u ON u.user_id = q.author_id";

/// A named query. `packs` lists the packs that schedule it and is only
/// populated by reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub query_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: String,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default, skip_deserializing)]
    pub author_name: String,
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub observer_can_run: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_deserializing)]
    pub packs: Vec<PackSummary>,
}

impl Query {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Query {
            query_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            query: row.get(3)?,
            author_id: row.get(4)?,
            author_name: row.get(5)?,
            saved: row.get(6)?,
            observer_can_run: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            packs: Vec::new(),
        })
    }
}

pub struct Queries;

impl Queries {
    /// Upserts every query by name in one transaction, recording `author_id` as
    /// the author and marking each one saved. Existing rows keep their id and
    /// creation time. Any empty name rejects the whole batch.
    pub fn apply_queries(
        db: &Database,
        author_id: Option<i64>,
        queries: &[Query],
    ) -> Result<(), FleetPackError> {
        let _tmr = timer!(Level::Trace; "Queries::apply_queries", "{} queries", queries.len());

        if queries.iter().any(|q| q.name.is_empty()) {
            return Err(FleetPackError::empty_name("query"));
        }

        db.write("apply queries", |c| {
            let mut stmt = c.prepare(
                "INSERT INTO queries (name, description, query, author_id, saved, observer_can_run, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 1, ?, ?, ?)
                 ON CONFLICT (name) DO UPDATE SET
                    description = excluded.description,
                    query = excluded.query,
                    author_id = excluded.author_id,
                    saved = excluded.saved,
                    observer_can_run = excluded.observer_can_run,
                    updated_at = excluded.updated_at",
            )?;

            let ts = now();
            for q in queries {
                db.check_deadline("apply queries")?;
                stmt.execute(params![
                    q.name,
                    q.description,
                    q.query,
                    author_id,
                    q.observer_can_run,
                    ts,
                    ts
                ])?;
            }
            Ok(())
        })
        .context("applying queries")?;

        info!("Applied {} queries", queries.len());
        Ok(())
    }

    pub fn new_query(db: &Database, query: &Query) -> Result<Query, FleetPackError> {
        if query.name.is_empty() {
            return Err(FleetPackError::empty_name("query"));
        }

        let conn = db.get_connection()?;
        let ts = now();
        let query_id: i64 = conn
            .query_row(
                "INSERT INTO queries (name, description, query, author_id, saved, observer_can_run, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 RETURNING query_id",
                params![
                    query.name,
                    query.description,
                    query.query,
                    query.author_id,
                    query.saved,
                    query.observer_can_run,
                    ts,
                    ts
                ],
                |row| row.get(0),
            )
            .map_err(|e| Self::map_unique(e, &query.name))
            .context("creating query")?;

        Self::get_by_id(&conn, query_id)?
            .ok_or_else(|| FleetPackError::not_found_id("Query", query_id))
    }

    pub fn save_query(db: &Database, query: &Query) -> Result<(), FleetPackError> {
        if query.name.is_empty() {
            return Err(FleetPackError::empty_name("query"));
        }

        let conn = db.get_connection()?;
        let rows = conn
            .execute(
                "UPDATE queries SET name = ?, description = ?, query = ?, author_id = ?,
                    saved = ?, observer_can_run = ?, updated_at = ?
                 WHERE query_id = ?",
                params![
                    query.name,
                    query.description,
                    query.query,
                    query.author_id,
                    query.saved,
                    query.observer_can_run,
                    now(),
                    query.query_id
                ],
            )
            .map_err(|e| Self::map_unique(e, &query.name))
            .context("saving query")?;

        if rows == 0 {
            return Err(FleetPackError::not_found_id("Query", query.query_id));
        }
        Ok(())
    }

    /// Deleting a query also drops every scheduled entry that uses it.
    pub fn delete_query(db: &Database, name: &str) -> Result<(), FleetPackError> {
        let conn = db.get_connection()?;
        let rows = conn
            .execute("DELETE FROM queries WHERE name = ?", [name])
            .context("deleting query")?;
        if rows == 0 {
            return Err(FleetPackError::not_found_name("Query", name));
        }
        info!("Deleted query '{}'", name);
        Ok(())
    }

    /// Returns how many of `ids` were actually deleted.
    pub fn delete_queries(db: &Database, ids: &[i64]) -> Result<usize, FleetPackError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = db.get_connection()?;
        let sql = format!(
            "DELETE FROM queries WHERE query_id IN ({})",
            placeholders(ids.len())
        );
        let deleted = conn
            .execute(&sql, params_from_iter(ids.iter()))
            .context("deleting queries")?;

        info!("Deleted {} of {} queries", deleted, ids.len());
        Ok(deleted)
    }

    pub fn query(db: &Database, query_id: i64) -> Result<Query, FleetPackError> {
        db.check_deadline("get query")?;
        let conn = db.get_connection()?;
        let query = Self::get_by_id(&conn, query_id)?
            .ok_or_else(|| FleetPackError::not_found_id("Query", query_id))?;
        Self::with_packs(&conn, query)
    }

    pub fn query_by_name(db: &Database, name: &str) -> Result<Query, FleetPackError> {
        db.check_deadline("get query by name")?;
        let conn = db.get_connection()?;
        let sql = format!("SELECT {} {} WHERE q.name = ?", QUERY_COLUMNS, QUERY_FROM);
        let query = conn
            .query_row(&sql, [name], Query::from_row)
            .optional()
            .context("selecting query by name")?
            .ok_or_else(|| FleetPackError::not_found_name("Query", name))?;
        Self::with_packs(&conn, query)
    }

    /// Saved queries only, each with the packs that schedule it.
    pub fn list_queries(db: &Database, opts: &ListOptions) -> Result<Vec<Query>, FleetPackError> {
        let _tmr = timer!(Level::Trace; "Queries::list_queries");
        db.check_deadline("list queries")?;
        let conn = db.get_connection()?;

        let sql = opts.append_to_sql(
            &format!("SELECT {} {} WHERE q.saved = 1", QUERY_COLUMNS, QUERY_FROM),
            &[
                ("id", "q.query_id"),
                ("name", "q.name"),
                ("created_at", "q.created_at"),
                ("updated_at", "q.updated_at"),
                ("author_name", "u.name"),
            ],
            "q.query_id",
        )?;

        let mut stmt = conn.prepare(&sql)?;
        let mut queries = stmt
            .query_map([], Query::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("listing queries")?;

        Self::load_packs_for_queries(&conn, &mut queries)?;
        Ok(queries)
    }

    /// Attaches to each query the packs that schedule it, in one join.
    /// A query scheduled nowhere gets an empty list.
    pub fn load_packs_for_queries(
        conn: &Connection,
        queries: &mut [Query],
    ) -> Result<(), FleetPackError> {
        if queries.is_empty() {
            return Ok(());
        }

        let index: HashMap<String, usize> = queries
            .iter()
            .enumerate()
            .map(|(i, q)| (q.name.clone(), i))
            .collect();
        let names: Vec<&str> = queries.iter().map(|q| q.name.as_str()).collect();

        let sql = format!(
            "SELECT DISTINCT q.name, p.pack_id, p.name, p.pack_type, p.disabled
             FROM queries q
             JOIN scheduled_queries sq ON sq.query_id = q.query_id
             JOIN packs p ON p.pack_id = sq.pack_id
             WHERE q.name IN ({})
             ORDER BY p.pack_id",
            placeholders(names.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(names.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                PackSummary {
                    pack_id: row.get(1)?,
                    name: row.get(2)?,
                    pack_type: row.get(3)?,
                    disabled: row.get(4)?,
                },
            ))
        })?;

        for q in queries.iter_mut() {
            q.packs.clear();
        }
        for row in rows {
            let (query_name, pack) = row.context("loading packs for queries")?;
            if let Some(&i) = index.get(&query_name) {
                queries[i].packs.push(pack);
            }
        }

        Ok(())
    }

    /// Ids of the named saved queries. Unsaved and unknown names are absent.
    pub(crate) fn saved_ids_by_name(
        conn: &Connection,
        names: &[String],
    ) -> Result<HashMap<String, i64>, FleetPackError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT name, query_id FROM queries WHERE saved = 1 AND name IN ({})",
            placeholders(names.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(names.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        rows.collect::<Result<HashMap<_, _>, _>>()
            .context("resolving query names")
    }

    fn get_by_id(conn: &Connection, query_id: i64) -> Result<Option<Query>, FleetPackError> {
        let sql = format!("SELECT {} {} WHERE q.query_id = ?", QUERY_COLUMNS, QUERY_FROM);
        conn.query_row(&sql, [query_id], Query::from_row)
            .optional()
            .context("selecting query")
    }

    fn with_packs(conn: &Connection, query: Query) -> Result<Query, FleetPackError> {
        let mut queries = [query];
        Self::load_packs_for_queries(conn, &mut queries)?;
        let [query] = queries;
        Ok(query)
    }

    fn map_unique(e: rusqlite::Error, name: &str) -> FleetPackError {
        if is_unique_violation(&e) {
            FleetPackError::AlreadyExists {
                entity: "Query",
                name: name.to_owned(),
            }
        } else {
            FleetPackError::DatabaseError(e)
        }
    }
}
