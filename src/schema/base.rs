pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- ========================================
-- Directory tables (owned by external collaborators)
-- ========================================
CREATE TABLE IF NOT EXISTS users (
    user_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    email       TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS labels (
    label_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    query       TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS teams (
    team_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS hosts (
    host_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname    TEXT NOT NULL UNIQUE,
    team_id     INTEGER DEFAULT NULL,
    FOREIGN KEY (team_id) REFERENCES teams(team_id) ON DELETE SET NULL
);

-- Latest evaluation of each label on each host. A missing row means "unknown".
CREATE TABLE IF NOT EXISTS label_evaluations (
    host_id     INTEGER NOT NULL,
    label_id    INTEGER NOT NULL,
    matches     BOOLEAN NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (host_id, label_id),
    FOREIGN KEY (host_id) REFERENCES hosts(host_id) ON DELETE CASCADE,
    FOREIGN KEY (label_id) REFERENCES labels(label_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_label_evaluations_label ON label_evaluations (label_id, host_id);

-- ========================================
-- Queries
-- ========================================
CREATE TABLE IF NOT EXISTS queries (
    query_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL UNIQUE,
    description      TEXT NOT NULL DEFAULT '',
    query            TEXT NOT NULL,
    author_id        INTEGER DEFAULT NULL,
    saved            BOOLEAN NOT NULL DEFAULT 0,
    observer_can_run BOOLEAN NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    FOREIGN KEY (author_id) REFERENCES users(user_id) ON DELETE SET NULL
);

-- ========================================
-- Packs and their targets
-- ========================================
CREATE TABLE IF NOT EXISTS packs (
    pack_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    platform    TEXT NOT NULL DEFAULT '',
    disabled    BOOLEAN NOT NULL DEFAULT 0,
    pack_type   TEXT DEFAULT NULL UNIQUE,  -- NULL for user packs, 'global' or 'team-<id>' for system packs
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pack_labels (
    pack_id     INTEGER NOT NULL,
    label_id    INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (pack_id, label_id),
    FOREIGN KEY (pack_id) REFERENCES packs(pack_id) ON DELETE CASCADE,
    FOREIGN KEY (label_id) REFERENCES labels(label_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_pack_labels_label ON pack_labels (label_id);

CREATE TABLE IF NOT EXISTS pack_hosts (
    pack_id     INTEGER NOT NULL,
    host_id     INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (pack_id, host_id),
    FOREIGN KEY (pack_id) REFERENCES packs(pack_id) ON DELETE CASCADE,
    FOREIGN KEY (host_id) REFERENCES hosts(host_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_pack_hosts_host ON pack_hosts (host_id);

CREATE TABLE IF NOT EXISTS pack_teams (
    pack_id     INTEGER NOT NULL,
    team_id     INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (pack_id, team_id),
    FOREIGN KEY (pack_id) REFERENCES packs(pack_id) ON DELETE CASCADE,
    FOREIGN KEY (team_id) REFERENCES teams(team_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_pack_teams_team ON pack_teams (team_id);

-- ========================================
-- Scheduled query entries
-- ========================================
-- Nullable override columns keep "unset" distinct from false/zero.
CREATE TABLE IF NOT EXISTS scheduled_queries (
    scheduled_query_id INTEGER PRIMARY KEY AUTOINCREMENT,
    pack_id         INTEGER NOT NULL,
    query_id        INTEGER NOT NULL,
    name            TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    position        INTEGER NOT NULL,
    interval        INTEGER NOT NULL DEFAULT 0,
    snapshot        BOOLEAN DEFAULT NULL,
    removed         BOOLEAN DEFAULT NULL,
    platform        TEXT DEFAULT NULL,
    version         TEXT DEFAULT NULL,
    shard           INTEGER DEFAULT NULL,
    denylist        BOOLEAN DEFAULT NULL,
    UNIQUE (pack_id, name),
    FOREIGN KEY (pack_id) REFERENCES packs(pack_id) ON DELETE CASCADE,
    FOREIGN KEY (query_id) REFERENCES queries(query_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_scheduled_queries_query ON scheduled_queries (query_id);

-- ========================================
-- Per-host execution statistics
-- ========================================
-- No foreign key into scheduled_queries: entry rewrites never cascade into
-- this table. Orphaned rows are filtered out on read.
CREATE TABLE IF NOT EXISTS scheduled_query_stats (
    host_id            INTEGER NOT NULL,
    scheduled_query_id INTEGER NOT NULL,
    average_memory     INTEGER NOT NULL DEFAULT 0,
    denylisted         BOOLEAN NOT NULL DEFAULT 0,
    executions         INTEGER NOT NULL DEFAULT 0,
    schedule_interval  INTEGER NOT NULL DEFAULT 0,
    last_executed      INTEGER NOT NULL DEFAULT 0,
    output_size        INTEGER NOT NULL DEFAULT 0,
    system_time        INTEGER NOT NULL DEFAULT 0,
    user_time          INTEGER NOT NULL DEFAULT 0,
    wall_time          INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (host_id, scheduled_query_id)
);

COMMIT;
"#;
