/// Schema for the partition store and the offline action queue.
pub const SCHEMA: &str = r#"
-- One row per live partition (physical name = <kind>-<version>)
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_seq INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses; seq gives insertion order within a partition
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_seq
    ON cache_entries(partition, seq);

-- Version whose partitions intercept requests; at most one row
CREATE TABLE IF NOT EXISTS active_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version TEXT NOT NULL,
    activated_at TEXT NOT NULL
);

-- Mutating requests waiting for replay, in enqueue order
CREATE TABLE IF NOT EXISTS queued_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    enqueued_at TEXT NOT NULL
);
"#;
