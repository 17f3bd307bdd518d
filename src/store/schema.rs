use rusqlite::Connection;

/// Bumped whenever the layout below changes incompatibly.
pub(super) const SCHEMA_VERSION: i64 = 1;

/// Schema DDL run on open.
pub(super) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY,
    sender TEXT NOT NULL,
    name TEXT NOT NULL,
    unread INTEGER NOT NULL DEFAULT 0,
    message_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_records_message_id ON records(message_id);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Bring the database to [`SCHEMA_VERSION`].
///
/// Everything here is derived from the mailbox and can be refetched, so a
/// cache written by an unknown schema version is dropped rather than
/// converted.
pub(super) fn run_migrations(conn: &Connection) -> Result<(), String> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| format!("Cache version read error: {e}"))?;

    if version != 0 && version != SCHEMA_VERSION {
        log::warn!(
            "Cache schema v{} does not match v{}, discarding cached data",
            version,
            SCHEMA_VERSION
        );
        conn.execute_batch("DROP TABLE IF EXISTS records; DROP TABLE IF EXISTS meta;")
            .map_err(|e| format!("Cache reset error: {e}"))?;
    }

    conn.execute_batch(SCHEMA)
        .map_err(|e| format!("Failed to init cache schema: {e}"))?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .map_err(|e| format!("Cache version write error: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    #[test]
    fn fresh_database_gets_current_version() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("migrate");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("read version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn unknown_version_is_discarded() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "
            CREATE TABLE records (id INTEGER PRIMARY KEY, payload TEXT);
            INSERT INTO records (id, payload) VALUES (1, 'stale');
            PRAGMA user_version = 99;
            ",
        )
        .expect("seed legacy schema");

        run_migrations(&conn).expect("migrate");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .expect("count records");
        assert_eq!(count, 0);
        conn.execute(
            "INSERT INTO records (seq, sender, name, unread) VALUES (0, 'a@b.com', 'A', 1)",
            [],
        )
        .expect("new layout accepts rows");
    }

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("first run");
        conn.execute("INSERT INTO meta (key, value) VALUES ('lastFetch', '1')", [])
            .expect("insert meta");
        run_migrations(&conn).expect("second run");
        let value: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'lastFetch'", [], |row| row.get(0))
            .expect("meta survives");
        assert_eq!(value, "1");
    }
}
