use rusqlite::Connection;

use crate::models::MessageRecord;

/// Replace the whole collection: clear, then insert in order.
pub(super) fn do_save_records(conn: &Connection, records: &[MessageRecord]) -> Result<(), String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("Cache tx error: {e}"))?;

    tx.execute("DELETE FROM records", [])
        .map_err(|e| format!("Cache delete error: {e}"))?;

    let mut stmt = tx
        .prepare(
            "INSERT INTO records (seq, sender, name, unread, message_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(|e| format!("Cache prepare error: {e}"))?;

    for (seq, r) in records.iter().enumerate() {
        stmt.execute(rusqlite::params![
            seq as i64,
            r.from,
            r.name,
            r.unread as i32,
            r.message_id,
        ])
        .map_err(|e| format!("Cache insert error: {e}"))?;
    }
    drop(stmt);

    tx.commit()
        .map_err(|e| format!("Cache commit error: {e}"))?;
    Ok(())
}

pub(super) fn do_load_records(conn: &Connection) -> Result<Vec<MessageRecord>, String> {
    let mut stmt = conn
        .prepare("SELECT sender, name, unread, message_id FROM records ORDER BY seq")
        .map_err(|e| format!("Cache prepare error: {e}"))?;

    let rows = stmt
        .query_map([], |row| {
            Ok(MessageRecord {
                from: row.get(0)?,
                name: row.get(1)?,
                unread: row.get::<_, i32>(2)? != 0,
                message_id: row.get(3)?,
            })
        })
        .map_err(|e| format!("Cache query error: {e}"))?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(|e| format!("Cache row error: {e}"))?);
    }
    Ok(records)
}

pub(super) fn do_has_any_records(conn: &Connection) -> Result<bool, String> {
    conn.query_row("SELECT EXISTS(SELECT 1 FROM records)", [], |row| row.get::<_, bool>(0))
        .map_err(|e| format!("Cache query error: {e}"))
}

pub(super) fn do_save_meta(conn: &Connection, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )
    .map_err(|e| format!("Cache meta save error: {e}"))?;
    Ok(())
}

pub(super) fn do_load_meta(conn: &Connection, key: &str) -> Result<Option<String>, String> {
    match conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
        row.get::<_, String>(0)
    }) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(format!("Cache meta load error: {e}")),
    }
}

pub(super) fn do_clear_all(conn: &Connection) -> Result<(), String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("Cache tx error: {e}"))?;
    tx.execute("DELETE FROM records", [])
        .map_err(|e| format!("Cache record cleanup error: {e}"))?;
    tx.execute("DELETE FROM meta", [])
        .map_err(|e| format!("Cache meta cleanup error: {e}"))?;
    tx.commit()
        .map_err(|e| format!("Cache commit error: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::store::schema::run_migrations;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("migrate");
        conn
    }

    fn record(from: &str, id: Option<&str>) -> MessageRecord {
        MessageRecord {
            from: from.into(),
            name: from.into(),
            unread: id.is_some(),
            message_id: id.map(str::to_string),
        }
    }

    #[test]
    fn save_replaces_previous_records_and_keeps_order() {
        let conn = db();
        do_save_records(&conn, &[record("old@x.com", Some("1"))]).expect("first save");
        let fresh = vec![record("b@x.com", Some("3")), record("a@x.com", None)];
        do_save_records(&conn, &fresh).expect("second save");

        assert_eq!(do_load_records(&conn).expect("load"), fresh);
        assert!(do_has_any_records(&conn).expect("exists"));
    }

    #[test]
    fn meta_upserts_and_missing_is_none() {
        let conn = db();
        assert_eq!(do_load_meta(&conn, "lastFetch").expect("load"), None);
        do_save_meta(&conn, "lastFetch", "1").expect("save");
        do_save_meta(&conn, "lastFetch", "2").expect("overwrite");
        assert_eq!(do_load_meta(&conn, "lastFetch").expect("load").as_deref(), Some("2"));
    }

    #[test]
    fn clear_all_empties_both_collections() {
        let conn = db();
        do_save_records(&conn, &[record("a@x.com", Some("1"))]).expect("save");
        do_save_meta(&conn, "hierarchy", "[]").expect("save meta");
        do_clear_all(&conn).expect("clear");
        assert!(!do_has_any_records(&conn).expect("exists"));
        assert_eq!(do_load_meta(&conn, "hierarchy").expect("load"), None);
    }
}
