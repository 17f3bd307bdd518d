use std::path::Path;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::commands::StoreCmd;
use super::queries;
use super::schema::run_migrations;
use super::MetaKey;
use crate::models::{DomainColorInfo, DomainColors, DomainNode, MessageRecord};

// ---------------------------------------------------------------------------
// StoreHandle: Clone + Send + Sync async facade over the cache database
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("alive", &!self.tx.is_closed())
            .finish()
    }
}

impl StoreHandle {
    /// Open (or create) the cache under the user data dir and spawn the
    /// background thread.
    pub fn open() -> Result<Self, String> {
        let dir = crate::config::data_dir();
        std::fs::create_dir_all(&dir).map_err(|e| format!("Failed to create cache dir: {e}"))?;
        Self::open_at(&dir.join("cache.db"))
    }

    pub fn open_at(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("Failed to open cache db: {e}"))?;
        Self::spawn(conn)
    }

    /// Throwaway store, used by tests and by hosts that opt out of caching.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("Failed to open cache db: {e}"))?;
        Self::spawn(conn)
    }

    fn spawn(conn: Connection) -> Result<Self, String> {
        run_migrations(&conn)?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("mailtiles-store".into())
            .spawn(move || run_loop(conn, rx))
            .map_err(|e| format!("Failed to spawn cache thread: {e}"))?;

        Ok(StoreHandle { tx })
    }

    // -- records -------------------------------------------------------------

    /// Replace the cached record collection.
    pub async fn save_records(&self, records: Vec<MessageRecord>) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::SaveRecords { records, reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    pub async fn load_records(&self) -> Result<Vec<MessageRecord>, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::LoadRecords { reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    pub async fn has_any_records(&self) -> Result<bool, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::HasAnyRecords { reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    /// Wipe records and metadata.
    pub async fn clear_all(&self) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::ClearAll { reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    // -- metadata ------------------------------------------------------------

    pub async fn save_meta<T: Serialize + ?Sized>(&self, key: MetaKey, value: &T) -> Result<(), String> {
        let value = serde_json::to_string(value)
            .map_err(|e| format!("Cache encode error for {}: {e}", key.as_str()))?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::SaveMeta {
                key: key.as_str(),
                value,
                reply,
            })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    /// `Ok(None)` when the key was never written.
    pub async fn load_meta<T: DeserializeOwned>(&self, key: MetaKey) -> Result<Option<T>, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::LoadMeta {
                key: key.as_str(),
                reply,
            })
            .map_err(|_| "Cache unavailable".to_string())?;
        let raw = rx.await.map_err(|_| "Cache unavailable".to_string())??;
        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| format!("Cache decode error for {}: {e}", key.as_str())),
            None => Ok(None),
        }
    }

    pub async fn save_message_ids(&self, ids: &[String]) -> Result<(), String> {
        self.save_meta(MetaKey::MessageIds, ids).await
    }

    pub async fn load_message_ids(&self) -> Result<Vec<String>, String> {
        Ok(self.load_meta(MetaKey::MessageIds).await?.unwrap_or_default())
    }

    /// Epoch millis.
    pub async fn save_last_fetch(&self, millis: i64) -> Result<(), String> {
        self.save_meta(MetaKey::LastFetch, &millis).await
    }

    pub async fn load_last_fetch(&self) -> Result<Option<i64>, String> {
        self.load_meta(MetaKey::LastFetch).await
    }

    pub async fn save_hierarchy(&self, hierarchy: &[DomainNode]) -> Result<(), String> {
        self.save_meta(MetaKey::Hierarchy, hierarchy).await
    }

    pub async fn load_hierarchy(&self) -> Result<Option<Vec<DomainNode>>, String> {
        self.load_meta(MetaKey::Hierarchy).await
    }

    pub async fn save_domain_colors(&self, colors: &DomainColors) -> Result<(), String> {
        let mut entries: Vec<(&String, &DomainColorInfo)> = colors.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        self.save_meta(MetaKey::DomainColors, &entries).await
    }

    pub async fn load_domain_colors(&self) -> Result<Option<DomainColors>, String> {
        let entries: Option<Vec<(String, DomainColorInfo)>> =
            self.load_meta(MetaKey::DomainColors).await?;
        Ok(entries.map(|e| e.into_iter().collect()))
    }
}

// -- background thread ---------------------------------------------------

fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<StoreCmd>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCmd::SaveRecords { records, reply } => {
                let _ = reply.send(queries::do_save_records(&conn, &records));
            }
            StoreCmd::LoadRecords { reply } => {
                let _ = reply.send(queries::do_load_records(&conn));
            }
            StoreCmd::HasAnyRecords { reply } => {
                let _ = reply.send(queries::do_has_any_records(&conn));
            }
            StoreCmd::SaveMeta { key, value, reply } => {
                let _ = reply.send(queries::do_save_meta(&conn, key, &value));
            }
            StoreCmd::LoadMeta { key, reply } => {
                let _ = reply.send(queries::do_load_meta(&conn, key));
            }
            StoreCmd::ClearAll { reply } => {
                let _ = reply.send(queries::do_clear_all(&conn));
            }
        }
    }
    log::debug!("Store thread exiting");
}
