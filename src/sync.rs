//! The state machine that owns records, hierarchy and colors, and keeps them
//! in step with the mailbox and the on-disk cache.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::colors::seed_fallback_colors;
use crate::config::AppConfig;
use crate::error::SyncError;
use crate::favicon::{run_enrichment, EnrichmentEvent, FaviconSource};
use crate::fetch::{fetch_inbox, fetch_new_messages, CancelSource, CancelToken, FetchEvent};
use crate::gmail::MessageSource;
use crate::grouping::{aggregate_others, domain_level, group_records};
use crate::models::{
    CountFilter, DomainColorInfo, DomainColors, DomainNode, MessageRecord, ProgressPhase,
    SyncState, SyncStatus,
};
use crate::store::StoreHandle;
use crate::view::{build_treemap_view, TreemapView};

/// What [`SyncOrchestrator::restore`] found in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    /// Nothing cached; the caller should start a full fetch.
    NoData,
}

struct Inner {
    state: watch::Sender<SyncState>,
    store: StoreHandle,
    favicons: Arc<dyn FaviconSource>,
    config: AppConfig,
    cancel: CancelSource,
    /// Readers are cache writes, the writer is `reset`. A write that passed
    /// its cancellation check always lands before the wipe.
    persist_gate: RwLock<()>,
    /// Serializes color map writes so the last one carries the newest map.
    color_writes: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("status", &self.inner.state.borrow().status)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(store: StoreHandle, favicons: Arc<dyn FaviconSource>, config: AppConfig) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            inner: Arc::new(Inner {
                state,
                store,
                favicons,
                config,
                cancel: CancelSource::new(),
                persist_gate: RwLock::new(()),
                color_writes: tokio::sync::Mutex::new(()),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Receiver that sees every published state.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Lay out the current state at `path`.
    pub fn view(&self, path: &[String], filter: CountFilter) -> TreemapView {
        let state = self.inner.state.borrow();
        build_treemap_view(
            &state.hierarchy,
            &state.domain_colors,
            path,
            filter,
            &self.inner.config.others_label,
        )
    }

    /// Epoch millis of the last completed fetch, if any.
    pub async fn last_fetch(&self) -> Result<Option<i64>, SyncError> {
        self.inner
            .store
            .load_last_fetch()
            .await
            .map_err(SyncError::Store)
    }

    // -- operations ----------------------------------------------------------

    /// Bring back whatever the cache holds.
    ///
    /// A cached hierarchy is adopted as-is and records follow in the
    /// background. Without one, the hierarchy is rebuilt from cached records
    /// and written back. An empty cache leaves the state untouched.
    pub async fn restore(&self) -> Result<RestoreOutcome, SyncError> {
        let token = self.inner.cancel.token();
        if is_busy(self.inner.state.borrow().status) {
            return Err(SyncError::Busy);
        }
        let result = self.run_restore(&token).await;
        self.finish(&token, result)
    }

    /// List the whole mailbox and rebuild everything from scratch,
    /// republishing the hierarchy after every metadata batch.
    pub async fn full_fetch(&self, source: Arc<dyn MessageSource>) -> Result<(), SyncError> {
        let token = self.inner.cancel.token();
        self.begin(&token, SyncStatus::Fetching, ProgressPhase::Listing)?;
        let result = self.run_full_fetch(source.as_ref(), &token).await;
        self.finish(&token, result)
    }

    /// Fetch only messages newer than the cached ones and put them in front.
    pub async fn incremental_fetch(&self, source: Arc<dyn MessageSource>) -> Result<(), SyncError> {
        let token = self.inner.cancel.token();
        self.begin(&token, SyncStatus::Fetching, ProgressPhase::Updating)?;
        let result = self.run_incremental_fetch(source.as_ref(), &token).await;
        self.finish(&token, result)
    }

    /// Cancel everything in flight, wipe the cache and return to `Idle`.
    ///
    /// The state ends in `Idle` even when wiping the cache fails.
    pub async fn reset(&self) -> Result<(), SyncError> {
        self.inner.cancel.cancel_all();
        let cleared = {
            let _gate = self.inner.persist_gate.write().await;
            self.inner.store.clear_all().await
        };
        self.inner.state.send_replace(SyncState::default());
        log::info!("Sync state reset");
        cleared.map_err(SyncError::Store)
    }

    /// Resolve favicons for specific domains, e.g. the members of an
    /// Others bucket the user opened. Domains that already carry a favicon
    /// are skipped.
    pub async fn enrich_domains(&self, ids: Vec<String>) {
        let token = self.inner.cancel.token();
        let domains = {
            let state = self.inner.state.borrow();
            missing_favicons(ids, &state.domain_colors)
        };
        self.enrich(token, domains).await;
    }

    /// Wait for background record loading and enrichment to finish.
    pub async fn settle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.inner.background.lock() {
                Ok(mut tasks) => tasks.drain(..).collect(),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    log::warn!("Background sync task failed: {}", e);
                }
            }
        }
    }

    // -- restore -------------------------------------------------------------

    async fn run_restore(&self, token: &CancelToken) -> Result<RestoreOutcome, SyncError> {
        let store = &self.inner.store;

        let cached = store.load_hierarchy().await.map_err(SyncError::Store)?;
        token.check()?;

        if let Some(hierarchy) = cached.filter(|h| !h.is_empty()) {
            self.begin(token, SyncStatus::Restoring, ProgressPhase::Restoring)?;
            let cached_colors = store
                .load_domain_colors()
                .await
                .map_err(SyncError::Store)?
                .unwrap_or_default();
            token.check()?;

            log::info!("Restored cached hierarchy of {} domains", hierarchy.len());
            let mut enrich = Vec::new();
            self.publish(token, |s| {
                adopt_cached_colors(&mut s.domain_colors, cached_colors);
                seed_fallback_colors(&hierarchy, &mut s.domain_colors);
                enrich = self.visible_without_favicon(&hierarchy, &s.domain_colors);
                s.status = SyncStatus::Done;
                s.progress_phase = None;
                s.hierarchy = Arc::new(hierarchy);
                s.error = None;
            });
            self.spawn_record_load(token.clone());
            self.spawn_enrichment(token.clone(), enrich);
            return Ok(RestoreOutcome::Restored);
        }

        let has_records = store.has_any_records().await.map_err(SyncError::Store)?;
        token.check()?;
        if !has_records {
            log::info!("Nothing cached");
            return Ok(RestoreOutcome::NoData);
        }

        self.begin(token, SyncStatus::Restoring, ProgressPhase::Restoring)?;
        let records = store.load_records().await.map_err(SyncError::Store)?;
        token.check()?;
        let cached_colors = store
            .load_domain_colors()
            .await
            .map_err(SyncError::Store)?
            .unwrap_or_default();
        token.check()?;

        let hierarchy = group_records(&records);
        log::info!(
            "Rebuilt hierarchy from {} cached records ({} domains)",
            records.len(),
            hierarchy.len()
        );

        let count = records.len();
        let records = Arc::new(records);
        let shared = Arc::new(hierarchy);
        let mut enrich = Vec::new();
        self.publish(token, |s| {
            adopt_cached_colors(&mut s.domain_colors, cached_colors);
            seed_fallback_colors(&shared, &mut s.domain_colors);
            enrich = self.visible_without_favicon(&shared, &s.domain_colors);
            s.status = SyncStatus::Done;
            s.progress = count;
            s.progress_phase = None;
            s.records = records;
            s.hierarchy = Arc::clone(&shared);
            s.error = None;
        });

        // Only speeds up the next restore, so failures stay local.
        let saved = match self.guarded(token, store.save_hierarchy(&shared)).await {
            Ok(()) => self.persist_colors(token).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            if e != SyncError::Cancelled {
                log::warn!("Failed to cache rebuilt hierarchy: {}", e);
            }
        }

        self.spawn_enrichment(token.clone(), enrich);
        Ok(RestoreOutcome::Restored)
    }

    fn spawn_record_load(&self, token: CancelToken) {
        let this = self.clone();
        self.track(tokio::spawn(async move {
            let records = match this.inner.store.load_records().await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Failed to load cached records: {}", e);
                    return;
                }
            };
            let count = records.len();
            let records = Arc::new(records);
            // A fetch that started meanwhile owns the records.
            this.publish(&token, |s| {
                if s.records.is_empty() && s.status == SyncStatus::Done {
                    s.progress = count;
                    s.records = records;
                }
            });
            log::debug!("Loaded {} cached records", count);
        }));
    }

    // -- fetch ---------------------------------------------------------------

    async fn run_full_fetch(
        &self,
        source: &dyn MessageSource,
        token: &CancelToken,
    ) -> Result<(), SyncError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batch_size = self.inner.config.batch_size;

        let producer = async move { fetch_inbox(source, batch_size, token, tx).await };
        let consumer = async {
            let mut live: Vec<MessageRecord> = Vec::new();
            while let Some(event) = rx.recv().await {
                self.apply_fetch_event(token, &mut live, event);
            }
        };
        let (result, ()) = tokio::join!(producer, consumer);
        let records = result?;
        token.check()?;

        let shown = Arc::new(records.clone());
        self.publish(token, |s| {
            s.status = SyncStatus::Processing;
            s.progress_phase = Some(ProgressPhase::Processing);
            s.records = shown;
        });

        self.commit(token, records).await
    }

    async fn run_incremental_fetch(
        &self,
        source: &dyn MessageSource,
        token: &CancelToken,
    ) -> Result<(), SyncError> {
        let store = &self.inner.store;
        let known: HashSet<String> = store
            .load_message_ids()
            .await
            .map_err(SyncError::Store)?
            .into_iter()
            .collect();
        token.check()?;
        let existing = store.load_records().await.map_err(SyncError::Store)?;
        token.check()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let batch_size = self.inner.config.batch_size;
        let known = &known;

        let producer =
            async move { fetch_new_messages(source, known, batch_size, token, tx).await };
        let consumer = async {
            let mut live = Vec::new();
            while let Some(event) = rx.recv().await {
                self.apply_fetch_event(token, &mut live, event);
            }
        };
        let (result, ()) = tokio::join!(producer, consumer);
        let fresh = result?;
        token.check()?;

        log::info!(
            "Merging {} new records into {} cached",
            fresh.len(),
            existing.len()
        );
        self.commit(token, merge_records(fresh, existing)).await
    }

    /// Progress goes straight to state; each batch rebuilds the live tree.
    fn apply_fetch_event(&self, token: &CancelToken, live: &mut Vec<MessageRecord>, event: FetchEvent) {
        match event {
            FetchEvent::Progress { count, phase } => {
                self.publish(token, |s| {
                    s.progress = count;
                    s.progress_phase = Some(phase);
                });
            }
            FetchEvent::Batch(batch) => {
                live.extend(batch);
                let hierarchy = group_records(live);
                let records = Arc::new(live.clone());
                self.publish(token, |s| {
                    seed_fallback_colors(&hierarchy, &mut s.domain_colors);
                    s.records = records;
                    s.hierarchy = Arc::new(hierarchy);
                });
            }
        }
    }

    /// Persist a finished record set, publish `Done` and kick off enrichment.
    async fn commit(&self, token: &CancelToken, records: Vec<MessageRecord>) -> Result<(), SyncError> {
        let store = &self.inner.store;
        let hierarchy = group_records(&records);
        let ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.message_id.clone())
            .collect();

        self.guarded(token, store.save_records(records.clone())).await?;
        self.guarded(token, store.save_message_ids(&ids)).await?;
        self.guarded(token, store.save_last_fetch(now_millis())).await?;
        self.guarded(token, store.save_hierarchy(&hierarchy)).await?;

        // Enrichment may have landed during the writes above; merge, never
        // replace.
        let mut enrich = Vec::new();
        let seeded = self.publish(token, |s| {
            seed_fallback_colors(&hierarchy, &mut s.domain_colors);
            enrich = self.visible_without_favicon(&hierarchy, &s.domain_colors);
        });
        if !seeded {
            return Err(SyncError::Cancelled);
        }
        self.persist_colors(token).await?;

        log::info!(
            "Sync complete: {} records across {} domains",
            records.len(),
            hierarchy.len()
        );
        let count = records.len();
        let records = Arc::new(records);
        let hierarchy = Arc::new(hierarchy);
        self.publish(token, |s| {
            s.status = SyncStatus::Done;
            s.progress = count;
            s.progress_phase = None;
            s.records = records;
            s.hierarchy = hierarchy;
            s.error = None;
        });

        self.spawn_enrichment(token.clone(), enrich);
        Ok(())
    }

    // -- enrichment ----------------------------------------------------------

    /// Top-level domains a user can see right now that still lack a favicon.
    fn visible_without_favicon(&self, hierarchy: &[DomainNode], colors: &DomainColors) -> Vec<String> {
        let visible: Vec<String> = aggregate_others(
            domain_level(hierarchy),
            CountFilter::All,
            &self.inner.config.others_label,
        )
        .into_iter()
        .filter(|n| !n.is_others())
        .map(|n| n.id().to_string())
        .collect();
        missing_favicons(visible, colors)
    }

    fn spawn_enrichment(&self, token: CancelToken, domains: Vec<String>) {
        if domains.is_empty() {
            return;
        }
        let this = self.clone();
        self.track(tokio::spawn(async move {
            this.enrich(token, domains).await;
        }));
    }

    /// Merge each favicon color into state and the cache as it arrives.
    async fn enrich(&self, token: CancelToken, domains: Vec<String>) {
        if domains.is_empty() {
            return;
        }
        log::debug!("Enriching {} domains", domains.len());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = Arc::clone(&self.inner.favicons);
        let producer = run_enrichment(
            source.as_ref(),
            domains,
            self.inner.config.favicon_concurrency,
            token.clone(),
            tx,
        );
        let consumer = async {
            while let Some(EnrichmentEvent { domain, result }) = rx.recv().await {
                let favicon = match result {
                    Ok(favicon) => favicon,
                    Err(e) => {
                        log::debug!("No favicon for {}: {}", domain, e);
                        continue;
                    }
                };

                let applied = self.publish(&token, |s| {
                    s.domain_colors.insert(
                        domain.clone(),
                        DomainColorInfo {
                            color: favicon.color,
                            favicon_url: Some(favicon.url),
                        },
                    );
                });
                if !applied {
                    return;
                }
                if let Err(e) = self.persist_colors(&token).await {
                    if e != SyncError::Cancelled {
                        log::warn!("Failed to cache color for {}: {}", domain, e);
                    }
                }
            }
        };
        tokio::join!(producer, consumer);
    }

    // -- state plumbing ------------------------------------------------------

    /// Claim the state machine for a new operation.
    fn begin(&self, token: &CancelToken, status: SyncStatus, phase: ProgressPhase) -> Result<(), SyncError> {
        let mut outcome = Ok(());
        self.inner.state.send_if_modified(|s| {
            if token.is_cancelled() {
                outcome = Err(SyncError::Cancelled);
                return false;
            }
            if is_busy(s.status) {
                outcome = Err(SyncError::Busy);
                return false;
            }
            s.status = status;
            s.progress = 0;
            s.progress_phase = Some(phase);
            s.error = None;
            true
        });
        outcome
    }

    /// Apply `update` unless `token` has been cancelled. Returns whether it
    /// was applied.
    fn publish<F>(&self, token: &CancelToken, update: F) -> bool
    where
        F: FnOnce(&mut SyncState),
    {
        self.inner.state.send_if_modified(|s| {
            if token.is_cancelled() {
                return false;
            }
            update(s);
            true
        })
    }

    /// Surface a failed operation as `Error`, unless it was cancelled or
    /// never got to run.
    fn finish<T>(&self, token: &CancelToken, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match result {
            Ok(value) => Ok(value),
            Err(SyncError::Cancelled) => {
                log::info!("Sync operation cancelled");
                Err(SyncError::Cancelled)
            }
            Err(SyncError::Busy) => Err(SyncError::Busy),
            Err(e) => {
                log::error!("Sync failed: {}", e);
                let message = e.to_string();
                self.publish(token, |s| {
                    s.status = SyncStatus::Error;
                    s.progress_phase = None;
                    s.error = Some(message);
                });
                Err(e)
            }
        }
    }

    /// Run one cache write unless a reset got there first.
    async fn guarded<Fut>(&self, token: &CancelToken, write: Fut) -> Result<(), SyncError>
    where
        Fut: Future<Output = Result<(), String>>,
    {
        let _gate = self.inner.persist_gate.read().await;
        token.check()?;
        write.await.map_err(SyncError::Store)
    }

    /// Write the color map exactly as state holds it once the write runs.
    async fn persist_colors(&self, token: &CancelToken) -> Result<(), SyncError> {
        let _gate = self.inner.persist_gate.read().await;
        let _serial = self.inner.color_writes.lock().await;
        token.check()?;
        let colors = self.inner.state.borrow().domain_colors.clone();
        self.inner
            .store
            .save_domain_colors(&colors)
            .await
            .map_err(SyncError::Store)
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.inner.background.lock() {
            Ok(mut tasks) => {
                tasks.retain(|h| !h.is_finished());
                tasks.push(handle);
            }
            Err(_) => log::warn!("Background task list poisoned; task runs untracked"),
        }
    }
}

fn is_busy(status: SyncStatus) -> bool {
    matches!(
        status,
        SyncStatus::Restoring | SyncStatus::Fetching | SyncStatus::Processing
    )
}

/// Fold cached colors into `colors`. An entry that already has a favicon
/// is newer than anything cached and stays.
fn adopt_cached_colors(colors: &mut DomainColors, cached: DomainColors) {
    for (id, info) in cached {
        let keep = colors.get(&id).is_some_and(|c| c.favicon_url.is_some());
        if !keep {
            colors.insert(id, info);
        }
    }
}

fn missing_favicons(ids: Vec<String>, colors: &DomainColors) -> Vec<String> {
    ids.into_iter()
        .filter(|id| id != crate::models::OTHERS_ID)
        .filter(|id| colors.get(id).map_or(true, |c| c.favicon_url.is_none()))
        .collect()
}

/// `fresh` in front of `existing`, dropping any record whose message id was
/// already taken. Records without an id are always kept.
pub fn merge_records(fresh: Vec<MessageRecord>, existing: Vec<MessageRecord>) -> Vec<MessageRecord> {
    let mut seen = HashSet::new();
    fresh
        .into_iter()
        .chain(existing)
        .filter(|r| match &r.message_id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        })
        .collect()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::favicon::tests::{png, MapSource};
    use crate::fetch::tests::FakeMailbox;
    use crate::gmail::{MessageMetadata, MessagePage};

    fn favicons_for(domains: &[(&str, [u8; 3])]) -> Arc<dyn FaviconSource> {
        let images: HashMap<String, Vec<u8>> = domains
            .iter()
            .map(|(d, rgb)| (format!("primary/{d}"), png(*rgb, 16)))
            .collect();
        Arc::new(MapSource { images })
    }

    fn orchestrator(store: StoreHandle, favicons: Arc<dyn FaviconSource>) -> SyncOrchestrator {
        SyncOrchestrator::new(store, favicons, AppConfig::default())
    }

    fn mailbox(pages: &[&[(&str, &str, bool)]]) -> Arc<dyn MessageSource> {
        Arc::new(FakeMailbox::with_messages(pages))
    }

    /// Blocks every call until the test hands out permits.
    struct Gated<S> {
        inner: S,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl MessageSource for Gated<FakeMailbox> {
        async fn list_message_ids(&self, page_token: Option<&str>) -> Result<MessagePage, SyncError> {
            let _permit = self.gate.acquire().await.expect("gate open");
            self.inner.list_message_ids(page_token).await
        }

        async fn get_message_metadata(&self, id: &str) -> Result<Option<MessageMetadata>, SyncError> {
            self.inner.get_message_metadata(id).await
        }
    }

    #[async_trait]
    impl FaviconSource for Gated<MapSource> {
        fn candidate_urls(&self, domain: &str) -> Vec<String> {
            self.inner.candidate_urls(domain)
        }

        async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, String> {
            let _permit = self.gate.acquire().await.map_err(|e| e.to_string())?;
            self.inner.fetch_image(url).await
        }
    }

    /// Remembers every image URL asked for.
    struct Counted {
        inner: MapSource,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FaviconSource for Counted {
        fn candidate_urls(&self, domain: &str) -> Vec<String> {
            self.inner.candidate_urls(domain)
        }

        async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, String> {
            self.fetched.lock().expect("lock").push(url.to_string());
            self.inner.fetch_image(url).await
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn operations_can_be_spawned() {
        let sync = orchestrator(StoreHandle::open_in_memory().expect("open store"), favicons_for(&[]));
        assert_send(&sync.restore());
        assert_send(&sync.full_fetch(mailbox(&[])));
        assert_send(&sync.incremental_fetch(mailbox(&[])));
        assert_send(&sync.enrich_domains(vec!["x.com".into()]));
        assert_send(&sync.reset());
        assert_send(&sync.settle());
    }

    #[tokio::test]
    async fn full_fetch_persists_and_enriches() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let sync = orchestrator(store.clone(), favicons_for(&[("github.com", [0x20, 0x60, 0xc0])]));

        sync.full_fetch(mailbox(&[
            &[("3", "GitHub <noreply@github.com>", true), ("2", "a@news.shop.com", false)],
            &[("1", "b@mail.github.com", false)],
        ]))
        .await
        .expect("full fetch");

        let state = sync.snapshot();
        assert_eq!(state.status, SyncStatus::Done);
        assert_eq!(state.progress, 3);
        assert_eq!(state.records.len(), 3);
        assert_eq!(state.hierarchy.len(), 2);
        for domain in state.hierarchy.iter() {
            assert!(state.domain_colors.contains_key(&domain.id));
        }

        sync.settle().await;
        let colors = sync.snapshot().domain_colors;
        assert_eq!(colors["github.com"].color, "#2060c0");
        assert_eq!(colors["github.com"].favicon_url.as_deref(), Some("primary/github.com"));
        assert!(colors["shop.com"].favicon_url.is_none());

        let view = sync.view(&[], CountFilter::All);
        assert_eq!(view.total_count, 3);
        assert_eq!(view.tiles[0].id, "github.com");
        assert_eq!(view.tiles[0].favicon_url.as_deref(), Some("primary/github.com"));

        assert_eq!(store.load_records().await.expect("records").len(), 3);
        assert_eq!(store.load_message_ids().await.expect("ids"), vec!["3", "2", "1"]);
        assert!(sync.last_fetch().await.expect("last fetch").is_some());
        let cached_colors = store
            .load_domain_colors()
            .await
            .expect("colors")
            .expect("colors cached");
        assert_eq!(cached_colors["github.com"].color, "#2060c0");
    }

    #[tokio::test]
    async fn each_batch_republishes_a_seeded_hierarchy() {
        let sync = orchestrator(StoreHandle::open_in_memory().expect("open store"), favicons_for(&[]));
        let token = sync.inner.cancel.token();
        let rec = |id: &str, from: &str| MessageRecord {
            from: from.into(),
            name: from.into(),
            unread: true,
            message_id: Some(id.into()),
        };
        let mut live = Vec::new();

        sync.apply_fetch_event(&token, &mut live, FetchEvent::Batch(vec![rec("1", "a@x.com")]));
        let state = sync.snapshot();
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.hierarchy.len(), 1);
        assert!(state.domain_colors.contains_key("x.com"));

        sync.apply_fetch_event(
            &token,
            &mut live,
            FetchEvent::Batch(vec![rec("2", "b@y.com"), rec("3", "c@x.com")]),
        );
        sync.apply_fetch_event(
            &token,
            &mut live,
            FetchEvent::Progress {
                count: 3,
                phase: ProgressPhase::Fetching,
            },
        );
        let state = sync.snapshot();
        assert_eq!(state.records.len(), 3);
        assert_eq!(state.hierarchy.len(), 2);
        assert_eq!(state.progress, 3);
        assert!(state.domain_colors.contains_key("y.com"));

        sync.inner.cancel.cancel_all();
        sync.apply_fetch_event(&token, &mut live, FetchEvent::Batch(vec![rec("4", "d@z.com")]));
        assert_eq!(sync.snapshot().hierarchy.len(), 2);
    }

    #[tokio::test]
    async fn restore_adopts_cached_hierarchy_before_records() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let first = orchestrator(store.clone(), favicons_for(&[]));
        first
            .full_fetch(mailbox(&[&[("1", "a@x.com", true), ("2", "b@y.com", false)]]))
            .await
            .expect("full fetch");
        first.settle().await;
        let cached = first.snapshot().hierarchy;

        let second = orchestrator(store, favicons_for(&[]));
        assert_eq!(second.restore().await.expect("restore"), RestoreOutcome::Restored);
        let state = second.snapshot();
        assert_eq!(state.status, SyncStatus::Done);
        assert_eq!(state.hierarchy, cached);
        assert_eq!(state.domain_colors.len(), 2);

        second.settle().await;
        assert_eq!(second.snapshot().records.len(), 2);
    }

    #[tokio::test]
    async fn restore_rebuilds_from_records_and_caches_hierarchy() {
        let store = StoreHandle::open_in_memory().expect("open store");
        store
            .save_records(vec![MessageRecord {
                from: "a@mail.example.co.uk".into(),
                name: "A".into(),
                unread: true,
                message_id: Some("1".into()),
            }])
            .await
            .expect("seed records");

        let sync = orchestrator(store.clone(), favicons_for(&[]));
        assert_eq!(sync.restore().await.expect("restore"), RestoreOutcome::Restored);
        let state = sync.snapshot();
        assert_eq!(state.status, SyncStatus::Done);
        assert_eq!(state.hierarchy[0].id, "example.co.uk");
        assert_eq!(state.records.len(), 1);

        let cached = store.load_hierarchy().await.expect("load").expect("hierarchy cached");
        assert_eq!(cached, *state.hierarchy);
    }

    #[tokio::test]
    async fn restore_with_empty_cache_leaves_state_alone() {
        let sync = orchestrator(StoreHandle::open_in_memory().expect("open store"), favicons_for(&[]));
        assert_eq!(sync.restore().await.expect("restore"), RestoreOutcome::NoData);
        assert_eq!(sync.snapshot().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn incremental_fetch_prepends_without_duplicates() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let sync = orchestrator(store.clone(), favicons_for(&[]));
        sync.full_fetch(mailbox(&[&[("2", "a@x.com", false), ("1", "b@y.com", false)]]))
            .await
            .expect("full fetch");

        sync.incremental_fetch(mailbox(&[
            &[("4", "c@z.com", true), ("3", "a@x.com", true)],
            &[("2", "a@x.com", false), ("1", "b@y.com", false)],
        ]))
        .await
        .expect("incremental fetch");

        let state = sync.snapshot();
        assert_eq!(state.status, SyncStatus::Done);
        let ids: Vec<&str> = state
            .records
            .iter()
            .filter_map(|r| r.message_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["4", "3", "2", "1"]);

        let senders: u64 = state
            .hierarchy
            .iter()
            .map(|d| d.count(CountFilter::All))
            .sum();
        assert_eq!(senders, 4);

        // reload sees the same thing
        let reloaded = store.load_records().await.expect("records");
        assert_eq!(reloaded.len(), 4);
        assert_eq!(store.load_message_ids().await.expect("ids").len(), 4);
    }

    #[tokio::test]
    async fn auth_expiry_lands_in_error_and_fetch_can_retry() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let sync = orchestrator(store.clone(), favicons_for(&[]));

        let mut expired = FakeMailbox::with_messages(&[&[("1", "a@x.com", true)]]);
        expired.list_error = Some(SyncError::AuthExpired);
        let err = sync.full_fetch(Arc::new(expired)).await.expect_err("auth failure");
        assert!(err.is_auth_expired());

        let state = sync.snapshot();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.error.as_deref(), Some("AUTH_EXPIRED"));
        assert!(!store.has_any_records().await.expect("exists"));

        sync.full_fetch(mailbox(&[&[("1", "a@x.com", true)]]))
            .await
            .expect("retry");
        let state = sync.snapshot();
        assert_eq!(state.status, SyncStatus::Done);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn second_fetch_while_busy_is_rejected() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let sync = orchestrator(store, favicons_for(&[]));
        let gate = Arc::new(Semaphore::new(0));
        let slow: Arc<dyn MessageSource> = Arc::new(Gated {
            inner: FakeMailbox::with_messages(&[&[("1", "a@x.com", true)]]),
            gate: Arc::clone(&gate),
        });

        let running = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.full_fetch(slow).await })
        };
        while sync.snapshot().status != SyncStatus::Fetching {
            tokio::task::yield_now().await;
        }

        let err = sync
            .incremental_fetch(mailbox(&[]))
            .await
            .expect_err("busy");
        assert_eq!(err, SyncError::Busy);
        assert_eq!(sync.snapshot().status, SyncStatus::Fetching);

        gate.add_permits(10);
        running.await.expect("join").expect("full fetch");
        assert_eq!(sync.snapshot().status, SyncStatus::Done);
    }

    #[tokio::test]
    async fn reset_wipes_state_and_cache() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let sync = orchestrator(store.clone(), favicons_for(&[]));
        sync.full_fetch(mailbox(&[&[("1", "a@x.com", true)]]))
            .await
            .expect("full fetch");

        sync.reset().await.expect("reset");

        let state = sync.snapshot();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.hierarchy.is_empty());
        assert!(state.domain_colors.is_empty());
        assert!(!store.has_any_records().await.expect("exists"));
        assert_eq!(store.load_hierarchy().await.expect("load"), None);
        assert_eq!(sync.last_fetch().await.expect("last fetch"), None);
    }

    #[tokio::test]
    async fn cancelled_fetch_writes_nothing() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let sync = orchestrator(store.clone(), favicons_for(&[]));
        let gate = Arc::new(Semaphore::new(0));
        let slow: Arc<dyn MessageSource> = Arc::new(Gated {
            inner: FakeMailbox::with_messages(&[&[("1", "a@x.com", true)]]),
            gate: Arc::clone(&gate),
        });

        let running = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.full_fetch(slow).await })
        };
        while sync.snapshot().status != SyncStatus::Fetching {
            tokio::task::yield_now().await;
        }

        sync.reset().await.expect("reset");
        gate.add_permits(10);
        let err = running.await.expect("join").expect_err("cancelled");
        assert_eq!(err, SyncError::Cancelled);

        assert_eq!(sync.snapshot().status, SyncStatus::Idle);
        assert!(!store.has_any_records().await.expect("exists"));
    }

    #[tokio::test]
    async fn enrichment_from_before_reset_is_discarded() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let gate = Arc::new(Semaphore::new(0));
        let mut images = HashMap::new();
        images.insert("primary/x.com".to_string(), png([0xd0, 0x10, 0x10], 16));
        let favicons: Arc<dyn FaviconSource> = Arc::new(Gated {
            inner: MapSource { images },
            gate: Arc::clone(&gate),
        });
        let sync = orchestrator(store.clone(), favicons);

        sync.full_fetch(mailbox(&[&[("1", "a@x.com", true)]]))
            .await
            .expect("full fetch");
        sync.reset().await.expect("reset");

        gate.add_permits(10);
        sync.settle().await;

        assert!(sync.snapshot().domain_colors.is_empty());
        assert_eq!(store.load_domain_colors().await.expect("load"), None);
    }

    #[tokio::test]
    async fn manual_enrichment_skips_known_favicons_and_others() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let images: HashMap<String, Vec<u8>> = [
            ("primary/x.com".to_string(), png([0x10, 0x80, 0x40], 16)),
            ("primary/y.com".to_string(), png([0x80, 0x10, 0x40], 16)),
        ]
        .into_iter()
        .collect();
        let counted = Arc::new(Counted {
            inner: MapSource { images },
            fetched: Mutex::new(Vec::new()),
        });
        let sync = orchestrator(store, Arc::clone(&counted) as Arc<dyn FaviconSource>);
        sync.full_fetch(mailbox(&[&[("1", "a@x.com", true), ("2", "b@y.com", true)]]))
            .await
            .expect("full fetch");
        sync.settle().await;
        counted.fetched.lock().expect("lock").clear();

        sync.enrich_domains(vec![
            "y.com".into(),
            crate::models::OTHERS_ID.into(),
            "missing.com".into(),
        ])
        .await;

        // only the unknown domain goes out, through both providers
        let fetched = counted.fetched.lock().expect("lock").clone();
        assert_eq!(fetched, vec!["primary/missing.com", "secondary/missing.com"]);

        let colors = sync.snapshot().domain_colors;
        assert_eq!(colors["y.com"].color, "#801040");
        assert!(!colors.contains_key(crate::models::OTHERS_ID));
        assert!(!colors.contains_key("missing.com"));
    }

    #[tokio::test]
    async fn favicon_landing_during_commit_survives() {
        let store = StoreHandle::open_in_memory().expect("open store");
        let gate = Arc::new(Semaphore::new(0));
        let mut images = HashMap::new();
        images.insert("primary/h1.com".to_string(), png([0x30, 0x90, 0x30], 16));
        let favicons: Arc<dyn FaviconSource> = Arc::new(Gated {
            inner: MapSource { images },
            gate: Arc::clone(&gate),
        });
        let sync = orchestrator(store.clone(), favicons);

        // big.com dominates; the four 1% domains end up in Others
        let owned: Vec<(String, String)> = (0..100)
            .map(|i| {
                let from = if i < 4 {
                    format!("a@h{}.com", i + 1)
                } else {
                    "a@big.com".to_string()
                };
                (i.to_string(), from)
            })
            .collect();
        let page: Vec<(&str, &str, bool)> = owned
            .iter()
            .map(|(id, from)| (id.as_str(), from.as_str(), false))
            .collect();

        sync.full_fetch(mailbox(&[page.as_slice()])).await.expect("first fetch");

        let opened = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.enrich_domains(vec!["h1.com".into()]).await })
        };
        let refetch = {
            let sync = sync.clone();
            let source = mailbox(&[page.as_slice()]);
            tokio::spawn(async move { sync.full_fetch(source).await })
        };
        while sync.snapshot().status != SyncStatus::Processing && !refetch.is_finished() {
            tokio::task::yield_now().await;
        }

        gate.add_permits(100);
        opened.await.expect("join enrichment");
        refetch.await.expect("join").expect("second fetch");
        sync.settle().await;

        let colors = sync.snapshot().domain_colors;
        assert_eq!(colors["h1.com"].favicon_url.as_deref(), Some("primary/h1.com"));
        assert_eq!(colors["h1.com"].color, "#309030");
        let cached = store
            .load_domain_colors()
            .await
            .expect("load")
            .expect("colors cached");
        assert_eq!(cached["h1.com"].favicon_url.as_deref(), Some("primary/h1.com"));
        assert!(cached.contains_key("big.com"));
    }

    #[test]
    fn merge_keeps_fresh_first_and_drops_repeats() {
        let rec = |id: Option<&str>, from: &str| MessageRecord {
            from: from.into(),
            name: from.into(),
            unread: false,
            message_id: id.map(str::to_string),
        };
        let merged = merge_records(
            vec![rec(Some("3"), "new@x.com"), rec(Some("2"), "dup@x.com")],
            vec![rec(Some("2"), "old@x.com"), rec(None, "anon@x.com"), rec(Some("1"), "a@x.com")],
        );
        let froms: Vec<&str> = merged.iter().map(|r| r.from.as_str()).collect();
        assert_eq!(froms, vec!["new@x.com", "dup@x.com", "anon@x.com", "a@x.com"]);
    }
}
