//! Cancellable producers that walk a [`MessageSource`] and stream progress
//! and partial results to a consumer over a channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::gmail::{parse_from_header, MessageSource};
use crate::models::{MessageRecord, ProgressPhase};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Owner of the current generation. Bumping it invalidates every
/// outstanding [`CancelToken`].
#[derive(Debug, Clone, Default)]
pub struct CancelSource {
    epoch: Arc<AtomicU64>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for work started now.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            epoch: self.epoch.load(Ordering::SeqCst),
            current: Arc::clone(&self.epoch),
        }
    }

    /// Cancel everything issued so far.
    pub fn cancel_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// Captures the generation an operation started in.
#[derive(Debug, Clone)]
pub struct CancelToken {
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl CancelToken {
    /// A token nothing can cancel.
    pub fn detached() -> Self {
        CancelSource::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.epoch
    }

    /// `Err(Cancelled)` once a reset has happened.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Progress { count: usize, phase: ProgressPhase },
    /// Records completed by the latest metadata batch.
    Batch(Vec<MessageRecord>),
}

fn emit(events: &mpsc::UnboundedSender<FetchEvent>, event: FetchEvent) {
    // A consumer that hung up only loses progress; the producer still
    // returns its full result.
    let _ = events.send(event);
}

/// Full listing of the mailbox followed by batched metadata retrieval.
///
/// Listing runs to exhaustion before the first metadata request. Each batch
/// is emitted as [`FetchEvent::Batch`] once all of its requests settle.
pub async fn fetch_inbox<S>(
    source: &S,
    batch_size: usize,
    cancel: &CancelToken,
    events: mpsc::UnboundedSender<FetchEvent>,
) -> Result<Vec<MessageRecord>, SyncError>
where
    S: MessageSource + ?Sized,
{
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = source.list_message_ids(page_token.as_deref()).await?;
        cancel.check()?;
        ids.extend(page.ids);
        emit(
            &events,
            FetchEvent::Progress {
                count: ids.len(),
                phase: ProgressPhase::Listing,
            },
        );
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    log::info!("Listed {} messages", ids.len());

    let mut records = Vec::with_capacity(ids.len());
    for batch in ids.chunks(batch_size.max(1)) {
        let fetched = fetch_batch(source, batch).await?;
        cancel.check()?;
        records.extend(fetched.iter().cloned());
        emit(
            &events,
            FetchEvent::Progress {
                count: records.len(),
                phase: ProgressPhase::Fetching,
            },
        );
        if !fetched.is_empty() {
            emit(&events, FetchEvent::Batch(fetched));
        }
    }
    log::info!("Fetched metadata for {} of {} messages", records.len(), ids.len());
    Ok(records)
}

/// Messages newer than anything in `known`.
///
/// Listing stops at the first page that contains a known id; only ids seen
/// before it are fetched.
pub async fn fetch_new_messages<S>(
    source: &S,
    known: &HashSet<String>,
    batch_size: usize,
    cancel: &CancelToken,
    events: mpsc::UnboundedSender<FetchEvent>,
) -> Result<Vec<MessageRecord>, SyncError>
where
    S: MessageSource + ?Sized,
{
    let mut new_ids = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = source.list_message_ids(page_token.as_deref()).await?;
        cancel.check()?;
        let mut reached_known = false;
        for id in page.ids {
            if known.contains(&id) {
                reached_known = true;
                break;
            }
            new_ids.push(id);
        }
        match page.next_page_token {
            Some(token) if !reached_known => page_token = Some(token),
            _ => break,
        }
    }

    if new_ids.is_empty() {
        log::info!("No new messages");
        return Ok(Vec::new());
    }

    let mut records = Vec::with_capacity(new_ids.len());
    for batch in new_ids.chunks(batch_size.max(1)) {
        let fetched = fetch_batch(source, batch).await?;
        cancel.check()?;
        records.extend(fetched);
        emit(
            &events,
            FetchEvent::Progress {
                count: records.len(),
                phase: ProgressPhase::Updating,
            },
        );
    }
    log::info!("Fetched {} new messages", records.len());
    Ok(records)
}

/// Issue one batch concurrently and keep the records that came back usable.
///
/// A failed or headerless message is dropped on its own; an expired token
/// aborts the whole fetch since every other request would fail too.
async fn fetch_batch<S>(source: &S, ids: &[String]) -> Result<Vec<MessageRecord>, SyncError>
where
    S: MessageSource + ?Sized,
{
    // Batches are already capped at `batch_size`, so one future per id.
    let results = join_all(ids.iter().map(|id| source.get_message_metadata(id))).await;

    let mut records = Vec::with_capacity(results.len());
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(Some(meta)) => match parse_from_header(&meta.from_header) {
                Some((from, name)) => records.push(MessageRecord {
                    from,
                    name,
                    unread: meta.is_unread,
                    message_id: Some(id.clone()),
                }),
                None => log::debug!("Dropping message {id}: unparseable From header"),
            },
            Ok(None) => log::debug!("Dropping message {id}: no From header"),
            Err(SyncError::AuthExpired) => return Err(SyncError::AuthExpired),
            Err(e) => log::debug!("Dropping message {id}: {e}"),
        }
    }
    Ok(records)
}
