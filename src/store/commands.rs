use tokio::sync::oneshot;

use crate::models::MessageRecord;

pub(super) enum StoreCmd {
    SaveRecords {
        records: Vec<MessageRecord>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    LoadRecords {
        reply: oneshot::Sender<Result<Vec<MessageRecord>, String>>,
    },
    HasAnyRecords {
        reply: oneshot::Sender<Result<bool, String>>,
    },
    SaveMeta {
        key: &'static str,
        value: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    LoadMeta {
        key: &'static str,
        reply: oneshot::Sender<Result<Option<String>, String>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<(), String>>,
    },
}
