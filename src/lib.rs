pub mod colors;
pub mod config;
pub mod error;
pub mod favicon;
pub mod fetch;
pub mod gmail;
pub mod grouping;
pub mod models;
pub mod session;
pub mod store;
pub mod sync;
pub mod treemap;
pub mod view;

// Types most embedders need without reaching into modules
pub use config::AppConfig;
pub use error::SyncError;
pub use favicon::{FaviconSource, HttpFaviconSource};
pub use gmail::{GmailClient, MessageSource};
pub use models::{CountFilter, DomainNode, HierarchyNode, MessageRecord, SyncState, SyncStatus};
pub use session::Session;
pub use store::StoreHandle;
pub use sync::{RestoreOutcome, SyncOrchestrator};
pub use view::{build_treemap_view, TreemapView};
