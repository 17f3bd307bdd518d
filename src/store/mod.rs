mod commands;
mod handle;
mod queries;
mod schema;

pub use handle::StoreHandle;

/// Keys of the metadata collection. Values are stored as JSON text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    /// `Vec<String>` of every cached message id.
    MessageIds,
    /// Epoch millis of the last completed fetch.
    LastFetch,
    /// `Vec<DomainNode>` snapshot for instant restore.
    Hierarchy,
    /// `Vec<(String, DomainColorInfo)>`, entries rather than a map.
    DomainColors,
}

impl MetaKey {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaKey::MessageIds => "messageIds",
            MetaKey::LastFetch => "lastFetch",
            MetaKey::Hierarchy => "hierarchy",
            MetaKey::DomainColors => "domainColors",
        }
    }
}
