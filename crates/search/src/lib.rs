//! Search indexing pipeline for blockfeed.
//!
//! Row changes flow in through [`cdc`], become reindex or join jobs, and end
//! up as keys in per-domain [`pending`] queues. The [`indexer`] drains those
//! queues into the search index on its own schedule.

pub mod cdc;
pub mod documents;
pub mod index;
pub mod indexer;
pub mod jobs;
pub mod pending;
pub mod source;

pub use cdc::{
    ActivityChangeHandler, CdcDispatcher, ChangeHandler, ChangeOp, ChangeRecord,
    TokenChangeHandler, changed_fields,
};
pub use documents::{ActivityDocument, TokenDocument, document_id};
pub use index::{
    BulkOp, IndexError, ItemOutcome, MemoryIndex, OpenSearchIndex, SearchIndex, classify,
    index_name,
};
pub use indexer::{BatchIndexer, DrainReport, IndexerSettings};
pub use pending::{Domain, EventKind, PendingEvent, PendingEventQueue};
pub use source::{ActivitySource, EntitySource, KeyScan, MemorySource, TokenSource};
