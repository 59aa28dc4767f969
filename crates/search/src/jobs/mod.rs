//! Search job handlers.

pub mod backfill;
pub mod cdc;
pub mod join;
pub mod reindex;

pub use backfill::{BACKFILL_QUEUE, TokenBackfill, TokenBackfillJob};
pub use cdc::{CDC_QUEUE, CdcChangeJob};
pub use join::{
    JOIN_QUEUE, JOIN_RETRY_STEP, JoinActivityTransaction, JoinActivityTransactionJob, JoinState,
    JoinStore, MAX_JOIN_ATTEMPTS, MemoryJoinStore, RepositoryJoinStore,
};
pub use reindex::{
    REINDEX_ACTIVITY_QUEUE, REINDEX_TOKEN_QUEUE, ReindexActivity, ReindexActivityJob,
    ReindexToken, ReindexTokenJob,
};
