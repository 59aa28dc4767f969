//! Repository layer for database operations.

mod activity;
mod outbox;
mod token;
mod transaction;

pub use activity::ActivityRepository;
pub use outbox::OutboxRepository;
pub use token::TokenRepository;
pub use transaction::TransactionRepository;
