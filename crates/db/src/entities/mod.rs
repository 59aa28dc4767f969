//! Database entities.

#![allow(missing_docs)]

pub mod activity;
pub mod outbox_message;
pub mod token;
pub mod transaction;

pub use activity::Entity as Activity;
pub use outbox_message::Entity as OutboxMessage;
pub use token::Entity as Token;
pub use transaction::Entity as Transaction;
