pub mod delete;
pub mod dto;
pub mod enqueue;
pub mod get;
pub mod list;
pub mod lock_batch;
pub mod progress;
pub mod purge;
pub mod retry;
pub mod stats;
