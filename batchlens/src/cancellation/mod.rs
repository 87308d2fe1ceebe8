//! Cancellation support for batch execution.
//!
//! A single [`CancelToken`] is shared by the orchestrator, the dispatch
//! queues, and the retry executor. Cancelling it interrupts pending
//! backoff sleeps and slot waits without touching work that has already
//! produced an outcome.

mod token;

pub use token::CancelToken;
