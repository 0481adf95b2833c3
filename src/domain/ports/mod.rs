//! Port trait definitions.
//!
//! Async interfaces the infrastructure adapters implement: the
//! completion backend and the persistence store. The domain depends on
//! these, never on a concrete backend.

pub mod completion;
pub mod store;

pub use completion::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse, Purpose,
};
pub use store::Store;
