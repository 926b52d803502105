//! In-memory store implementations for testing and ephemeral deployments.

mod documents;
mod state;

pub use documents::InMemoryDocumentStore;
pub use state::InMemoryStateStore;
