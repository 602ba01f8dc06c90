// Document record store and the single writer of document status.

pub mod repository;
pub mod state_manager;

pub use repository::{DocumentRepository, InMemoryDocumentRepository, PgDocumentRepository};
pub use state_manager::DocumentStateManager;
