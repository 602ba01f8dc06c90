// External collaborators, consumed through traits so stages can be tested
// against in-process fakes.

pub mod blob;
pub mod breaker;
pub mod classifier;
pub mod extractor;
pub mod transactions;

pub use blob::{BlobStore, LocalBlobStore};
pub use breaker::CircuitBreaker;
pub use classifier::{Classifier, HttpClassifier};
pub use extractor::{HttpTextExtractor, TextExtractor};
pub use transactions::{HttpTransactionGateway, TransactionGateway};
