pub mod embeddings;
pub mod loader;
pub mod retriever;
pub mod topic_store;

pub use self::embeddings::{build_embedder, Embedder};
pub use self::loader::DocumentLoader;
pub use self::retriever::{Retriever, ScanRetriever};
pub use self::topic_store::{MemoryTopicStore, TopicStore};
