pub mod assembler;
pub mod store;

pub use self::assembler::ContextAssembler;
pub use self::store::{ConversationStore, MemoryConversationStore};
