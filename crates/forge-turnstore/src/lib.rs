pub mod fs;
pub mod memory;
pub mod store;
pub mod types;

pub use fs::FsTurnStore;
pub use memory::MemoryTurnStore;
pub use store::{ArtifactStore, TurnStore, TurnStoreError, TurnStoreResult, TypedTurnStore};
pub use types::{
    AppendTurnRequest, BlobHash, ContextId, CorrelationMetadata, RegistryBundle, StoreContext,
    StoredTurn, StoredTurnEnvelope, StoredTurnRef, TurnId, agent_idempotency_key,
    attractor_idempotency_key,
};
