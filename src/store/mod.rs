//! Persistence/realtime collaborator used as the signal transport.

pub mod memory;
pub mod traits;

pub use memory::MemorySignalStore;
pub use traits::{SignalStore, StoreEvent, SubscriptionStatus};
