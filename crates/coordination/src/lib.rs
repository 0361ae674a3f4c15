pub mod kv;
pub mod lock;
pub mod memory;
pub mod publisher;
pub mod registry;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use kv::{Coordinator, EventType, KeyValue, LeaseId, LeaseKeeper, WatchEvent, WatchStream};
pub use lock::TaskLock;
pub use memory::MemoryCoordinator;
pub use publisher::TaskPublisher;
pub use registry::AgentRegister;
