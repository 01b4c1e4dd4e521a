pub mod api;
pub mod expiry;
pub mod memory;
pub mod models;
pub mod monitor;
pub mod pg;
pub mod reports;
pub mod scheduler;
pub mod selector;
pub mod service;
pub mod store;

pub use memory::MemoryLedgerStore;
pub use pg::{PgLedgerStore, PgLedgerStoreConfig};
pub use selector::SelectionPolicy;
pub use service::{EngineConfig, QuotaEngine};
pub use store::LedgerStore;
