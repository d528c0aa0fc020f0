pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::MemoryLedger;
pub use repository::LedgerRepository;
pub use store::LedgerStore;
