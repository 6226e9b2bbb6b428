mod memory;
mod repositories;
mod types;

pub use memory::{LedgerSnapshot, MemoryHeadRepository, MemoryLedgerStore};
pub use repositories::{FileHeadRepository, HeadRepository, LedgerStore, NftChanges, StoreError};
pub use types::*;
