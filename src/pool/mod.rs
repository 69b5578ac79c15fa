//! Pool backends and identity resolution

pub mod memory;
pub mod resolver;
pub mod zfs;

pub use memory::MemoryBackend;
pub use resolver::resolve_owned_pool;
pub use zfs::ZfsBackend;
