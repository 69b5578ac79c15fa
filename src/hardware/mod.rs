//! Hardware probing and size normalization

pub mod prober;
pub mod sizing;

pub use prober::{LsblkProber, StaticProber};
pub use sizing::rounded_device_size;
