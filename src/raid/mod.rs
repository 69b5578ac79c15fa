//! RAID lifecycle: setup, expansion, replacement, failsafe transition, status

pub mod manager;
pub mod transition;

pub use manager::{ManagerConfig, RaidManager};
pub use transition::{
    ExpansionMarker, ExpansionMarkerStore, MarkerStore, ReplacementMarker,
    ReplacementMarkerStore, TransitionMarker, TransitionMarkerStore,
};
