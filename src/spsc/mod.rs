mod invariants;
mod queue;
mod sector;

pub use queue::{Consumer, Producer, SectorQueue};
pub use sector::Sector;
