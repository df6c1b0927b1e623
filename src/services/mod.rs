pub mod orphan_sweep;

pub use orphan_sweep::{OrphanSweepConfig, OrphanSweepService};
