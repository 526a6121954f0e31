//! Garbage collection: GCInfo codec, root sources, safepoints, collector

pub mod collector;
pub mod gcinfo;
pub mod roots;
pub mod safepoint;

pub use collector::{Collector, GcStats};
pub use gcinfo::{GcInfo, GcInfoEncoder, GcInfoError, GcSlot, SlotBase};
pub use roots::{GcInfoIndex, RootVisitor, StaticRootRegistry};
pub use safepoint::{SafepointCoordinator, StopReason};
