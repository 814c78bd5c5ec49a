//! Device drivers

pub mod ndi;

pub use ndi::NdiTracker;
