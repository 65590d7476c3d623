pub mod data;
pub mod payloads;

pub use data::{Priority, SavedMeta, ScanResult, SlideRecord, SlideState, Status};
