//! Client for the MorphoView slide backend: uploads whole-slide images,
//! keeps the slide records, and drives them through the scan queue.

pub mod api;
pub mod config;
pub mod intake;
pub mod persistence;
pub mod scheduler;
pub mod store;
pub mod views;

#[cfg(test)]
mod testing;
