pub mod chapters;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod handoff;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod planner;

#[cfg(test)]
pub mod testing;
