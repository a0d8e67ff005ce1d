//! Conveyor - content-addressed multi-stage image builds
//!
//! Splits each declared image into a chain of stages, signs every stage
//! from its inputs and its predecessor, and reuses stored artifacts with
//! matching signatures. Concurrent runs on one host or across a fleet
//! share the stages storage and serialize on per-signature locks.

pub mod build;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod git;
pub mod lock;
pub mod registry;
pub mod signature;
pub mod stage;
pub mod storage;

pub use error::{ConveyorError, ConveyorResult};
