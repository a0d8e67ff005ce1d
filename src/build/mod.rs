//! Image build pipeline
//!
//! A [`Conveyor`] expands image declarations into stage chains and runs an
//! ordered list of phases over them:
//! - signatures: sign stages, prune empty ones, bind cached artifacts
//! - renew: evict stale stored artifacts
//! - prepare / build: build and publish missing stages under stage locks
//! - check: fail instead of building
//! - tag / push / publish / export: give final images external names
//!
//! [`run_with_cache_reset`] restarts a run whose cached lookups went stale.

mod conveyor;
mod image;
pub mod phase;
mod report;
mod retry;
mod tagging;

pub use conveyor::{BuildContext, Command, Conveyor, ConveyorOptions, ConveyorServices};
pub use image::{Image, NAMELESS};
pub use report::{BuildReport, ImageReport, StageRecord};
pub use retry::run_with_cache_reset;
pub use tagging::{resolve_tags, slugify_tag, TagSpec, TagStrategy, TaggingOptions};
