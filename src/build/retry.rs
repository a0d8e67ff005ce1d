//! Restart runs whose stages storage cache went stale

use super::conveyor::{Command, Conveyor};
use crate::error::ConveyorResult;
use crate::storage::StagesStorageCache;
use tracing::warn;

/// Run `command` on a conveyor from `make`, starting over with an empty
/// cache and a fresh conveyor whenever the run asks for a cache reset.
///
/// Any other error ends the loop. Returns the conveyor of the successful run.
pub async fn run_with_cache_reset<F>(
    cache: &StagesStorageCache,
    mut make: F,
    command: Command,
) -> ConveyorResult<Conveyor>
where
    F: FnMut() -> ConveyorResult<Conveyor>,
{
    let mut attempt = 1;
    loop {
        let mut conveyor = make()?;
        match conveyor.run(command).await {
            Ok(()) => return Ok(conveyor),
            Err(e) if e.is_cache_reset() => {
                warn!("{} (attempt {}), restarting with an empty cache", e, attempt);
                cache.invalidate();
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
