//! Owner status writes.

use tracing::debug;

use crate::controller::ConvergeContext;
use crate::error::{ConvergeError, invalid_spec};
use crate::owner::Owner;
use crate::store::WriteOutcome;

/// Write `updated`'s status if it differs from what `observed` carried.
/// The write is guarded by the version the owner was read at. Returns
/// whether a write happened.
pub async fn write_status(
    ctx: &ConvergeContext,
    observed: &Owner,
    updated: &Owner,
) -> Result<bool, ConvergeError> {
    let status = updated.status_value()?;
    if status == observed.status_value()? {
        return Ok(false);
    }
    let resource = ctx.registry.resource(observed.kind().as_str())?;
    let version = observed
        .resource_version()
        .ok_or_else(|| invalid_spec("owner has no resourceVersion"))?;
    let outcome = ctx
        .store
        .patch_status(
            resource,
            Some(observed.namespace()),
            observed.name(),
            version,
            &status,
        )
        .await?;
    match outcome {
        WriteOutcome::Applied(_) => {
            debug!(owner = %observed.key(), "status written");
            Ok(true)
        }
        WriteOutcome::Conflict => Err(ConvergeError::conflict(
            observed.kind().as_str(),
            observed.name(),
        )),
    }
}
