//! Best-effort teardown: try, log, continue.
//!
//! Every disposal path runs its steps through [`best_effort`] so that a failed
//! step never stops the steps after it.

use std::future::Future;
use tracing::warn;

/// Awaits a teardown step and swallows its error after logging it.
///
/// Returns whether the step succeeded.
pub(crate) async fn best_effort<F, T>(action: &str, step: F) -> bool
where
    F: Future<Output = anyhow::Result<T>>,
{
    match step.await {
        Ok(_) => true,
        Err(e) => {
            warn!(action, error = %format!("{e:#}"), "Cleanup step failed, continuing");
            false
        }
    }
}
