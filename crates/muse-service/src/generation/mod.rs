//! Generation task workflow.
//!
//! - [`submit`]: eligibility, charge, persist `pending`, call the provider
//! - [`resolve`]: apply a provider status (poll or callback) to a task
//! - [`persist`]: store the result of a successful task
//! - [`reconcile`]: background sweep over stale tasks
//!
//! Every terminal transition is a single store call that writes its side
//! effect (refund or assets) together with the status, so repeated signals
//! for one task can never refund or persist twice.

pub mod persist;
pub mod reconcile;
pub mod resolve;
pub mod submit;

pub use persist::persist_result;
pub use reconcile::{reconcile_once, spawn_reconciler, ReconcileReport};
pub use resolve::{apply_status, check_status, load_owned_task, Resolution};
pub use submit::{submit_generation, SubmittedTask};

use muse_core::{GenerationTask, LedgerEntry, MuseError};

/// Refund entry owed when `task` fails, if any.
///
/// # Errors
///
/// Returns an error only if the stored charge is not a positive amount.
pub(crate) fn refund_for(
    task: &GenerationTask,
    reason: &str,
) -> Result<Option<LedgerEntry>, MuseError> {
    if !task.refund_owed() {
        return Ok(None);
    }

    LedgerEntry::refund(
        task.user_id,
        task.tokens_charged,
        reason,
        Some(task.id),
        serde_json::json!({ "charge_entry_id": task.charge_entry_id }),
    )
    .map(Some)
}
