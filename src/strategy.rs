//! Failure-to-strategy selection.
//!
//! Given a classified error and how many times this tool has already failed
//! in this run, decide whether to retry, substitute an alternative tool,
//! skip the step, or require manual intervention.

use crate::error::ErrorClass;
use crate::types::Strategy;

/// Pick a remediation strategy for a failed step.
///
/// `attempt_count` is the number of attempts already made (including the
/// one that just failed); `max_retries` is the step's configured ceiling.
///
/// system/module errors and auth/
/// permission errors always need a human; shape/character-limit errors go
/// straight to an alternative tool; a dropped connection is skipped, not
/// retried (the connection is gone, retrying it won't help); timeouts and
/// network errors retry up to the cap and then give up; anything else
/// retries, then tries an alternative, then gives up at five attempts.
pub fn select_strategy(class: ErrorClass, attempt_count: u32, max_retries: u32) -> Strategy {
    match class {
        ErrorClass::System => Strategy::ManualIntervention,
        ErrorClass::AuthPermission => Strategy::ManualIntervention,
        ErrorClass::Shape => Strategy::Alternative,
        ErrorClass::NotConnected => Strategy::Skip,
        ErrorClass::Transient => {
            if attempt_count < max_retries {
                Strategy::Retry
            } else {
                Strategy::Skip
            }
        }
        ErrorClass::Other => {
            if attempt_count < 2 {
                Strategy::Retry
            } else if attempt_count < 5 {
                Strategy::Alternative
            } else {
                Strategy::Skip
            }
        }
    }
}
