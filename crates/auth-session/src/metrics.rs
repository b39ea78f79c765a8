//! Session metrics
//!
//! - `auth_operations_total` (counter): labels `operation`, `outcome`
//! - `auth_operation_duration_seconds` (histogram): label `operation`
//! - `auth_state_notifications_total` (counter): label `state`
//!
//! Without an installed recorder every call is a no-op.

/// Record a finished controller operation. `outcome` is `"success"` or an
/// error category.
pub fn record_operation(operation: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("auth_operations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
    metrics::histogram!("auth_operation_duration_seconds", "operation" => operation)
        .record(duration_secs);
}

/// Record one auth-state publication.
pub fn record_notification(signed_in: bool, subscribers: usize) {
    let state = if signed_in { "signed_in" } else { "signed_out" };
    metrics::counter!("auth_state_notifications_total", "state" => state).increment(1);
    metrics::gauge!("auth_state_subscribers").set(subscribers as f64);
}
