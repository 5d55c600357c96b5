//! Metrics instrumentation for the client.
//!
//! Uses the `metrics` facade; nothing is recorded unless the application
//! installs a recorder (e.g. a Prometheus exporter).

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const ENVELOPES_TOTAL: &str = "courier_envelopes_total";
    pub const HANDLER_FAILURES_TOTAL: &str = "courier_handler_failures_total";
    pub const COMMANDS_TOTAL: &str = "courier_commands_total";
    pub const COMMANDS_PENDING: &str = "courier_commands_pending";
    pub const SESSIONS_TOTAL: &str = "courier_sessions_total";
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        names::ENVELOPES_TOTAL,
        "Envelopes sent and received, by kind and direction"
    );
    metrics::describe_counter!(
        names::HANDLER_FAILURES_TOTAL,
        "Receivers that returned an error or panicked"
    );
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Command outcomes");
    metrics::describe_gauge!(names::COMMANDS_PENDING, "Commands awaiting a response");
    metrics::describe_counter!(names::SESSIONS_TOTAL, "Session establishment attempts");
}

/// Record an envelope crossing the transport.
pub fn record_envelope(kind: &'static str, direction: &'static str) {
    counter!(names::ENVELOPES_TOTAL, "kind" => kind, "direction" => direction).increment(1);
}

/// Record a failed receiver.
pub fn record_handler_failure() {
    counter!(names::HANDLER_FAILURES_TOTAL).increment(1);
}

/// Record a command event ("sent", "success", "failure", "timeout").
pub fn record_command(outcome: &'static str) {
    counter!(names::COMMANDS_TOTAL, "outcome" => outcome).increment(1);
}

/// Update the pending command gauge.
pub fn set_pending_commands(count: usize) {
    gauge!(names::COMMANDS_PENDING).set(count as f64);
}

/// Record a session establishment attempt ("established", "failed").
pub fn record_session(outcome: &'static str) {
    counter!(names::SESSIONS_TOTAL, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // Just test that it doesn't panic
        describe_metrics();
        record_envelope("message", "inbound");
        record_handler_failure();
        record_command("success");
        set_pending_commands(2);
        record_session("established");
    }
}
