//! Optional best-effort telemetry sink.
//!
//! The core reports lifecycle breadcrumbs and notable events to an
//! application-provided sink. The trait is infallible on purpose: a
//! misbehaving sink must never be able to fail the peripheral, so
//! implementations swallow their own transport errors.

use std::sync::Arc;

pub trait TelemetrySink: Send + Sync {
    /// Record a short breadcrumb (state transitions, registrations).
    fn breadcrumb(&self, message: &str);

    /// Record a named event with detail (failures, recoveries).
    fn event(&self, name: &str, detail: &str);
}

/// Default sink that discards everything.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn breadcrumb(&self, _message: &str) {}
    fn event(&self, _name: &str, _detail: &str) {}
}

pub(crate) fn noop() -> Arc<dyn TelemetrySink> {
    Arc::new(NoopTelemetry)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records everything, for asserting on lifecycle traces.
    #[derive(Default)]
    pub struct RecordingTelemetry {
        pub breadcrumbs: Mutex<Vec<String>>,
        pub events: Mutex<Vec<(String, String)>>,
    }

    impl TelemetrySink for RecordingTelemetry {
        fn breadcrumb(&self, message: &str) {
            self.breadcrumbs.lock().unwrap().push(message.to_string());
        }

        fn event(&self, name: &str, detail: &str) {
            self.events
                .lock()
                .unwrap()
                .push((name.to_string(), detail.to_string()));
        }
    }
}
