//! Trace context propagation.
//!
//! The tracer is initialized once at startup with `init_tracer`; the scheduler
//! only consumes the resulting `Tracer` handle. Spans here are lightweight W3C
//! trace contexts handed to job logic as a `traceparent` string, alongside the
//! `tracing` span each run opens for logging.

use std::sync::OnceLock;

use rand::Rng;

use crate::config::SchedulerConfig;

static TRACER: OnceLock<Tracer> = OnceLock::new();

/// Initialize the process-wide tracer if tracing is configured.
///
/// Returns the tracer, or `None` when no trace endpoint is set. Calling it
/// again returns the tracer from the first successful call.
pub fn init_tracer(config: &SchedulerConfig) -> Option<&'static Tracer> {
    let endpoint = config.trace_endpoint.as_ref()?;
    Some(TRACER.get_or_init(|| {
        tracing::info!(
            service = %config.service_name,
            endpoint = %endpoint,
            "Tracer initialized"
        );
        Tracer::new(config.service_name.clone(), endpoint.clone())
    }))
}

/// The process-wide tracer, if initialized.
pub fn tracer() -> Option<&'static Tracer> {
    TRACER.get()
}

/// W3C trace context of one span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub flags: u8,
}

impl SpanContext {
    /// All-zero trace or span ids are invalid per W3C.
    pub fn is_valid(&self) -> bool {
        self.trace_id != [0; 16] && self.span_id != [0; 8]
    }

    /// Render as `00-<trace-id>-<span-id>-<flags>`.
    pub fn to_trace_parent(&self) -> Option<String> {
        if !self.is_valid() {
            return None;
        }
        Some(format!(
            "00-{}-{}-{:02x}",
            hex(&self.trace_id),
            hex(&self.span_id),
            self.flags
        ))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Handle for starting spans.
#[derive(Debug, Clone)]
pub struct Tracer {
    service_name: String,
    endpoint: String,
}

impl Tracer {
    pub fn new(service_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Start a sampled span, inheriting the trace id of `parent` if given.
    pub fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> SpanContext {
        let mut rng = rand::thread_rng();
        let trace_id = match parent {
            Some(p) if p.is_valid() => p.trace_id,
            _ => nonzero(|| rng.r#gen::<[u8; 16]>(), [0; 16]),
        };
        let span_id = nonzero(|| rng.r#gen::<[u8; 8]>(), [0; 8]);
        let span = SpanContext {
            trace_id,
            span_id,
            flags: 0x01,
        };
        tracing::trace!(
            service = %self.service_name,
            span = name,
            trace_parent = ?span.to_trace_parent(),
            "Started span"
        );
        span
    }
}

fn nonzero<T: PartialEq + Copy>(mut generate: impl FnMut() -> T, zero: T) -> T {
    loop {
        let value = generate();
        if value != zero {
            return value;
        }
    }
}
