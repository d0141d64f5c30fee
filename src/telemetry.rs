//! Pluggable telemetry hooks.
//!
//! Every operator exposes a processed counter, a processing-time histogram and
//! a span, identified by operator type and element type
//! (`<op>_processed_<T>`, `<op>_processing_time_<T>`, `<op>_<T>`). Providers
//! are supplied by the embedding application; when none is configured the
//! hooks are disabled.

use std::sync::Arc;

use once_cell::sync::Lazy;

pub trait Counter: Send + Sync {
    fn increment(&self, n: u64);
}

pub trait Histogram: Send + Sync {
    /// Record a processing time in milliseconds.
    fn record(&self, millis: f64);
}

/// A live span; providers end it on drop.
pub trait Span: Send {}

pub trait TelemetryProvider: Send + Sync {
    fn counter(&self, name: &str) -> Arc<dyn Counter>;
    fn histogram(&self, name: &str) -> Arc<dyn Histogram>;
    fn span(&self, name: &str) -> Box<dyn Span>;
}

pub type TelemetryRef = Arc<dyn TelemetryProvider>;

struct NoopInstrument;

impl Counter for NoopInstrument {
    fn increment(&self, _n: u64) {}
}

impl Histogram for NoopInstrument {
    fn record(&self, _millis: f64) {}
}

impl Span for NoopInstrument {}

static NOOP: Lazy<Arc<NoopInstrument>> = Lazy::new(|| Arc::new(NoopInstrument));

/// The per-operator instruments, resolved once when a provider is wired.
pub(crate) struct OperatorTelemetry {
    provider: Option<TelemetryRef>,
    processed: Arc<dyn Counter>,
    processing_time: Arc<dyn Histogram>,
    span_name: String,
}

impl OperatorTelemetry {
    pub(crate) fn unset() -> Self {
        Self {
            provider: None,
            processed: NOOP.clone(),
            processing_time: NOOP.clone(),
            span_name: String::new(),
        }
    }

    pub(crate) fn wire<T>(&mut self, op: &str, provider: &TelemetryRef) {
        let ty = short_type_name::<T>();
        self.processed = provider.counter(&format!("{op}_processed_{ty}"));
        self.processing_time = provider.histogram(&format!("{op}_processing_time_{ty}"));
        self.span_name = format!("{op}_{ty}");
        self.provider = Some(provider.clone());
    }

    /// Run `f` inside a span, counting the element and timing the call.
    pub(crate) fn observe<R>(&self, f: impl FnOnce() -> R) -> R {
        let Some(provider) = &self.provider else {
            return f();
        };
        let _span = provider.span(&self.span_name);
        let started = coarsetime::Instant::now();
        let out = f();
        self.processed.increment(1);
        self.processing_time
            .record(started.elapsed().as_f64() * 1000.0);
        out
    }
}

/// `my_crate::window::TumblingWindow<Evt>` -> `TumblingWindow`.
pub(crate) fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    if full.starts_with('(') {
        return "tuple".to_string();
    }
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
