//! Structured logging setup for the gateway process.
//!
//! Mirrors the trading framework's own `init_logging`/`init_json_logging`
//! pair: an `EnvFilter` defaulting to `INFO`, plus a [`tracing_subscriber::Layer`]
//! that mutes a single noisy span so routine ticks don't flood output at the
//! default level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Name of the span the reconciliation cycle runs under. Muted at INFO;
/// raise `RUST_LOG=gateway_risk=debug` to see every tick.
pub const RECONCILIATION_CYCLE_SPAN: &str = "reconciliation.cycle";

/// Initialises human-readable logging, reading level directives from
/// `RUST_LOG` (default `INFO`).
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(ReconciliationSpanFilter)
        .init()
}

/// Initialises JSON logging for log aggregators, same filter defaults.
pub fn init_json_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .with(ReconciliationSpanFilter)
        .init()
}

struct ReconciliationSpanFilter;

impl<S> tracing_subscriber::layer::Layer<S> for ReconciliationSpanFilter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn event_enabled(
        &self,
        _: &tracing::Event<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) -> bool {
        if let Some(span) = ctx.lookup_current() {
            span.name() != RECONCILIATION_CYCLE_SPAN
        } else {
            true
        }
    }
}
