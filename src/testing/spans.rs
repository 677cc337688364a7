//! Span recording for tests
//!
//! Records how deeply spans of a given name are nested, so tests can check
//! that a long-running chain of jobs keeps its cycle spans flat.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// Counts spans with a given name and the deepest scope any of them had
#[derive(Debug, Clone)]
pub struct SpanDepthRecorder {
    name: &'static str,
    created: Arc<AtomicUsize>,
    max_depth: Arc<AtomicUsize>,
}

impl SpanDepthRecorder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            created: Arc::new(AtomicUsize::new(0)),
            max_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Install the recorder as the default subscriber of the current thread
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// Number of matching spans created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Length of the longest scope seen, counting the span itself
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::SeqCst)
    }
}

impl<S> Layer<S> for SpanDepthRecorder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, _attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        if span.name() != self.name {
            return;
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        let depth = span.scope().count();
        self.max_depth.fetch_max(depth, Ordering::SeqCst);
    }
}
