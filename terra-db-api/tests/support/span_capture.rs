//! In-memory span recorder for instrumentation tests.
//!
//! Every span opened while the guard of [`init_test_tracing`] is alive is
//! appended to a [`SpanStore`], and fields recorded later with
//! `Span::record` are merged into the same entry. The subscriber is a
//! thread default, so callers run on a `current_thread` runtime.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone)]
pub struct CapturedSpan {
    pub name: &'static str,
    pub level: tracing::Level,
    pub parent: Option<&'static str>,
    fields: HashMap<&'static str, String>,
}

impl CapturedSpan {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// A numeric field such as a row or address count.
    pub fn count(&self, name: &str) -> Option<u64> {
        self.field(name)?.parse().ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpanStore(Arc<Mutex<Vec<CapturedSpan>>>);

impl SpanStore {
    /// First span named `name`, in creation order.
    pub fn first(&self, name: &str) -> Option<CapturedSpan> {
        self.0.lock().iter().find(|s| s.name == name).cloned()
    }

    /// Every span named `name`, in creation order.
    pub fn all(&self, name: &str) -> Vec<CapturedSpan> {
        self.0.lock().iter().filter(|s| s.name == name).cloned().collect()
    }

    /// Names of the spans opened directly under a span named `parent`.
    pub fn children_of(&self, parent: &str) -> Vec<&'static str> {
        self.0
            .lock()
            .iter()
            .filter(|s| s.parent.is_some_and(|p| p == parent))
            .map(|s| s.name)
            .collect()
    }
}

/// Position of a span in the store, kept in the span's extensions.
struct Slot(usize);

struct Recorder {
    store: SpanStore,
}

impl<S> Layer<S> for Recorder
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = Fields::default();
        attrs.record(&mut fields);

        // explicit parent first, else the span current at creation
        let parent = span
            .parent()
            .map(|p| p.name())
            .or_else(|| ctx.lookup_current().map(|c| c.name()));

        let slot = {
            let mut spans = self.store.0.lock();
            spans.push(CapturedSpan {
                name: span.name(),
                level: *span.metadata().level(),
                parent,
                fields: fields.0,
            });
            spans.len() - 1
        };
        span.extensions_mut().insert(Slot(slot));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let Some(slot) = span.extensions().get::<Slot>().map(|s| s.0) else {
            return;
        };
        let mut fields = Fields::default();
        values.record(&mut fields);
        if let Some(captured) = self.store.0.lock().get_mut(slot) {
            captured.fields.extend(fields.0);
        }
    }
}

#[derive(Default)]
struct Fields(HashMap<&'static str, String>);

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name(), value.to_string());
    }
}

/// Record spans of every level on this thread until the guard drops.
pub fn init_test_tracing() -> (SpanStore, tracing::subscriber::DefaultGuard) {
    let store = SpanStore::default();
    let subscriber = tracing_subscriber::registry().with(Recorder {
        store: store.clone(),
    });
    (store, tracing::subscriber::set_default(subscriber))
}
