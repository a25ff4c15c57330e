#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{span, Subscriber};
use tracing_subscriber::registry;
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

#[derive(Default, Debug)]
pub struct SpanData {
    pub name: String,
    pub fields: Mutex<HashMap<String, String>>, // stringified values
}

impl SpanData {
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.lock().unwrap().get(key).cloned()
    }
}

#[derive(Default, Debug)]
pub struct SpanStore {
    pub spans: Mutex<HashMap<tracing::span::Id, Arc<SpanData>>>,
}

impl SpanStore {
    /// First captured span with the given name.
    pub fn find(&self, name: &str) -> Option<Arc<SpanData>> {
        self.spans
            .lock()
            .unwrap()
            .values()
            .find(|d| d.name == name)
            .cloned()
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    pub store: Arc<SpanStore>,
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let name = attrs.metadata().name().to_string();
        let data = Arc::new(SpanData { name, ..Default::default() });
        {
            let mut map = data.fields.lock().unwrap();
            attrs.record(&mut MapVisitor { map: &mut map });
        }
        self.store.spans.lock().unwrap().insert(id.clone(), data);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(data) = self.store.spans.lock().unwrap().get(id) {
            let mut map = data.fields.lock().unwrap();
            values.record(&mut MapVisitor { map: &mut map });
        }
    }
}

/// Install a capturing subscriber for the current thread. The returned guard
/// must be held for as long as spans should be captured.
pub fn install_capture() -> (Arc<SpanStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(SpanStore::default());
    let layer = CaptureLayer { store: store.clone() };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
