//! Plugins and their capabilities.
//!
//! A plugin is any value with a unique string ID. What it can *do* is
//! discovered at lookup time: each capability (binding, rendering, ID
//! generation, lifecycle hooks, reload) has an `as_*` accessor on [`Plugin`]
//! that returns `None` by default. A plugin opts in by overriding the
//! accessor to return itself.
//!
//! ```rust
//! use bough::plugin::{IdGenerator, Plugin};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! struct Counter(AtomicU64);
//!
//! impl Plugin for Counter {
//!     fn id(&self) -> &str { "counter" }
//!     fn as_id_generator(&self) -> Option<&dyn IdGenerator> { Some(self) }
//! }
//!
//! impl IdGenerator for Counter {
//!     fn next_id(&self) -> String {
//!         self.0.fetch_add(1, Ordering::Relaxed).to_string()
//!     }
//! }
//! ```
//!
//! Plugins are registered on the [`App`](crate::App) during setup. The
//! registry is frozen when the controller is built and only read afterwards,
//! so lookups from request handlers take no locks. A missing plugin or a
//! plugin lacking the requested capability is reported as `None`; the caller
//! decides what to fall back to.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::app::ControllerRef;
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::handler::BoxFuture;

/// ID of the built-in UUIDv7 generator every [`App`](crate::App) starts with.
pub const UUID_PLUGIN_ID: &str = "_bough_uuid_plugin_";

// ── Capabilities ──────────────────────────────────────────────────────────────

/// An optional component registered with the controller.
pub trait Plugin: Send + Sync + 'static {
    /// Unique identifier within one registry.
    fn id(&self) -> &str;

    fn as_attacher(&mut self) -> Option<&mut dyn Attacher> {
        None
    }

    fn as_binder(&self) -> Option<&dyn Binder> {
        None
    }

    fn as_renderer(&self) -> Option<&dyn Renderer> {
        None
    }

    fn as_id_generator(&self) -> Option<&dyn IdGenerator> {
        None
    }

    fn as_cycler(&self) -> Option<&dyn Cycler> {
        None
    }

    fn as_reloader(&self) -> Option<&dyn Reloader> {
        None
    }
}

/// Receives a handle on the controller it is registered with, once,
/// synchronously, before the plugin is stored.
///
/// The handle resolves only after [`App::build`](crate::App::build); keep it
/// and upgrade it from hooks or handlers to reach the frozen controller.
pub trait Attacher {
    fn attach(&mut self, controller: ControllerRef);
}

/// Decodes request data into a JSON document.
pub trait Binder: Send + Sync {
    fn bind(&self, ctx: &Ctx) -> Result<Value>;
}

/// Renders a named template into `out`.
pub trait Renderer: Send + Sync {
    fn render(&self, out: &mut dyn io::Write, name: &str, data: &Value, ctx: &Ctx) -> Result<()>;
}

/// Produces identifiers unique across calls.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Start and shutdown hooks run at controller lifecycle transitions.
pub trait Cycler: Send + Sync {
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Should finish before `deadline`. The controller stops waiting for it
    /// once the deadline passes.
    fn shutdown(&self, deadline: Instant) -> BoxFuture<'_, Result<()>>;
}

/// Reloads configuration or state, typically on `SIGHUP`.
pub trait Reloader: Send + Sync {
    fn reload(&self) -> Result<()>;
}

/// Runs `binder` and deserializes its output into `T`.
pub fn bind_into<T: DeserializeOwned>(binder: &dyn Binder, ctx: &Ctx) -> Result<T> {
    Ok(serde_json::from_value(binder.bind(ctx)?)?)
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Plugins by ID, kept in registration order.
///
/// Order matters for lifecycle hooks: start and shutdown hooks run in the
/// order plugins were registered.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    index: HashMap<String, usize>,
}

impl PluginRegistry {
    /// An empty registry, without the built-in UUID generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in UUID generator.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.index.insert(UUID_PLUGIN_ID.to_owned(), 0);
        registry.plugins.push(Arc::new(UuidPlugin));
        registry
    }

    /// Adds `plugin`. IDs must be unique.
    pub fn register<P: Plugin>(&mut self, plugin: P) -> Result<()> {
        self.insert(Arc::new(plugin))
    }

    pub(crate) fn insert(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let id = plugin.id().to_owned();
        if self.index.contains_key(&id) {
            return Err(Error::DuplicatePlugin(id));
        }
        self.index.insert(id, self.plugins.len());
        self.plugins.push(plugin);
        Ok(())
    }

    /// Removes and returns the plugin registered under `id`.
    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn Plugin>> {
        let at = self.index.remove(id)?;
        let removed = self.plugins.remove(at);
        for slot in self.index.values_mut() {
            if *slot > at {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.index.get(id).map(|&i| &self.plugins[i])
    }

    pub fn binder(&self, id: &str) -> Option<&dyn Binder> {
        self.get(id)?.as_binder()
    }

    pub fn renderer(&self, id: &str) -> Option<&dyn Renderer> {
        self.get(id)?.as_renderer()
    }

    pub fn id_generator(&self, id: &str) -> Option<&dyn IdGenerator> {
        self.get(id)?.as_id_generator()
    }

    /// Plugins with lifecycle hooks, in registration order.
    pub fn cyclers(&self) -> impl Iterator<Item = (&str, &dyn Cycler)> {
        self.plugins.iter().filter_map(|p| Some((p.id(), p.as_cycler()?)))
    }

    /// Plugins that can be reloaded, in registration order.
    pub fn reloaders(&self) -> impl Iterator<Item = (&str, &dyn Reloader)> {
        self.plugins.iter().filter_map(|p| Some((p.id(), p.as_reloader()?)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

// ── Built-in plugins ──────────────────────────────────────────────────────────

/// Generates UUIDv7 identifiers as 32 lowercase hex digits.
///
/// Version 7 UUIDs lead with a millisecond timestamp, so IDs sort by creation
/// time and stay unique across processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidPlugin;

impl Plugin for UuidPlugin {
    fn id(&self) -> &str {
        UUID_PLUGIN_ID
    }

    fn as_id_generator(&self) -> Option<&dyn IdGenerator> {
        Some(self)
    }
}

impl IdGenerator for UuidPlugin {
    fn next_id(&self) -> String {
        Uuid::now_v7().simple().to_string()
    }
}

/// Binds JSON bodies, URL-encoded form bodies, or, for requests without a
/// body, the query string.
#[derive(Debug, Clone)]
pub struct JsonBinder {
    id: String,
}

impl JsonBinder {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Plugin for JsonBinder {
    fn id(&self) -> &str {
        &self.id
    }

    fn as_binder(&self) -> Option<&dyn Binder> {
        Some(self)
    }
}

impl Binder for JsonBinder {
    fn bind(&self, ctx: &Ctx) -> Result<Value> {
        let body = ctx.body();
        let is_form = ctx
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            return Ok(pairs_to_object(url::form_urlencoded::parse(body)));
        }
        if body.is_empty() {
            let query = ctx.req().uri().query().unwrap_or("");
            return Ok(pairs_to_object(url::form_urlencoded::parse(query.as_bytes())));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

fn pairs_to_object<'a>(pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) -> Value {
    let map: Map<String, Value> = pairs
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    Value::Object(map)
}
