use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::Backend;
use crate::{Error, Session, SessionConfig};

/// Named backends, chosen at runtime.
///
/// Create one at process start (or one per test) and register the
/// engines the application links in. There is no global registry.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
    default: Option<String>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under its own name, replacing any previous one.
    /// The first backend registered becomes the default.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        let name = backend.name().to_string();
        debug!("registering backend {name:?}");
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, backend);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, Error> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchBackend(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), Error> {
        if !self.backends.contains_key(name) {
            return Err(Error::NoSuchBackend(name.to_string()));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// A new, disconnected session on the backend called `name`.
    pub fn session(&self, name: &str, config: SessionConfig) -> Result<Session, Error> {
        Ok(Session::new(self.get(name)?, config))
    }

    pub fn default_session(&self, config: SessionConfig) -> Result<Session, Error> {
        match self.default.as_deref() {
            Some(name) => self.session(name, config),
            None => Err(Error::NoSuchBackend("<default>".to_string())),
        }
    }
}
