//! Backend router
//!
//! Maps a requested model name (or a bare provider name) to the client that
//! serves it. Resolution happens before any credential is looked at, so an
//! unknown model costs nothing but a string match.

use std::collections::BTreeMap;
use std::sync::Arc;

use provider::{ProviderClient, ProviderKind};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Default)]
pub struct BackendRouter {
    clients: BTreeMap<ProviderKind, Arc<dyn ProviderClient>>,
    /// (lowercased prefix, provider), longest prefix first.
    prefixes: Vec<(String, ProviderKind)>,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` for its provider and route every model starting
    /// with one of `prefixes` to it. Registering a provider twice replaces
    /// its client and adds the new prefixes.
    pub fn register(
        &mut self,
        client: Arc<dyn ProviderClient>,
        prefixes: impl IntoIterator<Item = String>,
    ) {
        let kind = client.kind();
        for prefix in prefixes {
            let prefix = prefix.trim().to_ascii_lowercase();
            if prefix.is_empty() {
                continue;
            }
            self.prefixes.retain(|(p, _)| *p != prefix);
            self.prefixes.push((prefix, kind));
        }
        self.prefixes
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        self.clients.insert(kind, client);
    }

    /// Find the client for `model` (a model id or a provider name).
    ///
    /// An exact provider name wins; otherwise the longest matching prefix.
    pub fn resolve(&self, model: &str) -> Result<Arc<dyn ProviderClient>> {
        let needle = model.trim().to_ascii_lowercase();
        if needle.is_empty() {
            return Err(Error::NoSuchProvider("empty model".into()));
        }

        let kind = needle
            .parse::<ProviderKind>()
            .ok()
            .filter(|k| self.clients.contains_key(k))
            .or_else(|| {
                self.prefixes
                    .iter()
                    .find(|(prefix, _)| needle.starts_with(prefix.as_str()))
                    .map(|(_, kind)| *kind)
            })
            .ok_or_else(|| Error::NoSuchProvider(model.trim().to_string()))?;

        debug!(model, provider = %kind, "resolved backend");
        self.clients
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NoSuchProvider(model.trim().to_string()))
    }

    /// Registered providers, in stable order.
    pub fn providers(&self) -> Vec<ProviderKind> {
        self.clients.keys().copied().collect()
    }

    /// Prefixes routed to `kind`.
    pub fn prefixes_for(&self, kind: ProviderKind) -> Vec<String> {
        self.prefixes
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(p, _)| p.clone())
            .collect()
    }
}
