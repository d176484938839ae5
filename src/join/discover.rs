//! Join target resolution.
//!
//! Entries containing `provider=` are discovery descriptors: space separated
//! `key=value` pairs, e.g. `provider=dns name=servers.internal port=4648`.
//! Every other entry is passed through unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::config::sources::DEFAULT_SERF_PORT;
use crate::join::JoinError;

/// Resolves configured join entries into concrete addresses.
pub trait Resolver: Send + Sync {
    fn resolve(&self, entries: Vec<String>) -> BoxFuture<'static, Result<Vec<String>, JoinError>>;
}

/// A named source of addresses for discovery descriptors.
pub trait DiscoveryProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn addrs(
        &self,
        args: BTreeMap<String, String>,
    ) -> BoxFuture<'static, Result<Vec<String>, JoinError>>;
}

/// Parse a `provider=... key=value` descriptor.
pub fn parse_descriptor(descriptor: &str) -> Result<BTreeMap<String, String>, JoinError> {
    let invalid = |reason: &str| JoinError::Descriptor {
        descriptor: descriptor.to_string(),
        reason: reason.to_string(),
    };

    let mut args = BTreeMap::new();
    for pair in descriptor.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| invalid("expected key=value pairs"))?;
        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        args.insert(key.to_string(), value.to_string());
    }

    if !args.contains_key("provider") {
        return Err(invalid("missing provider"));
    }
    Ok(args)
}

/// Provider registry plus literal pass-through.
#[derive(Clone)]
pub struct Discover {
    providers: Arc<HashMap<&'static str, Arc<dyn DiscoveryProvider>>>,
}

impl Discover {
    /// A resolver with the built-in providers registered.
    pub fn new() -> Self {
        Self::with_providers(vec![Arc::new(DnsProvider) as Arc<dyn DiscoveryProvider>])
    }

    pub fn with_providers(providers: Vec<Arc<dyn DiscoveryProvider>>) -> Self {
        let providers = providers.into_iter().map(|p| (p.name(), p)).collect();
        Self {
            providers: Arc::new(providers),
        }
    }
}

impl Default for Discover {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for Discover {
    fn resolve(&self, entries: Vec<String>) -> BoxFuture<'static, Result<Vec<String>, JoinError>> {
        let providers = Arc::clone(&self.providers);
        async move {
            let mut addrs = Vec::new();
            for entry in entries {
                if !entry.contains("provider=") {
                    addrs.push(entry);
                    continue;
                }

                let args = parse_descriptor(&entry)?;
                let name = args.get("provider").cloned().unwrap_or_default();
                let provider = providers
                    .get(name.as_str())
                    .ok_or(JoinError::UnknownProvider(name))?;
                let found = provider.addrs(args).await?;
                tracing::debug!(descriptor = %entry, count = found.len(), "Discovered join addresses");
                addrs.extend(found);
            }
            Ok(addrs)
        }
        .boxed()
    }
}

/// Resolves `name` through the system resolver.
///
/// Arguments: `name` (required), `port` (defaults to the gossip port).
pub struct DnsProvider;

impl DiscoveryProvider for DnsProvider {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn addrs(
        &self,
        args: BTreeMap<String, String>,
    ) -> BoxFuture<'static, Result<Vec<String>, JoinError>> {
        async move {
            let name = args
                .get("name")
                .ok_or_else(|| JoinError::Discovery("dns: missing name".to_string()))?;
            let port = match args.get("port") {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|e| JoinError::Discovery(format!("dns: invalid port {:?}: {}", p, e)))?,
                None => DEFAULT_SERF_PORT,
            };

            let resolved = tokio::net::lookup_host((name.as_str(), port))
                .await
                .map_err(|e| JoinError::Discovery(format!("dns: {}: {}", name, e)))?;
            Ok(resolved.map(|addr| addr.to_string()).collect())
        }
        .boxed()
    }
}
