//! Registry of trusted internal modules.
//!
//! Modules are read once from a JSON file at startup and never change
//! afterwards. A module with a public key can anchor event validation; a
//! module with a base URL can receive passthrough traffic and subscription
//! deliveries.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use serde::Deserialize;
use tracing::info;

use crate::{event::is_low_hex_32, filter::Filter, routes::RouteMethod};

/// On-disk shape of a single module entry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModuleConfig {
    #[serde(default)]
    pubkey: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    routes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    subscriptions: Vec<SubscriptionSpec>,
}

/// Subscription a module asks the gateway to run on its behalf.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionSpec {
    /// Handler name, also the checkpoint key.
    pub name: String,
    /// Path on the module's base URL receiving matching events.
    pub path: String,
    /// Filter template; `since` is managed by the dispatcher.
    #[serde(default)]
    pub filter: Filter,
}

/// Immutable description of a trusted module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub public_key: Option<String>,
    pub base_url: Option<String>,
    pub route_methods: BTreeMap<String, BTreeSet<RouteMethod>>,
    pub subscriptions: Vec<SubscriptionSpec>,
}


#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("reading modules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing modules file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("required module `{0}` is not configured")]
    MissingModule(String),
    #[error("module `{0}` requires a public key")]
    MissingPublicKey(String),
    #[error("module `{0}` has a malformed public key")]
    InvalidPublicKey(String),
    #[error("module `{0}` declares routes or subscriptions but no url")]
    MissingUrl(String),
    #[error("module `{module}` has an invalid url: {source}")]
    InvalidUrl {
        module: String,
        source: url::ParseError,
    },
    #[error("module `{module}` route `{path}` uses unsupported method `{method}`")]
    UnknownMethod {
        module: String,
        path: String,
        method: String,
    },
}

/// Name-indexed set of trusted modules.
#[derive(Debug, Clone, Default)]
pub struct TrustRegistry {
    modules: BTreeMap<String, ModuleDescriptor>,
}

impl TrustRegistry {
    /// Load modules from `path`. Every module named in `require_keys` must
    /// exist and carry a public key.
    pub fn load(path: &Path, require_keys: &[&str]) -> Result<Self, TrustError> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data, require_keys)
    }

    /// Parse a modules document.
    pub fn from_json(data: &str, require_keys: &[&str]) -> Result<Self, TrustError> {
        let raw: BTreeMap<String, ModuleConfig> = serde_json::from_str(data)?;
        let mut modules = BTreeMap::new();
        for (name, cfg) in raw {
            let descriptor = describe(&name, cfg)?;
            modules.insert(name, descriptor);
        }
        for name in require_keys {
            let module = modules
                .get(*name)
                .ok_or_else(|| TrustError::MissingModule(name.to_string()))?;
            if module.public_key.is_none() {
                return Err(TrustError::MissingPublicKey(name.to_string()));
            }
        }
        info!(modules = modules.len(), "trust registry loaded");
        Ok(Self { modules })
    }

    /// Look up a module by name.
    pub fn lookup(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    /// Public key of `name`, if the module exists and has one.
    pub fn public_key(&self, name: &str) -> Option<&str> {
        self.lookup(name)?.public_key.as_deref()
    }

    /// All modules, ordered by name.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.values()
    }
}

fn describe(name: &str, cfg: ModuleConfig) -> Result<ModuleDescriptor, TrustError> {
    let public_key = Some(cfg.pubkey).filter(|k| !k.is_empty());
    if let Some(key) = &public_key {
        if !is_low_hex_32(key) {
            return Err(TrustError::InvalidPublicKey(name.to_string()));
        }
    }
    let base_url = Some(cfg.url).filter(|u| !u.is_empty());
    if let Some(u) = &base_url {
        url::Url::parse(u).map_err(|source| TrustError::InvalidUrl {
            module: name.to_string(),
            source,
        })?;
    }
    if base_url.is_none() && (!cfg.routes.is_empty() || !cfg.subscriptions.is_empty()) {
        return Err(TrustError::MissingUrl(name.to_string()));
    }
    let mut route_methods = BTreeMap::new();
    for (path, methods) in cfg.routes {
        let mut set = BTreeSet::new();
        for method in methods {
            let parsed = method.parse().map_err(|_| TrustError::UnknownMethod {
                module: name.to_string(),
                path: path.clone(),
                method: method.clone(),
            })?;
            set.insert(parsed);
        }
        route_methods.insert(path, set);
    }
    Ok(ModuleDescriptor {
        name: name.to_string(),
        public_key,
        // Trailing slashes would double up when joined with request paths.
        base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        route_methods,
        subscriptions: cfg.subscriptions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn sample() -> String {
        serde_json::json!({
            "card": {
                "url": "http://card:8000/",
                "routes": {"/card": ["post"], "/card/pay": ["GET", "post"]}
            },
            "ledger": {"pubkey": key('a')},
            "urlx": {
                "pubkey": key('b'),
                "url": "http://urlx:8000",
                "routes": {"/lnurlp/:pubkey/callback": ["get"]},
                "subscriptions": [{"name": "urlx-ok", "path": "/events", "filter": {"kinds": [1112]}}]
            }
        })
        .to_string()
    }

    #[test]
    fn loads_modules() {
        let reg = TrustRegistry::from_json(&sample(), &["ledger", "urlx"]).unwrap();
        let card = reg.lookup("card").unwrap();
        assert_eq!(card.base_url.as_deref(), Some("http://card:8000"));
        assert!(card.public_key.is_none());
        assert_eq!(
            card.route_methods["/card/pay"],
            BTreeSet::from([RouteMethod::Get, RouteMethod::Post])
        );
        assert_eq!(reg.public_key("ledger"), Some(key('a').as_str()));
        assert!(reg.lookup("ledger").unwrap().base_url.is_none());
        assert_eq!(reg.lookup("urlx").unwrap().subscriptions[0].name, "urlx-ok");
        assert!(reg.lookup("nope").is_none());
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let doc = serde_json::json!({"ledger": {}}).to_string();
        assert!(matches!(
            TrustRegistry::from_json(&doc, &["ledger"]),
            Err(TrustError::MissingPublicKey(m)) if m == "ledger"
        ));
        assert!(matches!(
            TrustRegistry::from_json("{}", &["ledger"]),
            Err(TrustError::MissingModule(_))
        ));
    }

    #[test]
    fn routes_without_url_are_fatal() {
        let doc = serde_json::json!({"card": {"routes": {"/card": ["get"]}}}).to_string();
        assert!(matches!(
            TrustRegistry::from_json(&doc, &[]),
            Err(TrustError::MissingUrl(_))
        ));
    }

    #[test]
    fn bad_method_and_key_rejected() {
        let doc = serde_json::json!({"card": {"url": "http://c", "routes": {"/c": ["head"]}}})
            .to_string();
        assert!(matches!(
            TrustRegistry::from_json(&doc, &[]),
            Err(TrustError::UnknownMethod { .. })
        ));
        let doc = serde_json::json!({"ledger": {"pubkey": "XYZ"}}).to_string();
        assert!(matches!(
            TrustRegistry::from_json(&doc, &[]),
            Err(TrustError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("modules.json");
        std::fs::write(&path, sample()).unwrap();
        let reg = TrustRegistry::load(&path, &["ledger"]).unwrap();
        assert_eq!(reg.modules().count(), 3);
        assert!(TrustRegistry::load(&dir.path().join("missing.json"), &[]).is_err());
    }
}
