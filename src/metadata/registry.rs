//! Method registry
//!
//! Loaded once from a metadata document and read-only afterwards, so it can
//! be shared behind an `Arc` without locking.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::value::Value;

use super::descriptor::{ArgKind, MethodDescriptor};
use super::key::QueryKey;

/// Metadata document versions this crate understands
pub const SUPPORTED_VERSIONS: &[u32] = &[0];

const STATIC_METADATA: &str = include_str!("static_v0.json");

#[derive(Debug, Deserialize)]
struct MetadataDoc {
    version: u32,
    modules: Vec<ModuleDoc>,
}

#[derive(Debug, Deserialize)]
struct ModuleDoc {
    name: String,
    #[serde(default)]
    storage: Vec<StorageDoc>,
}

#[derive(Debug, Deserialize)]
struct StorageDoc {
    name: String,
    #[serde(default)]
    args: Vec<String>,
    returns: String,
    #[serde(default)]
    default: Option<serde_json::Value>,
}

/// Lookup from (module, method) to storage method descriptors
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    modules: HashMap<String, HashMap<String, Arc<MethodDescriptor>>>,
    version: u32,
}

impl MethodRegistry {
    /// Load a registry from a JSON metadata document
    pub fn from_json(document: &str) -> Result<Self> {
        let doc: MetadataDoc = serde_json::from_str(document)?;

        if !SUPPORTED_VERSIONS.contains(&doc.version) {
            return Err(Error::MetadataInvalid(format!(
                "unsupported metadata version {}",
                doc.version
            )));
        }

        let mut modules: HashMap<String, HashMap<String, Arc<MethodDescriptor>>> = HashMap::new();

        for module in doc.modules {
            let methods = modules.entry(module.name.clone()).or_default();

            for item in module.storage {
                let default = item.default.as_ref().map(json_to_value).transpose()?;
                let descriptor = MethodDescriptor {
                    module: module.name.clone(),
                    method: item.name.clone(),
                    args: item.args.iter().map(|a| ArgKind::parse(a)).collect(),
                    returns: item.returns,
                    default,
                };

                if methods.insert(item.name.clone(), Arc::new(descriptor)).is_some() {
                    return Err(Error::MetadataInvalid(format!(
                        "duplicate method {}.{}",
                        module.name, item.name
                    )));
                }
            }
        }

        let method_count: usize = modules.values().map(|m| m.len()).sum();
        tracing::info!(
            version = doc.version,
            modules = modules.len(),
            methods = method_count,
            "Metadata loaded"
        );

        Ok(Self {
            modules,
            version: doc.version,
        })
    }

    /// Registry built from the metadata bundled with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(STATIC_METADATA)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Look up a descriptor
    pub fn resolve(&self, module: &str, method: &str) -> Result<Arc<MethodDescriptor>> {
        self.modules
            .get(module)
            .and_then(|methods| methods.get(method))
            .cloned()
            .ok_or_else(|| Error::UnknownMethod {
                module: module.to_string(),
                method: method.to_string(),
            })
    }

    /// Validate arguments and build the key for a storage query
    pub fn build_query_key(&self, module: &str, method: &str, args: Vec<Value>) -> Result<QueryKey> {
        let descriptor = self.resolve(module, method)?;
        descriptor.check_args(&args)?;
        Ok(QueryKey::storage(module, method, args))
    }

    /// Module names, sorted
    pub fn modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Method names of one module, sorted
    pub fn methods(&self, module: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .modules
            .get(module)
            .map(|methods| methods.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;

    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => n
            .as_u64()
            .map(|n| Value::Uint(n.into()))
            .ok_or_else(|| Error::MetadataInvalid(format!("unsupported default number {}", n))),
        Json::String(s) => match s.strip_prefix("0x") {
            Some(hex) => decode_hex(hex).map(Value::Bytes),
            None => Ok(Value::Text(s.clone())),
        },
        Json::Array(items) => items
            .iter()
            .map(json_to_value)
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Json::Object(_) => Err(Error::MetadataInvalid(
            "object defaults are not supported".into(),
        )),
    }
}

fn decode_hex(digits: &str) -> Result<Bytes> {
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| Error::MetadataInvalid(format!("invalid hex default 0x{}: {}", digits, e)))
}
