//! Registered derive functions

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::metadata::{MethodRegistry, QueryKey};
use crate::value::Value;

use super::composer::MappingFn;

/// Turns derive-call arguments into the ordered input query keys
pub type InputBuilder = Arc<dyn Fn(&MethodRegistry, &[Value]) -> Result<Vec<QueryKey>> + Send + Sync>;

/// A named derive function
#[derive(Clone)]
pub struct DeriveDef {
    /// Section name (e.g., "democracy")
    pub section: String,
    /// Function name (e.g., "votes")
    pub name: String,
    pub mapping: MappingFn,
    pub inputs: InputBuilder,
}

impl DeriveDef {
    pub fn new(section: &str, name: &str, mapping: MappingFn, inputs: InputBuilder) -> Self {
        Self {
            section: section.to_string(),
            name: name.to_string(),
            mapping,
            inputs,
        }
    }

    /// Identity used in derived query keys
    pub fn mapping_id(&self) -> String {
        format!("{}.{}", self.section, self.name)
    }
}

impl std::fmt::Debug for DeriveDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeriveDef")
            .field("section", &self.section)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Lookup of derive functions by section and name
#[derive(Default)]
pub struct DeriveCatalog {
    defs: RwLock<HashMap<String, Arc<DeriveDef>>>,
}

impl DeriveCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a derive function, replacing any previous one of that name
    pub fn register(&self, def: DeriveDef) {
        let id = def.mapping_id();
        let replaced = self
            .defs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), Arc::new(def))
            .is_some();

        if replaced {
            tracing::warn!(derive = %id, "Derive function replaced");
        } else {
            tracing::debug!(derive = %id, "Derive function registered");
        }
    }

    /// Look up a derive function
    pub fn get(&self, section: &str, name: &str) -> Result<Arc<DeriveDef>> {
        self.by_id(&format!("{}.{}", section, name))
            .ok_or_else(|| Error::UnknownMethod {
                module: section.to_string(),
                method: name.to_string(),
            })
    }

    /// Look up a derive function by its mapping id
    pub fn by_id(&self, mapping_id: &str) -> Option<Arc<DeriveDef>> {
        self.defs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(mapping_id)
            .cloned()
    }

    /// Registered mapping ids, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .defs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }
}
