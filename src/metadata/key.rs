//! Query keys
//!
//! Two calls are the same query iff their keys are equal. Keys are built
//! without contacting the node and are cheap to clone.

use std::sync::Arc;

use crate::value::Value;

/// Identifier for a storage query or a derived query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Raw storage item: module, method and the argument tuple
    Storage {
        module: Arc<str>,
        method: Arc<str>,
        args: Arc<[Value]>,
    },
    /// Derived query: mapping identity plus the ordered input keys
    Derived {
        mapping: Arc<str>,
        inputs: Arc<[QueryKey]>,
    },
}

impl QueryKey {
    /// Create a storage key
    pub fn storage(module: &str, method: &str, args: Vec<Value>) -> Self {
        QueryKey::Storage {
            module: module.into(),
            method: method.into(),
            args: args.into(),
        }
    }

    /// Create a derived key
    pub fn derived(mapping: &str, inputs: Vec<QueryKey>) -> Self {
        QueryKey::Derived {
            mapping: mapping.into(),
            inputs: inputs.into(),
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, QueryKey::Derived { .. })
    }

    /// Input keys of a derived query (empty for storage keys)
    pub fn inputs(&self) -> &[QueryKey] {
        match self {
            QueryKey::Derived { inputs, .. } => inputs,
            QueryKey::Storage { .. } => &[],
        }
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKey::Storage {
                module,
                method,
                args,
            } => {
                write!(f, "{}.{}(", module, method)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            QueryKey::Derived { mapping, inputs } => {
                write!(f, "derive:{}[", mapping)?;
                for (i, input) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", input)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = QueryKey::storage("democracy", "voteOf", vec![Value::Uint(1), Value::Uint(2)]);
        let b = QueryKey::storage("democracy", "voteOf", vec![Value::Uint(1), Value::Uint(2)]);
        let swapped = QueryKey::storage("democracy", "voteOf", vec![Value::Uint(2), Value::Uint(1)]);

        assert_eq!(a, b);
        assert_ne!(a, swapped);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&swapped));
    }

    #[test]
    fn test_derived_differs_by_mapping() {
        let input = QueryKey::storage("system", "events", vec![]);
        let votes = QueryKey::derived("democracy.votes", vec![input.clone()]);
        let tally = QueryKey::derived("democracy.tally", vec![input]);

        assert_ne!(votes, tally);
        assert!(votes.is_derived());
        assert_eq!(votes.inputs().len(), 1);
    }

    #[test]
    fn test_display() {
        let key = QueryKey::storage("democracy", "voteOf", vec![Value::Uint(3), Value::from_static(&[0xab])]);
        assert_eq!(key.to_string(), "democracy.voteOf(3, 0xab)");

        let derived = QueryKey::derived("democracy.votes", vec![key]);
        assert_eq!(
            derived.to_string(),
            "derive:democracy.votes[democracy.voteOf(3, 0xab)]"
        );
    }
}
