//! Argument combinators.
//!
//! When a subtask depends on others, each upstream result is folded into the
//! subtask's argument list through a [`Combinator`]. Combinators are looked
//! up by name from the dependency map (`arg-in-fn`), so payloads and
//! configuration can select a policy without carrying code.
//!
//! ## Built-in combinators
//!
//! - [`Append`] (the default): result goes to the tail of the args
//! - [`Prepend`]: result goes to the head of the args
//! - [`Merge`]: mapping results are deep-merged into a trailing mapping arg
//!
//! ## Custom combinators
//!
//! ```rust,ignore
//! use reverb::combine::{Combinator, CombinatorRegistry};
//!
//! struct Sum;
//!
//! impl Combinator for Sum {
//!     fn name(&self) -> &str {
//!         "sum"
//!     }
//!
//!     fn apply(&self, args: Vec<Value>, dep: &Value) -> Vec<Value> {
//!         // your folding policy here
//!     }
//! }
//!
//! let mut registry = CombinatorRegistry::new();
//! registry.register(Arc::new(Sum));
//! ```
//!
//! Combinators must be deterministic and total: the same `(args, dep)` pair
//! always yields the same output, for any JSON input.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Name of the combinator used when a subtask does not pick one.
pub const DEFAULT_COMBINATOR: &str = "append";

/// Folds one dependency result into an argument list.
pub trait Combinator: Send + Sync {
    /// The name this combinator is registered and selected by.
    fn name(&self) -> &str;

    /// Fold `dep` into `args`, returning the new argument list.
    fn apply(&self, args: Vec<Value>, dep: &Value) -> Vec<Value>;
}

/// Appends the dependency result to the tail of the argument list.
#[derive(Debug, Clone, Copy, Default)]
pub struct Append;

impl Combinator for Append {
    fn name(&self) -> &str {
        "append"
    }

    fn apply(&self, mut args: Vec<Value>, dep: &Value) -> Vec<Value> {
        args.push(dep.clone());
        args
    }
}

/// Prepends the dependency result to the head of the argument list.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prepend;

impl Combinator for Prepend {
    fn name(&self) -> &str {
        "prepend"
    }

    fn apply(&self, mut args: Vec<Value>, dep: &Value) -> Vec<Value> {
        args.insert(0, dep.clone());
        args
    }
}

/// Deep-merges mapping results into a trailing mapping argument.
///
/// Falls back to appending when either side is not a mapping, so the
/// combinator stays total.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merge;

impl Combinator for Merge {
    fn name(&self) -> &str {
        "merge"
    }

    fn apply(&self, mut args: Vec<Value>, dep: &Value) -> Vec<Value> {
        match (args.last_mut(), dep) {
            (Some(Value::Object(into)), Value::Object(from)) => {
                merge_into(into, from);
                args
            }
            _ => {
                args.push(dep.clone());
                args
            }
        }
    }
}

fn merge_into(into: &mut serde_json::Map<String, Value>, from: &serde_json::Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(key), value) {
            (Some(Value::Object(nested)), Value::Object(incoming)) => {
                merge_into(nested, incoming);
            }
            _ => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Registry of combinators keyed by name.
///
/// Pre-loaded with the built-ins; user code registers custom combinators at
/// reactor construction.
pub struct CombinatorRegistry {
    combinators: HashMap<String, Arc<dyn Combinator>>,
}

impl CombinatorRegistry {
    /// Create a registry holding the built-in combinators.
    pub fn new() -> Self {
        let mut registry = Self {
            combinators: HashMap::new(),
        };
        registry.register(Arc::new(Append));
        registry.register(Arc::new(Prepend));
        registry.register(Arc::new(Merge));
        registry
    }

    /// Register a combinator under its own name, replacing any previous one.
    pub fn register(&mut self, combinator: Arc<dyn Combinator>) {
        self.combinators
            .insert(combinator.name().to_string(), combinator);
    }

    /// Look up a combinator by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Combinator>> {
        self.combinators.get(name).cloned()
    }

    /// The combinator applied when a subtask names none.
    pub fn default_combinator(&self) -> Arc<dyn Combinator> {
        self.combinators[DEFAULT_COMBINATOR].clone()
    }

    /// Names of all registered combinators.
    pub fn names(&self) -> Vec<&str> {
        self.combinators.keys().map(String::as_str).collect()
    }
}

impl Default for CombinatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
