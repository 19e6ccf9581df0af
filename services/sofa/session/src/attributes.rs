//! Typed per-session attribute store.

use std::any::{type_name, Any};
use std::collections::HashMap;
use tracing::debug;

/// Heterogeneous map from name to a value of any `Send + Sync` type.
///
/// Reads are typed: asking for a name with the wrong type yields `None`
/// rather than a bad cast.
#[derive(Default)]
pub struct Attributes {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Attributes {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn set<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.values.insert(name.into(), Box::new(value));
    }

    /// Borrow a value if present and of type `T`
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        let value = self.values.get(name)?;
        let typed = value.downcast_ref::<T>();
        if typed.is_none() {
            debug!("Attribute '{}' is not a {}", name, type_name::<T>());
        }
        typed
    }

    /// Mutably borrow a value if present and of type `T`
    pub fn get_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.values.get_mut(name)?.downcast_mut::<T>()
    }

    /// Remove a value, returning whether one was present
    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    /// Whether a value of any type is stored under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let mut attrs = Attributes::new();
        attrs.set("inc", 3i32);
        assert_eq!(attrs.get::<i32>("inc"), Some(&3));

        *attrs.get_mut::<i32>("inc").unwrap() += 1;
        assert_eq!(attrs.get::<i32>("inc"), Some(&4));
    }

    #[test]
    fn test_type_mismatch_is_none() {
        let mut attrs = Attributes::new();
        attrs.set("inc", 3i32);
        assert!(attrs.get::<String>("inc").is_none());
        assert!(attrs.get::<i64>("inc").is_none());
        assert!(attrs.contains("inc"));
    }

    #[test]
    fn test_remove() {
        let mut attrs = Attributes::new();
        attrs.set("name", String::from("front"));
        assert!(attrs.remove("name"));
        assert!(!attrs.remove("name"));
        assert!(attrs.get::<String>("name").is_none());
        assert!(attrs.is_empty());
    }
}
