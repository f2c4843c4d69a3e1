//! Services handed to running closures.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Services made available to running continuations, keyed by type.
///
/// Built before the VPU is constructed; the VPU never mutates it.
#[derive(Clone, Default)]
pub struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.map.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|svc| svc.downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock(u64);

    #[test]
    fn lookup_by_type() {
        let ext = Extensions::new().with(Clock(42)).with(String::from("tenant-a"));
        assert_eq!(ext.get::<Clock>().map(|c| c.0), Some(42));
        assert_eq!(ext.get::<String>().map(String::as_str), Some("tenant-a"));
        assert!(ext.get::<u8>().is_none());
        assert_eq!(ext.len(), 2);
    }
}
