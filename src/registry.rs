//! Resolver: rebuilds closures and looks up capabilities by name.
//!
//! The persisted queue stores closures as `(kind, state)` and channels as
//! `(type, id)`. Reading it back needs a resolver that knows every closure
//! kind and capability the process network uses.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::channel::{Capability, ChannelType, SYNCH};
use crate::error::{KernelError, Result};
use crate::process::Process;
use crate::types::Value;

/// Rebuilds a closure from its persisted state.
pub type ClosureLoader = fn(&Value) -> anyhow::Result<Arc<dyn Process>>;

#[derive(Clone)]
pub struct Resolver {
    loaders: BTreeMap<&'static str, ClosureLoader>,
    capabilities: BTreeMap<&'static str, &'static Capability>,
}

impl Resolver {
    /// A resolver that knows only the built-in [`SYNCH`] capability.
    pub fn new() -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(SYNCH.name, &SYNCH);
        Self {
            loaders: BTreeMap::new(),
            capabilities,
        }
    }

    pub fn with_capability(mut self, capability: &'static Capability) -> Self {
        self.capabilities.insert(capability.name, capability);
        self
    }

    pub fn with_closure(mut self, kind: &'static str, loader: ClosureLoader) -> Self {
        self.loaders.insert(kind, loader);
        self
    }

    pub fn capability(&self, kind: &ChannelType) -> Result<&'static Capability> {
        self.capabilities
            .get(kind.as_str())
            .copied()
            .ok_or_else(|| KernelError::UnknownCapability(kind.to_string()))
    }

    /// Intern a persisted type name as the registered capability's type.
    pub fn channel_type(&self, name: &str) -> Result<ChannelType> {
        self.capabilities
            .get(name)
            .map(|cap| cap.channel_type())
            .ok_or_else(|| KernelError::UnknownCapability(name.to_string()))
    }

    pub fn load(&self, kind: &str, state: &Value) -> Result<Arc<dyn Process>> {
        let loader = self
            .loaders
            .get(kind)
            .ok_or_else(|| KernelError::UnknownClosure(kind.to_string()))?;
        loader(state).map_err(|e| KernelError::Corrupt(format!("closure '{kind}': {e:#}")))
    }

    pub fn closure_kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.loaders.keys().copied()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("closures", &self.loaders.keys().collect::<Vec<_>>())
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Message, Operation};
    use crate::vpu::ExecutionContext;

    static ECHO: Capability = Capability {
        name: "Echo",
        operations: &[Operation::asynchronous("ping", 1)],
    };

    #[derive(Debug)]
    struct Noop;

    impl Process for Noop {
        fn kind(&self) -> &'static str {
            "Noop"
        }
        fn state(&self) -> Value {
            Value::Unit
        }
        fn invoke(&self, _ctx: &mut ExecutionContext<'_>, _m: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn load_noop(state: &Value) -> anyhow::Result<Arc<dyn Process>> {
        anyhow::ensure!(*state == Value::Unit, "unexpected state {state}");
        Ok(Arc::new(Noop))
    }

    #[test]
    fn synch_is_always_known() {
        let r = Resolver::new();
        assert_eq!(r.capability(&SYNCH.channel_type()).unwrap().name, "Synch");
        assert!(r.capability(&ChannelType::named("Echo")).is_err());
    }

    #[test]
    fn loads_registered_closures() {
        let r = Resolver::new()
            .with_capability(&ECHO)
            .with_closure("Noop", load_noop);
        assert_eq!(r.load("Noop", &Value::Unit).unwrap().kind(), "Noop");
        assert!(matches!(
            r.load("Missing", &Value::Unit),
            Err(KernelError::UnknownClosure(_))
        ));
        assert!(matches!(
            r.load("Noop", &Value::Int(1)),
            Err(KernelError::Corrupt(_))
        ));
        assert_eq!(r.channel_type("Echo").unwrap(), ECHO.channel_type());
    }
}
