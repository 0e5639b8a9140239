//! Registry of built-in block modules.
//!
//! Builtins are constructors compiled into the application and registered
//! by name on the [`Runtime`](crate::Runtime). The loader falls back to
//! this registry whenever a shared object cannot be found or loaded, so a
//! statically linked deployment works with no filesystem at all.

use super::BlockModule;
use crate::dict::Dict;
use crate::error::Result;
use std::sync::Arc;

/// Constructor producing a fresh module instance per block load.
pub(crate) type BuiltinCtor = Arc<dyn Fn() -> Box<dyn BlockModule> + Send + Sync>;

pub(crate) struct BuiltinRegistry {
    ctors: Dict<BuiltinCtor>,
}

impl BuiltinRegistry {
    pub(crate) fn new() -> Self {
        Self { ctors: Dict::new() }
    }

    /// Register a constructor under `name`. Re-registering a name replaces
    /// the previous constructor; already-loaded blocks are unaffected.
    pub(crate) fn register(&mut self, name: &str, ctor: BuiltinCtor) -> Result<()> {
        self.ctors.remove(name);
        self.ctors.insert(name, ctor)?;
        tracing::debug!(module = name, "registered builtin block module");
        Ok(())
    }

    /// Build a fresh instance of the builtin registered under `name`.
    pub(crate) fn instantiate(&self, name: &str) -> Option<Box<dyn BlockModule>> {
        self.ctors.find(name).map(|ctor| ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{DeclareContext, DeclareStatus};

    struct Stub(u32);

    impl BlockModule for Stub {
        fn declare(&mut self, _ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            Ok(DeclareStatus::Keep)
        }

        fn get_parameter(&mut self, _name: &str) -> Result<crate::Value> {
            Ok(crate::Value::int(self.0 as i64))
        }
    }

    #[test]
    fn register_and_instantiate() {
        let mut reg = BuiltinRegistry::new();
        reg.register("stub", Arc::new(|| Box::new(Stub(1)))).unwrap();
        assert!(reg.instantiate("stub").is_some());
        assert!(reg.instantiate("missing").is_none());
    }

    #[test]
    fn reregistering_replaces() {
        let mut reg = BuiltinRegistry::new();
        reg.register("stub", Arc::new(|| Box::new(Stub(1)))).unwrap();
        reg.register("stub", Arc::new(|| Box::new(Stub(2)))).unwrap();
        let mut m = reg.instantiate("stub").unwrap();
        assert_eq!(m.get_parameter("v").unwrap().as_i64(), Some(2));
    }
}
