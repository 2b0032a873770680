// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function module registry.
//!
//! Modules are compiled into the binary and registered by name. The
//! configured locator picks one of them at start-up.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::builtin;
use crate::error::InvokerError;
use crate::function::ModuleExports;

/// Locator prefix for modules registered in the running binary.
pub const BUILTIN_SCHEME: &str = "builtin:";

type ModuleFactory = Arc<dyn Fn() -> ModuleExports + Send + Sync>;

/// Named function module factories.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    modules: BTreeMap<String, ModuleFactory>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `echo` and `echo-stream`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("echo", builtin::echo)
            .register("echo-stream", builtin::echo_stream);
        registry
    }

    /// Register a module factory under `name`, replacing any previous one.
    ///
    /// The factory runs once, when the module is loaded.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> ModuleExports + Send + Sync + 'static,
    {
        self.modules.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Resolve a locator (`name` or `builtin:name`) and build its exports.
    pub fn load(&self, locator: &str) -> Result<ModuleExports, InvokerError> {
        let locator = locator.trim();
        let name = locator.strip_prefix(BUILTIN_SCHEME).unwrap_or(locator);

        let factory = self
            .modules
            .get(name)
            .ok_or_else(|| InvokerError::UnknownFunction {
                locator: locator.to_string(),
            })?;

        debug!(module = name, "loading function module");
        Ok(factory())
    }
}
