use std::iter::FromIterator;

use crate::module::{SymbolFile, SymbolLookup};

/// The modules loaded into a debugged process.
///
/// Modules are kept in the order they were added. Lookups return the first module whose code
/// bounds contain the address.
#[derive(Debug, Default)]
pub struct SymbolTable<'data> {
    modules: Vec<SymbolFile<'data>>,
}

impl<'data> SymbolTable<'data> {
    /// Creates an empty symbol table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module.
    pub fn add(&mut self, module: SymbolFile<'data>) {
        tracing::trace!(module = module.name(), bias = module.bias(), "adding module");
        self.modules.push(module);
    }

    /// Removes the module with the given name, returning it.
    pub fn remove(&mut self, name: &str) -> Option<SymbolFile<'data>> {
        let index = self.modules.iter().position(|m| m.name() == name)?;
        Some(self.modules.remove(index))
    }

    /// Finds the module whose code bounds contain the runtime `address`.
    pub fn find_module(&self, address: u64) -> Option<&SymbolFile<'data>> {
        self.modules.iter().find(|module| module.contains(address))
    }

    /// Resolves a runtime address to a function symbol of any module.
    pub fn lookup(&self, address: u64) -> Option<SymbolLookup> {
        self.find_module(address)?.lookup(address)
    }

    /// Iterates all registered modules.
    pub fn modules(&self) -> impl Iterator<Item = &SymbolFile<'data>> {
        self.modules.iter()
    }

    /// The number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no module has been registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl<'data> FromIterator<SymbolFile<'data>> for SymbolTable<'data> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = SymbolFile<'data>>,
    {
        Self {
            modules: Vec::from_iter(iter),
        }
    }
}
