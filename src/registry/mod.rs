//! Command and module registry plumbing.
//!
//! A deployment (client or server) declares a closed command table: one
//! struct field per command it can issue. The table is composed from
//! `(module, executor)` bindings, with exactly one executor per command.
//! Modules are constructed before the table exists and hold a
//! [`ModuleHandle`]; composition resolves every handle with the shared
//! table exactly once, so a module accidentally bound into two registries
//! is caught at construction instead of misrouting commands at runtime.
//!
//! ```text
//! bindings ──compose──> Arc<Commands> ──resolve──> every ModuleHandle
//!                            │
//!              command.execute(payload)
//!              pre hooks -> executor -> post hooks
//! ```

pub mod command;
pub mod link;
pub mod pubsub;

use std::sync::Arc;

use thiserror::Error;

use self::link::Link;

/// Errors raised while composing a command table.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module `{module}` is already bound to another registry")]
    ModuleAlreadyBound { module: &'static str },
    #[error("command `{command}` is bound to more than one executor")]
    DuplicateExecutor { command: &'static str },
    #[error("command `{command}` has no bound executor")]
    MissingExecutor { command: &'static str },
}

/// A module's identity plus its deferred reference to the command table.
///
/// Commands issued through [`ModuleHandle::table`] before composition
/// finishes simply wait; nothing is lost or reordered.
pub struct ModuleHandle<T> {
    name: &'static str,
    link: Link<T>,
}

impl<T> ModuleHandle<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            link: Link::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The composed command table, waiting for composition if necessary.
    pub async fn table(&self) -> Arc<T> {
        self.link.value().await
    }

    /// The composed command table if composition already happened.
    pub fn try_table(&self) -> Option<Arc<T>> {
        self.link.try_value()
    }

    pub(crate) fn resolve(&self, table: Arc<T>) -> Result<(), RegistryError> {
        self.link
            .resolve(table)
            .map_err(|_| RegistryError::ModuleAlreadyBound { module: self.name })
    }

    pub(crate) fn same_module(&self, other: &Self) -> bool {
        self.link.same_cell(&other.link)
    }
}

impl<T> Clone for ModuleHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            link: self.link.clone(),
        }
    }
}

/// Hand the composed table to each distinct module exactly once.
pub(crate) fn distribute<T>(
    table: &Arc<T>,
    members: Vec<ModuleHandle<T>>,
) -> Result<(), RegistryError> {
    let mut distinct: Vec<ModuleHandle<T>> = Vec::new();
    for member in members {
        if !distinct.iter().any(|known| known.same_module(&member)) {
            distinct.push(member);
        }
    }
    for member in distinct {
        member.resolve(Arc::clone(table))?;
    }
    Ok(())
}

/// Reject composition when a command slot was never filled.
pub(crate) fn required<E>(slot: Option<E>, command: &'static str) -> Result<E, RegistryError> {
    slot.ok_or(RegistryError::MissingExecutor { command })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_waits_for_table() {
        let handle: ModuleHandle<u32> = ModuleHandle::new("worker");
        assert!(handle.try_table().is_none());

        let waiter = handle.clone();
        let task = tokio::spawn(async move { *waiter.table().await });
        handle.resolve(Arc::new(7)).unwrap();
        assert_eq!(task.await.unwrap(), 7);
        assert_eq!(handle.try_table().as_deref(), Some(&7));
    }

    #[tokio::test]
    async fn test_distribute_resolves_each_module_once() {
        let first: ModuleHandle<u32> = ModuleHandle::new("first");
        let second: ModuleHandle<u32> = ModuleHandle::new("second");
        let table = Arc::new(1);
        // the same module listed twice only resolves once
        distribute(&table, vec![first.clone(), first.clone(), second.clone()]).unwrap();
        assert!(first.try_table().is_some());
        assert!(second.try_table().is_some());
    }

    #[tokio::test]
    async fn test_module_cannot_join_two_registries() {
        let shared: ModuleHandle<u32> = ModuleHandle::new("shared");
        distribute(&Arc::new(1), vec![shared.clone()]).unwrap();
        let err = distribute(&Arc::new(2), vec![shared.clone()]).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ModuleAlreadyBound { module: "shared" }
        ));
    }
}
