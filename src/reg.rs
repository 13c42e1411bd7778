// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-type callback table for user messages.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::frame::TYPE_MAX;

/// Callback for one user message type: `(type, node_id, body)`.
pub type Handler = Arc<dyn Fn(u16, i32, &[u8]) -> Result<()> + Send + Sync>;

/// Outcome of [`Registry::dispatch`].
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Unregistered,
    Failed,
}

/// Fixed table indexed by type code. Filled before launch, read-only after.
pub struct Registry {
    slots: Box<[Option<Handler>]>,
}

impl Registry {
    pub fn new() -> Self {
        Self { slots: vec![None; TYPE_MAX as usize].into_boxed_slice() }
    }

    pub fn register(&mut self, ty: u16, handler: Handler) -> Result<()> {
        let slot = self.slots.get_mut(ty as usize).ok_or(Error::TypeOutOfRange(ty))?;
        if slot.is_some() {
            return Err(Error::RepeatRegister(ty));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn is_registered(&self, ty: u16) -> bool {
        self.slots.get(ty as usize).is_some_and(Option::is_some)
    }

    /// Run the handler for `ty`. Handler errors are logged, not returned.
    pub fn dispatch(&self, ty: u16, node_id: i32, body: &[u8]) -> Dispatch {
        let Some(Some(h)) = self.slots.get(ty as usize) else {
            tracing::debug!(ty, node_id, "no handler registered");
            return Dispatch::Unregistered;
        };
        match h(ty, node_id, body) {
            Ok(()) => Dispatch::Handled,
            Err(e) => {
                tracing::warn!(ty, node_id, error = %e, "handler failed");
                Dispatch::Failed
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<usize> = self.slots.iter().enumerate().filter(|(_, s)| s.is_some()).map(|(i, _)| i).collect();
        f.debug_struct("Registry").field("types", &types).finish()
    }
}
