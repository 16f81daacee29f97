//! Labels: logical locations in a code stream.
//!
//! A label is an opaque `Copy` handle; two labels are equal iff they are the
//! same label (identity, not value). The bci a label stands for lives in the
//! owning [`LabelContext`], so a branch can reference a label long before the
//! label's position is known.

use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// An opaque location handle. See the module docs for the identity contract.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Label {
    context: u32,
    id: u32,
}

const UNBOUND: i64 = -1;

/// Owns labels and their bci bindings.
///
/// Each context has a distinct identity; asking a context about a label it
/// did not create is an error rather than a wrong answer.
pub struct LabelContext {
    id: u32,
    /// bci per label id, `UNBOUND` until bound.
    bcis: Vec<i64>,
    /// Labels handed out for specific bcis (decoding side), so every branch
    /// to the same target shares one label.
    by_bci: FxHashMap<u32, Label>,
}

fn fresh_context_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Default for LabelContext {
    fn default() -> Self {
        LabelContext::new()
    }
}

impl LabelContext {
    pub fn new() -> LabelContext {
        LabelContext { id: fresh_context_id(), bcis: vec![], by_bci: FxHashMap::default() }
    }

    /// A fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label { context: self.id, id: self.bcis.len() as u32 };
        self.bcis.push(UNBOUND);
        label
    }

    pub fn owns(&self, label: Label) -> bool {
        label.context == self.id
    }

    fn slot(&self, label: Label) -> Result<usize> {
        if !self.owns(label) {
            return Err(Error::IllegalArgument(
                "label belongs to a different label context".to_string(),
            ));
        }
        Ok(label.id as usize)
    }

    /// Bind `label` to `bci`. Rebinding to the same bci is idempotent;
    /// rebinding to a different bci fails.
    pub fn bind(&mut self, label: Label, bci: u32) -> Result<()> {
        let slot = self.slot(label)?;
        match self.bcis[slot] {
            UNBOUND => {
                self.bcis[slot] = bci as i64;
                Ok(())
            }
            bound if bound == bci as i64 => Ok(()),
            bound => Err(Error::IllegalState(format!(
                "label already bound at bci {bound}, cannot rebind to {bci}"
            ))),
        }
    }

    /// The bci of a bound label, or [`Error::InvalidCode`] while unbound.
    pub fn bci(&self, label: Label) -> Result<u32> {
        match self.bci_opt(label)? {
            Some(bci) => Ok(bci),
            None => Err(Error::InvalidCode("label referenced but never bound".to_string())),
        }
    }

    pub fn bci_opt(&self, label: Label) -> Result<Option<u32>> {
        let slot = self.slot(label)?;
        match self.bcis[slot] {
            UNBOUND => Ok(None),
            bci => Ok(Some(bci as u32)),
        }
    }

    /// The label standing for `bci`, creating and binding one on first
    /// request. Decoders use this so all references to one target share a
    /// label.
    pub fn label_at_bci(&mut self, bci: u32) -> Label {
        if let Some(label) = self.by_bci.get(&bci) {
            return *label;
        }
        let label = self.new_label();
        self.bcis[label.id as usize] = bci as i64;
        self.by_bci.insert(bci, label);
        label
    }

    /// All labels created via [`Self::label_at_bci`], i.e. the referenced
    /// targets of a decoded code array.
    pub fn bound_bcis(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_bci.keys().copied()
    }

    /// The label previously handed out for `bci`, without creating one.
    pub fn bound_label_at(&self, bci: u32) -> Option<Label> {
        self.by_bci.get(&bci).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_identity_equal() {
        let mut ctx = LabelContext::new();
        let a = ctx.new_label();
        let b = ctx.new_label();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }

    #[test]
    fn bind_is_idempotent_on_same_bci() {
        let mut ctx = LabelContext::new();
        let l = ctx.new_label();
        ctx.bind(l, 4).unwrap();
        ctx.bind(l, 4).unwrap();
        assert_eq!(ctx.bci(l).unwrap(), 4);
        assert!(matches!(ctx.bind(l, 8), Err(Error::IllegalState(_))));
    }

    #[test]
    fn unbound_label_has_no_bci() {
        let mut ctx = LabelContext::new();
        let l = ctx.new_label();
        assert!(matches!(ctx.bci(l), Err(Error::InvalidCode(_))));
        assert_eq!(ctx.bci_opt(l).unwrap(), None);
    }

    #[test]
    fn foreign_labels_are_rejected() {
        let mut a = LabelContext::new();
        let mut b = LabelContext::new();
        let l = a.new_label();
        assert!(matches!(b.bind(l, 0), Err(Error::IllegalArgument(_))));
    }

    #[test]
    fn label_at_bci_is_shared() {
        let mut ctx = LabelContext::new();
        let l1 = ctx.label_at_bci(10);
        let l2 = ctx.label_at_bci(10);
        assert_eq!(l1, l2);
        assert_eq!(ctx.bci(l1).unwrap(), 10);
    }
}
