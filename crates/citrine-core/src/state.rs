//! State atoms: named, pre-encoded chunks of hardware state.
//!
//! Each atom owns the command dwords that program one group of registers.
//! The driver never diffs register values at emission time; it tracks a
//! dirty bit per atom and replays every dirty atom, in registration order,
//! at the head of a fresh command buffer. After a flush (or a lock that
//! changed hands) *all* atoms are dirty, which is what makes hardware state
//! survive other contexts using the chip.

use crate::cmdbuf::CmdBuf;

/// Whether an atom participates in emission. `Never` atoms exist so a
/// generation can register groups that are not valid on the present chip
/// while keeping one fixed registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomPolicy {
    Always,
    Never,
}

#[derive(Debug)]
pub struct StateAtom {
    name: &'static str,
    payload: Vec<u32>,
    policy: AtomPolicy,
    dirty: bool,
}

impl StateAtom {
    pub fn new(name: &'static str, payload: Vec<u32>) -> Self {
        Self::with_policy(name, payload, AtomPolicy::Always)
    }

    pub fn with_policy(name: &'static str, payload: Vec<u32>, policy: AtomPolicy) -> Self {
        Self {
            name,
            payload,
            policy,
            dirty: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> AtomPolicy {
        self.policy
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn payload(&self) -> &[u32] {
        &self.payload
    }

    /// Replace the atom's dwords and mark it for emission. The payload
    /// length is fixed at registration because buffer sizing depends on it.
    pub fn set_payload(&mut self, payload: &[u32]) {
        assert_eq!(
            payload.len(),
            self.payload.len(),
            "atom {} payload length is fixed",
            self.name
        );
        self.payload.copy_from_slice(payload);
        self.dirty = true;
    }

    /// Dwords this atom contributes to an emission.
    pub fn emit_len(&self) -> u32 {
        match self.policy {
            AtomPolicy::Always => self.payload.len() as u32,
            AtomPolicy::Never => 0,
        }
    }
}

/// The ordered atom registry of one context.
#[derive(Debug, Default)]
pub struct StateList {
    atoms: Vec<StateAtom>,
    max_emit: u32,
}

impl StateList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an atom at the tail. Order is emission order.
    pub fn push(&mut self, atom: StateAtom) {
        // The worst-case size counts every atom, including `Never` ones, so
        // a policy change on a live context can never outgrow the buffer.
        self.max_emit += atom.payload.len() as u32;
        self.atoms.push(atom);
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Upper bound of dwords one full emission can write.
    pub fn max_emit(&self) -> u32 {
        self.max_emit
    }

    pub fn atom(&self, name: &str) -> Option<&StateAtom> {
        self.atoms.iter().find(|a| a.name == name)
    }

    pub fn atom_mut(&mut self, name: &str) -> Option<&mut StateAtom> {
        self.atoms.iter_mut().find(|a| a.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateAtom> {
        self.atoms.iter()
    }

    pub fn mark_all_dirty(&mut self) {
        for atom in &mut self.atoms {
            atom.dirty = true;
        }
    }

    pub fn any_dirty(&self) -> bool {
        self.atoms.iter().any(|a| a.dirty)
    }

    /// Dwords the dirty subset would emit right now.
    pub fn dirty_len(&self) -> u32 {
        self.atoms
            .iter()
            .filter(|a| a.dirty)
            .map(StateAtom::emit_len)
            .sum()
    }

    /// Write every dirty atom into `buf` in registration order and clean
    /// them. Returns the dwords written. The caller reserves space; the
    /// buffer asserts on overrun.
    pub fn emit_dirty(&mut self, buf: &mut CmdBuf) -> u32 {
        let mut emitted = 0;
        for atom in &mut self.atoms {
            if !atom.dirty {
                continue;
            }
            if atom.policy == AtomPolicy::Always && !atom.payload.is_empty() {
                buf.extend_from_slice(&atom.payload);
                emitted += atom.payload.len() as u32;
            }
            atom.dirty = false;
        }
        emitted
    }
}
