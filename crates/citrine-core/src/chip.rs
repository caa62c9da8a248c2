//! Chip generations.
//!
//! A generation contributes exactly two things to the core: the state-atom
//! registry (which fixes emission order and worst-case emission size) and
//! the reaction to losing the hardware to another context. Everything else
//! is generation-independent.

use citrine_drm::cmd::packet_header;

use crate::state::{AtomPolicy, StateAtom, StateList};

pub trait HwGeneration {
    fn name(&self) -> &'static str;

    /// Build this chip's atom registry, in emission order. Atoms start
    /// clean; the context dirties them all once at creation.
    fn build_state_list(&self) -> StateList;

    /// The lock came back from another context: hardware state is unknown.
    fn lock_regained(&self, atoms: &mut StateList) {
        atoms.mark_all_dirty();
    }
}

/// A raw packet atom: header dword plus zeroed register payload. The state
/// tracker above the core overwrites payloads; zeros are the reset values.
fn atom(name: &'static str, payload_dwords: u16) -> StateAtom {
    let mut payload = vec![packet_header(payload_dwords)];
    payload.extend(std::iter::repeat(0).take(usize::from(payload_dwords)));
    StateAtom::new(name, payload)
}

fn atom_never(name: &'static str, payload_dwords: u16) -> StateAtom {
    let mut payload = vec![packet_header(payload_dwords)];
    payload.extend(std::iter::repeat(0).take(usize::from(payload_dwords)));
    StateAtom::with_policy(name, payload, AtomPolicy::Never)
}

/// First Citrine generation: fixed-function transform, three texture units.
#[derive(Debug, Default)]
pub struct Cn100;

impl HwGeneration for Cn100 {
    fn name(&self) -> &'static str {
        "CN100"
    }

    fn build_state_list(&self) -> StateList {
        let mut atoms = StateList::new();
        atoms.push(atom("ctx", 12));
        atoms.push(atom("set", 6));
        atoms.push(atom("lin", 5));
        atoms.push(atom("msk", 4));
        atoms.push(atom("vpt", 7));
        atoms.push(atom("fog", 4));
        atoms.push(atom("tex0", 9));
        atoms.push(atom("tex1", 9));
        atoms.push(atom("tex2", 9));
        // No guard-band registers on this generation.
        atoms.push(atom_never("glt", 4));
        atoms
    }
}

/// Second generation: hardware transform engine and six texture units.
#[derive(Debug, Default)]
pub struct Cn200;

impl HwGeneration for Cn200 {
    fn name(&self) -> &'static str {
        "CN200"
    }

    fn build_state_list(&self) -> StateList {
        let mut atoms = StateList::new();
        atoms.push(atom("ctx", 14));
        atoms.push(atom("set", 6));
        atoms.push(atom("lin", 5));
        atoms.push(atom("msk", 4));
        atoms.push(atom("vpt", 9));
        atoms.push(atom("vap", 8));
        atoms.push(atom("vtx", 5));
        for name in ["tex0", "tex1", "tex2", "tex3", "tex4", "tex5"] {
            atoms.push(atom(name, 11));
        }
        atoms.push(atom("zbs", 5));
        atoms.push(atom("glt", 4));
        atoms
    }
}
