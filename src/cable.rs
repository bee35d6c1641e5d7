//! Implementations for different JTAG hardware adapters live here.  Hardware adapters implement
//! the `Cable` trait.
//!
//! Only `transfer` is required: it clocks a run of edges with an explicit TMS and TDI value for
//! each one.  Everything else (frequency control, native state navigation, single edges,
//! enable/disable) is an optional capability.  The defaults report `Unsupported`, and
//! `capabilities()` lets a caller ask up front instead of trying.
use bitflags::bitflags;
use bitvec::prelude::*;

use crate::error::{JtagError, Result};
use crate::statemachine::JtagState;

pub mod accel;
pub mod bulk;
pub mod gpio;
pub mod sim;

bitflags! {
    /// Optional capabilities a cable may offer on top of `transfer`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const FREQUENCY = 1 << 0;
        const STATE = 1 << 1;
        const RAW_EDGE = 1 << 2;
        const ENABLE = 1 << 3;
    }
}

pub trait Cable {
    /// Clock `tms.len()` edges.  On edge `i` TMS is `tms[i]` and TDI is `tdi[i]`; TDO is sampled
    /// on the same edge.  Returns the sampled bits if `capture` is set, an empty vector otherwise.
    /// `tdi` must be the same length as `tms`.
    fn transfer(&mut self, tms: &BitSlice<u8>, tdi: &BitSlice<u8>, capture: bool)
        -> Result<BitVec<u8>>;

    /// The optional capabilities this cable implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Largest number of edges a single `transfer` accepts, `None` if unbounded.
    fn max_transfer_bits(&self) -> Option<usize> {
        None
    }

    /// The TCK frequency currently in effect, in Hz.
    fn frequency(&self) -> Result<u32> {
        Err(JtagError::unsupported("frequency query"))
    }

    /// Request a TCK frequency.  Cables that cannot hit it exactly settle on a rate they can
    /// produce, which may be the nearest one or the nearest one not faster, and return it.
    fn set_frequency(&mut self, _hz: u32) -> Result<u32> {
        Err(JtagError::unsupported("frequency control"))
    }

    /// The TAP state as tracked by the cable itself.
    fn state(&mut self) -> Result<JtagState> {
        Err(JtagError::unsupported("state query"))
    }

    /// Navigate to `state` using the cable's own sequencer.  `reset` forces Test-Logic-Reset
    /// first.
    fn set_state(&mut self, _state: JtagState, _reset: bool) -> Result<()> {
        Err(JtagError::unsupported("native state control"))
    }

    /// Clock a single edge and return TDO.
    fn clock_edge(&mut self, _tms: bool, _tdi: bool) -> Result<bool> {
        Err(JtagError::unsupported("raw edge control"))
    }

    fn enable(&mut self) -> Result<()> {
        Err(JtagError::unsupported("enable"))
    }

    fn disable(&mut self) -> Result<()> {
        Err(JtagError::unsupported("disable"))
    }
}

impl<C: Cable + ?Sized> Cable for Box<C> {
    fn transfer(
        &mut self,
        tms: &BitSlice<u8>,
        tdi: &BitSlice<u8>,
        capture: bool,
    ) -> Result<BitVec<u8>> {
        (**self).transfer(tms, tdi, capture)
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn max_transfer_bits(&self) -> Option<usize> {
        (**self).max_transfer_bits()
    }

    fn frequency(&self) -> Result<u32> {
        (**self).frequency()
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        (**self).set_frequency(hz)
    }

    fn state(&mut self) -> Result<JtagState> {
        (**self).state()
    }

    fn set_state(&mut self, state: JtagState, reset: bool) -> Result<()> {
        (**self).set_state(state, reset)
    }

    fn clock_edge(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        (**self).clock_edge(tms, tdi)
    }

    fn enable(&mut self) -> Result<()> {
        (**self).enable()
    }

    fn disable(&mut self) -> Result<()> {
        (**self).disable()
    }
}

/// Reject a transfer whose TMS and TDI vectors disagree in length.
pub(crate) fn check_lengths(tms: &BitSlice<u8>, tdi: &BitSlice<u8>) -> Result<()> {
    if tms.len() != tdi.len() {
        return Err(JtagError::invalid(format!(
            "TMS has {} bits but TDI has {}",
            tms.len(),
            tdi.len()
        )));
    }
    Ok(())
}

/// Pack a bit slice into bytes, least significant bit first.
pub(crate) fn to_bytes(bits: &BitSlice<u8>) -> Vec<u8> {
    let mut bv = BitVec::<u8>::with_capacity(bits.len());
    bv.extend_from_bitslice(bits);
    bv.set_uninitialized(false);
    bv.into_vec()
}
