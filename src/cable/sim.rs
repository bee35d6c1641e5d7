//! A behavioural model of a scan chain, usable as a `Cable`.  Each simulated TAP has an
//! instruction register that captures `...01`, answers BYPASS (all ones) with a single bit,
//! optionally exposes a 32-bit IDCODE register, and routes every other instruction to a
//! read/write user data register.
//!
//! The model is clocked edge by edge exactly like real silicon: capture happens on the edge that
//! leaves Capture-xR, each edge taken in Shift-xR shifts one bit, and Update-xR latches as it is
//! entered.
use bitvec::prelude::*;

use crate::cable::{check_lengths, Cable, Capabilities};
use crate::error::{JtagError, Result};
use crate::statemachine::JtagState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Selected {
    Bypass,
    IdCode,
    User,
}

#[derive(Clone, Debug)]
pub struct SimTap {
    ir_len: usize,
    idcode: Option<(u32, BitVec<u8>)>,
    instruction: BitVec<u8>,
    ir_shift: BitVec<u8>,
    dr_shift: BitVec<u8>,
    user: BitVec<u8>,
}

impl SimTap {
    /// A TAP with an `ir_len`-bit instruction register and a 32-bit user register.
    ///
    /// # Panics
    ///
    /// If `ir_len` is 0.
    pub fn new(ir_len: usize) -> Self {
        assert!(ir_len > 0, "IR length must be at least 1");
        let mut tap = Self {
            ir_len,
            idcode: None,
            instruction: BitVec::new(),
            ir_shift: BitVec::repeat(false, ir_len),
            dr_shift: BitVec::repeat(false, 1),
            user: BitVec::repeat(false, 32),
        };
        tap.reset();
        tap
    }

    /// Give the TAP an IDCODE register selected by `instruction`.  Reset selects it, as the
    /// standard requires of TAPs that have one.
    ///
    /// # Panics
    ///
    /// If `instruction` is not as long as the instruction register.
    pub fn with_idcode(mut self, idcode: u32, instruction: &BitSlice<u8>) -> Self {
        assert_eq!(instruction.len(), self.ir_len, "IDCODE instruction length");
        self.idcode = Some((idcode, instruction.to_bitvec()));
        self.reset();
        self
    }

    /// Resize the user register to `len` bits, cleared.
    ///
    /// # Panics
    ///
    /// If `len` is 0.
    pub fn with_user_register(mut self, len: usize) -> Self {
        assert!(len > 0, "user register must be at least 1 bit");
        self.user = BitVec::repeat(false, len);
        self
    }

    /// The instruction currently latched.
    pub fn instruction(&self) -> &BitSlice<u8> {
        &self.instruction
    }

    pub fn user_register(&self) -> &BitSlice<u8> {
        &self.user
    }

    fn reset(&mut self) {
        self.instruction = match &self.idcode {
            Some((_, instruction)) => instruction.clone(),
            None => BitVec::repeat(true, self.ir_len),
        };
    }

    fn selected(&self) -> Selected {
        if self.instruction.all() {
            Selected::Bypass
        } else if matches!(&self.idcode, Some((_, i)) if *i == self.instruction) {
            Selected::IdCode
        } else {
            Selected::User
        }
    }

    fn capture_ir(&mut self) {
        self.ir_shift = BitVec::repeat(false, self.ir_len);
        self.ir_shift.set(0, true);
    }

    fn capture_dr(&mut self) {
        self.dr_shift = match self.selected() {
            Selected::Bypass => BitVec::repeat(false, 1),
            Selected::IdCode => {
                let mut dr = BitVec::repeat(false, 32);
                if let Some((idcode, _)) = &self.idcode {
                    dr.store_le(*idcode);
                }
                dr
            }
            Selected::User => self.user.clone(),
        };
    }

    fn update_ir(&mut self) {
        self.instruction = self.ir_shift.clone();
    }

    fn update_dr(&mut self) {
        if self.selected() == Selected::User {
            self.user = self.dr_shift.clone();
        }
    }
}

/// Shift `tdi` in at the TDI end of `reg`, returning the bit that falls out at the TDO end.
fn shift(reg: &mut BitVec<u8>, tdi: bool) -> bool {
    let out = reg.remove(0);
    reg.push(tdi);
    out
}

#[derive(Clone, Debug)]
pub struct SimChain {
    taps: Vec<SimTap>,
    state: JtagState,
    edges: u64,
    transfers: u64,
    frequency: u32,
    max_transfer_bits: Option<usize>,
    enabled: bool,
}

impl SimChain {
    /// A chain of `taps`, index 0 nearest TDO.  The model powers up in Test-Logic-Reset.
    pub fn new(taps: Vec<SimTap>) -> Self {
        Self {
            taps,
            state: JtagState::Reset,
            edges: 0,
            transfers: 0,
            frequency: 1_000_000,
            max_transfer_bits: None,
            enabled: false,
        }
    }

    /// Refuse transfers longer than `bits`, like a cable with a fixed buffer.
    pub fn with_max_transfer_bits(mut self, bits: usize) -> Self {
        self.max_transfer_bits = Some(bits);
        self
    }

    /// The state the simulated TAPs are really in.
    pub fn tap_state(&self) -> JtagState {
        self.state
    }

    /// # Panics
    ///
    /// If there is no TAP at `index`.
    pub fn tap(&self, index: usize) -> &SimTap {
        &self.taps[index]
    }

    /// Total number of TCK edges clocked so far.
    pub fn edges(&self) -> u64 {
        self.edges
    }

    /// Number of `transfer` calls served so far.
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// One TCK edge.  Returns the TDO value sampled on it.
    pub fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let tdo = match self.state {
            JtagState::CaptureIR => {
                self.taps.iter_mut().for_each(SimTap::capture_ir);
                false
            }
            JtagState::CaptureDR => {
                self.taps.iter_mut().for_each(SimTap::capture_dr);
                false
            }
            JtagState::ShiftIR => self
                .taps
                .iter_mut()
                .rev()
                .fold(tdi, |bit, tap| shift(&mut tap.ir_shift, bit)),
            JtagState::ShiftDR => self
                .taps
                .iter_mut()
                .rev()
                .fold(tdi, |bit, tap| shift(&mut tap.dr_shift, bit)),
            _ => false,
        };

        self.state = self.state.next(tms);
        match self.state {
            JtagState::UpdateIR => self.taps.iter_mut().for_each(SimTap::update_ir),
            JtagState::UpdateDR => self.taps.iter_mut().for_each(SimTap::update_dr),
            JtagState::Reset => self.taps.iter_mut().for_each(SimTap::reset),
            _ => {}
        }

        self.edges += 1;
        tdo
    }
}

impl Cable for SimChain {
    fn transfer(
        &mut self,
        tms: &BitSlice<u8>,
        tdi: &BitSlice<u8>,
        capture: bool,
    ) -> Result<BitVec<u8>> {
        check_lengths(tms, tdi)?;
        if let Some(max) = self.max_transfer_bits {
            if tms.len() > max {
                return Err(JtagError::unsupported(format!(
                    "transfer of {} bits exceeds {max}",
                    tms.len()
                )));
            }
        }

        self.transfers += 1;
        let mut tdo = BitVec::with_capacity(if capture { tms.len() } else { 0 });
        for (tms, tdi) in tms.iter().by_vals().zip(tdi.iter().by_vals()) {
            let bit = self.clock(tms, tdi);
            if capture {
                tdo.push(bit);
            }
        }
        Ok(tdo)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FREQUENCY | Capabilities::RAW_EDGE | Capabilities::ENABLE
    }

    fn max_transfer_bits(&self) -> Option<usize> {
        self.max_transfer_bits
    }

    fn frequency(&self) -> Result<u32> {
        Ok(self.frequency)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        if hz == 0 {
            return Err(JtagError::unsupported("0 Hz TCK"));
        }
        self.frequency = hz;
        Ok(hz)
    }

    fn clock_edge(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        Ok(self.clock(tms, tdi))
    }

    fn enable(&mut self) -> Result<()> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        self.enabled = false;
        Ok(())
    }
}
