//! A model of the TAPs daisy-chained on one scan chain.  `Taps` lets the client address one TAP
//! as if it were the only one present: it works out how many bypass bits surround that TAP's
//! instruction and data registers, so the other TAPs can be held in BYPASS.
//!
//! Position 0 is the TAP nearest TDO.  Bits shifted first travel furthest down the chain, so
//! every payload starts with the padding for the TAPs in front of the target.
use bitfield::bitfield;
use bitvec::prelude::*;

use crate::error::{JtagError, Result};

bitfield! {
    /// A JTAG IDCODE, as captured in the data register after selecting the identification
    /// instruction.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// The IDCODE version.
    pub version, set_version: 31, 28;

    u16;
    /// The part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 Manufacturer ID.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// The continuation code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// The identity code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// The least-significant bit, set in every conforming IDCODE.
    pub lsbit, set_lsbit: 0;
}

impl IdCode {
    /// The raw 32-bit value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// `true` iff the least significant bit is set and the manufacturer identity is not one of
    /// the reserved values.
    pub fn valid(&self) -> bool {
        self.lsbit() && self.manufacturer() != 0 && self.manufacturer() != 127
    }

    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let cc = self.manufacturer_continuation();
        let id = self.manufacturer_identity();
        jep106::JEP106Code::new(cc, id).get()
    }
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.manufacturer_name() {
            Some(name) if self.valid() => write!(f, "0x{:08X} ({})", self.0, name),
            _ => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// One TAP on the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapDevice {
    position: usize,
    ir_len: usize,
    bypass_before: usize,
    bypass_after: usize,
    idcode: Option<IdCode>,
    idcode_instruction: Option<BitVec<u8>>,
}

impl TapDevice {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn ir_len(&self) -> usize {
        self.ir_len
    }

    /// Instruction register bits belonging to the TAPs before this one.
    pub fn bypass_before(&self) -> usize {
        self.bypass_before
    }

    /// Instruction register bits belonging to the TAPs after this one.
    pub fn bypass_after(&self) -> usize {
        self.bypass_after
    }

    pub fn idcode(&self) -> Option<IdCode> {
        self.idcode
    }

    /// Opcode selecting this TAP's identification register, if it is known.
    pub fn idcode_instruction(&self) -> Option<&BitSlice<u8>> {
        self.idcode_instruction.as_deref()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Taps {
    taps: Vec<TapDevice>,
    frozen: bool,
}

impl Taps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from instruction register lengths, nearest-TDO first.
    pub fn from_ir_lengths(ir_lengths: &[usize]) -> Result<Self> {
        let mut taps = Self::new();
        for irlen in ir_lengths {
            taps.add_tap(*irlen)?;
        }
        Ok(taps)
    }

    /// Add a TAP to the end of the chain with the given instruction register length.  Returns
    /// its position.
    pub fn add_tap(&mut self, ir_len: usize) -> Result<usize> {
        self.push(ir_len, None)
    }

    /// Like `add_tap`, also recording the opcode that selects the TAP's IDCODE register.
    pub fn add_tap_with_idcode(
        &mut self,
        ir_len: usize,
        idcode_instruction: &BitSlice<u8>,
    ) -> Result<usize> {
        if idcode_instruction.len() != ir_len {
            return Err(JtagError::invalid(format!(
                "IDCODE instruction is {} bits, IR is {ir_len}",
                idcode_instruction.len()
            )));
        }
        self.push(ir_len, Some(idcode_instruction.to_bitvec()))
    }

    fn push(&mut self, ir_len: usize, idcode_instruction: Option<BitVec<u8>>) -> Result<usize> {
        if self.frozen {
            return Err(JtagError::invalid("chain layout is frozen once scanning has started"));
        }
        if ir_len == 0 {
            return Err(JtagError::invalid("IR length must be at least 1"));
        }

        let position = self.taps.len();
        self.taps.push(TapDevice {
            position,
            ir_len,
            bypass_before: 0,
            bypass_after: 0,
            idcode: None,
            idcode_instruction,
        });
        self.recompute_bypass();
        Ok(position)
    }

    fn recompute_bypass(&mut self) {
        let total: usize = self.taps.iter().map(|t| t.ir_len).sum();
        let mut before = 0;
        for tap in &mut self.taps {
            tap.bypass_before = before;
            tap.bypass_after = total - before - tap.ir_len;
            before += tap.ir_len;
        }
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TapDevice> {
        self.taps.iter()
    }

    /// Total instruction register length of the chain.
    pub fn ir_len_total(&self) -> usize {
        self.taps.iter().map(|t| t.ir_len).sum()
    }

    pub fn tap(&self, index: usize) -> Result<&TapDevice> {
        self.taps.get(index).ok_or_else(|| {
            JtagError::invalid(format!(
                "TAP index {index} out of range, chain has {} TAPs",
                self.taps.len()
            ))
        })
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Record the IDCODE read back from TAP `index`.  Discovery fills this in once.
    pub(crate) fn set_idcode(&mut self, index: usize, idcode: IdCode) -> Result<()> {
        self.tap(index)?;
        let tap = &mut self.taps[index];
        if tap.idcode.is_some() {
            return Err(JtagError::invalid(format!("IDCODE of TAP {index} already recorded")));
        }
        tap.idcode = Some(idcode);
        Ok(())
    }

    /// The bits for one instruction register scan that loads `instruction` into TAP `index` and
    /// BYPASS (all ones) into every other TAP.
    pub fn ir_payload(&self, index: usize, instruction: &BitSlice<u8>) -> Result<BitVec<u8>> {
        let tap = self.tap(index)?;
        if instruction.len() != tap.ir_len {
            return Err(JtagError::invalid(format!(
                "instruction is {} bits, TAP {index} has a {}-bit IR",
                instruction.len(),
                tap.ir_len
            )));
        }

        let mut payload = BitVec::with_capacity(self.ir_len_total());
        payload.resize(tap.bypass_before, true);
        payload.extend_from_bitslice(instruction);
        payload.resize(payload.len() + tap.bypass_after, true);
        Ok(payload)
    }

    /// The bits for one data register scan that shifts `data` into TAP `index`, with one bypass
    /// bit for every other TAP.
    pub fn dr_payload(&self, index: usize, data: &BitSlice<u8>) -> Result<BitVec<u8>> {
        self.tap(index)?;
        let after = self.taps.len() - index - 1;

        let mut payload = BitVec::with_capacity(index + data.len() + after);
        payload.resize(index, true);
        payload.extend_from_bitslice(data);
        payload.resize(payload.len() + after, true);
        Ok(payload)
    }

    /// Number of bits a data register scan of `len` bits on TAP `index` occupies on the chain.
    pub fn dr_scan_len(&self, index: usize, len: usize) -> Result<usize> {
        self.tap(index)?;
        Ok(len + self.taps.len() - 1)
    }

    /// Pull TAP `index`'s `len` bits out of a data register capture of the whole chain.
    pub fn dr_extract(
        &self,
        index: usize,
        captured: &BitSlice<u8>,
        len: usize,
    ) -> Result<BitVec<u8>> {
        let total = self.dr_scan_len(index, len)?;
        if captured.len() != total {
            return Err(JtagError::invalid(format!(
                "capture is {} bits, expected {total}",
                captured.len()
            )));
        }
        Ok(captured[index..index + len].to_bitvec())
    }
}
