//! A cable for JTAG engines that offload whole transfers to hardware through a register block.
//!
//! A transfer is programmed as a length, a direction and two buffers of TMS and TDI words; the
//! engine is started through CTRL and signals completion in STATUS.  The engine also tracks the
//! TAP state itself and can navigate to a requested state on its own.
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use bitvec::prelude::*;

use crate::cable::{check_lengths, to_bytes, Cable, Capabilities};
use crate::error::{JtagError, Result};
use crate::statemachine::JtagState;

/// 32-bit register access to the engine, e.g. a memory mapped window or a debug bridge.
pub trait RegisterAccess {
    type Error: fmt::Debug;

    fn read(&mut self, offset: u32) -> Result<u32, Self::Error>;
    fn write(&mut self, offset: u32, value: u32) -> Result<(), Self::Error>;
}

pub const REG_CTRL: u32 = 0x00;
pub const REG_STATUS: u32 = 0x04;
pub const REG_LENGTH: u32 = 0x08;
pub const REG_DIRECTION: u32 = 0x0c;
/// Reads back the current TAP state; written with the end state for `CTRL_GOTO`.
pub const REG_STATE: u32 = 0x10;
pub const REG_DIVIDER: u32 = 0x14;
pub const REG_TMS: u32 = 0x100;
pub const REG_TDI: u32 = 0x200;
pub const REG_TDO: u32 = 0x300;

pub const CTRL_ENABLE: u32 = 1;
pub const CTRL_START: u32 = 1 << 1;
pub const CTRL_GOTO: u32 = 1 << 2;
pub const CTRL_RESET: u32 = 1 << 3;

pub const STATUS_DONE: u32 = 1;
pub const STATUS_ERROR: u32 = 1 << 1;

pub const DIRECTION_CAPTURE: u32 = 1;

/// Each buffer window is 64 words.
pub const MAX_BUFFER_BITS: usize = 64 * 32;

const MAX_DIVIDER: u32 = 0xffff;

/// Pause between STATUS reads while waiting for the engine.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Clock feeding the TCK divider.
    pub base_clock_hz: u32,
    /// Size of the TMS/TDI/TDO buffers, at most `MAX_BUFFER_BITS`.
    pub buffer_bits: usize,
    /// Fixed allowance added to the computed duration of every transfer.
    pub completion_margin: Duration,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            base_clock_hz: 100_000_000,
            buffer_bits: MAX_BUFFER_BITS,
            completion_margin: Duration::from_secs(1),
        }
    }
}

pub struct Accelerator<R> {
    regs: R,
    config: AcceleratorConfig,
    divider: u32,
    ctrl: u32,
}

impl<R: RegisterAccess> Accelerator<R> {
    pub fn new(regs: R, mut config: AcceleratorConfig) -> Self {
        config.buffer_bits = config.buffer_bits.clamp(1, MAX_BUFFER_BITS);
        Self {
            regs,
            config,
            divider: 0,
            ctrl: 0,
        }
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    fn read(&mut self, offset: u32) -> Result<u32> {
        self.regs.read(offset).map_err(JtagError::bus_fault)
    }

    fn write(&mut self, offset: u32, value: u32) -> Result<()> {
        self.regs.write(offset, value).map_err(JtagError::bus_fault)
    }

    fn achieved_hz(&self) -> u32 {
        self.config.base_clock_hz / (2 * (self.divider + 1))
    }

    /// How long a transfer of `bits` edges may take: its nominal duration at the current TCK,
    /// doubled, plus the configured margin.
    pub fn completion_timeout(&self, bits: usize) -> Duration {
        let hz = u64::from(self.achieved_hz().max(1));
        let nominal = Duration::from_nanos(2 * bits as u64 * 1_000_000_000 / hz);
        self.config.completion_margin + nominal
    }

    fn wait_done(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.read(REG_STATUS)?;
            if status & STATUS_ERROR != 0 {
                return Err(JtagError::BusFault(format!(
                    "engine reported an error (status 0x{status:08x})"
                )));
            }
            if status & STATUS_DONE != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!("JTAG engine did not complete within {timeout:?}");
                return Err(JtagError::Timeout(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_buffer(&mut self, base: u32, bits: &BitSlice<u8>) -> Result<()> {
        for (i, word) in to_bytes(bits).chunks(4).enumerate() {
            let mut le = [0u8; 4];
            le[..word.len()].copy_from_slice(word);
            self.write(base + 4 * i as u32, u32::from_le_bytes(le))?;
        }
        Ok(())
    }

    fn read_buffer(&mut self, base: u32, bits: usize) -> Result<BitVec<u8>> {
        let mut out = BitVec::<u8>::with_capacity(bits);
        for i in 0..bits.div_ceil(32) {
            let word = self.read(base + 4 * i as u32)?;
            out.extend_from_bitslice(word.to_le_bytes().view_bits::<Lsb0>());
        }
        out.truncate(bits);
        Ok(out)
    }
}

impl<R: RegisterAccess> Cable for Accelerator<R> {
    fn transfer(
        &mut self,
        tms: &BitSlice<u8>,
        tdi: &BitSlice<u8>,
        capture: bool,
    ) -> Result<BitVec<u8>> {
        check_lengths(tms, tdi)?;
        let bits = tms.len();
        if bits == 0 {
            return Ok(BitVec::new());
        }
        if bits > self.config.buffer_bits {
            return Err(JtagError::unsupported(format!(
                "transfer of {bits} bits exceeds the {}-bit engine buffer",
                self.config.buffer_bits
            )));
        }

        self.write(REG_LENGTH, bits as u32)?;
        self.write(REG_DIRECTION, if capture { DIRECTION_CAPTURE } else { 0 })?;
        self.write_buffer(REG_TMS, tms)?;
        self.write_buffer(REG_TDI, tdi)?;
        self.write(REG_CTRL, self.ctrl | CTRL_START)?;
        tracing::trace!("engine transfer of {bits} bits started");

        self.wait_done(self.completion_timeout(bits))?;

        if capture {
            self.read_buffer(REG_TDO, bits)
        } else {
            Ok(BitVec::new())
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FREQUENCY | Capabilities::STATE | Capabilities::ENABLE
    }

    fn max_transfer_bits(&self) -> Option<usize> {
        Some(self.config.buffer_bits)
    }

    fn frequency(&self) -> Result<u32> {
        Ok(self.achieved_hz())
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        if hz == 0 {
            return Err(JtagError::unsupported("0 Hz TCK"));
        }
        let base = u64::from(self.config.base_clock_hz);
        let divider = base.div_ceil(2 * u64::from(hz)).saturating_sub(1);
        let divider = divider.min(u64::from(MAX_DIVIDER)) as u32;

        self.write(REG_DIVIDER, divider)?;
        self.divider = divider;
        Ok(self.achieved_hz())
    }

    fn state(&mut self) -> Result<JtagState> {
        let raw = self.read(REG_STATE)?;
        JtagState::ALL
            .get(raw as usize)
            .copied()
            .ok_or_else(|| JtagError::BusFault(format!("engine reported TAP state {raw}")))
    }

    fn set_state(&mut self, state: JtagState, reset: bool) -> Result<()> {
        self.write(REG_STATE, state as u32)?;
        let reset = if reset { CTRL_RESET } else { 0 };
        self.write(REG_CTRL, self.ctrl | CTRL_GOTO | reset)?;
        // Navigation never takes more than a reset plus one path
        self.wait_done(self.completion_timeout(16))
    }

    fn enable(&mut self) -> Result<()> {
        self.write(REG_CTRL, CTRL_ENABLE)?;
        self.ctrl = CTRL_ENABLE;
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        self.write(REG_CTRL, 0)?;
        self.ctrl = 0;
        Ok(())
    }
}
