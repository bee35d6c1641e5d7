//! A bit-banged cable driving TCK/TMS/TDI and sampling TDO through embedded-hal pins.
//!
//! Every edge is produced in software: TMS and TDI are set up, the cable waits half a period,
//! raises TCK, samples TDO, waits the other half and drops TCK again.  The delay occupies the
//! calling thread.  There is no native state tracking, so the engine always navigates with TMS
//! paths on this cable.
use bitvec::prelude::*;
use embedded_hal::{delay::DelayNs, digital::{InputPin, OutputPin, PinState}};

use crate::cable::{check_lengths, Cable, Capabilities};
use crate::error::{JtagError, Result};

const NS_PER_SEC: u64 = 1_000_000_000;

/// Half of a TCK period in nanoseconds for `hz`, clamped to what `DelayNs` can express.
///
/// Rounds up, so the result is the nearest rate that is not faster than `hz`, which is not
/// always the nearest rate.  For 3 MHz it picks 167 ns (2 994 011 Hz) even though 166 ns
/// (3 003 003 Hz) is closer.
fn half_period_ns(hz: u32) -> u32 {
    let twice = 2 * u64::from(hz);
    NS_PER_SEC.div_ceil(twice).clamp(1, u64::from(u32::MAX)) as u32
}

fn achieved_hz(half_period: u32) -> u32 {
    (NS_PER_SEC / (2 * u64::from(half_period))) as u32
}

pub struct Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms,
}

impl<Clk, Tdi, Tdo, Tms, Delay> Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    /// Take ownership of the four JTAG pins.  `hz` is clamped like `set_frequency` does; a
    /// request of 0 Hz is treated as 1 Hz.
    pub fn new(hz: u32, mut clock: Clk, tdi: Tdi, tdo: Tdo, tms: Tms, delay: Delay) -> Result<Self> {
        // clock idles low
        clock.set_low().map_err(JtagError::bus_fault)?;
        let half_period = half_period_ns(hz.max(1));
        Ok(Gpio { half_period, delay, clock, tdi, tdo, tms })
    }

    /// Release the pins.
    pub fn free(self) -> (Clk, Tdi, Tdo, Tms, Delay) {
        (self.clock, self.tdi, self.tdo, self.tms, self.delay)
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> Cable for Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    fn transfer(&mut self, tms: &BitSlice<u8>, tdi: &BitSlice<u8>, capture: bool) -> Result<BitVec<u8>> {
        check_lengths(tms, tdi)?;

        let mut out = BitVec::with_capacity(if capture { tms.len() } else { 0 });
        for (tms, tdi) in tms.iter().by_vals().zip(tdi.iter().by_vals()) {
            let bit = self.clock_edge(tms, tdi)?;
            if capture {
                out.push(bit);
            }
        }
        Ok(out)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FREQUENCY | Capabilities::RAW_EDGE
    }

    fn frequency(&self) -> Result<u32> {
        Ok(achieved_hz(self.half_period))
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        if hz == 0 {
            return Err(JtagError::unsupported("0 Hz TCK"));
        }
        self.half_period = half_period_ns(hz);
        let achieved = achieved_hz(self.half_period);
        if achieved != hz {
            tracing::debug!("bitbang TCK clamped from {hz} Hz to {achieved} Hz");
        }
        Ok(achieved)
    }

    fn clock_edge(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        self.tms.set_state(PinState::from(tms)).map_err(JtagError::bus_fault)?;
        self.tdi.set_state(PinState::from(tdi)).map_err(JtagError::bus_fault)?;
        self.delay.delay_ns(self.half_period);

        // Clock high and sample TDO
        self.clock.set_high().map_err(JtagError::bus_fault)?;
        let tdo = self.tdo.is_high().map_err(JtagError::bus_fault)?;

        // Finish the clock cycle
        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(JtagError::bus_fault)?;
        Ok(tdo)
    }
}
