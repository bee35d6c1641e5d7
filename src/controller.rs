//! The command boundary of the engine.
//!
//! A `Controller` owns one cable, the chain description and the tracked TAP state.  Every
//! command takes the controller's lock first.  The lock is a fair mutex, so commands from
//! different threads are admitted in the order they started waiting, and the wait is bounded by
//! `ControllerConfig::command_timeout`.  A command holds the lock for its whole duration, which
//! means transfers issued by two commands never interleave on the cable.
use std::time::Duration;

use bitvec::prelude::*;
use parking_lot::{FairMutex, FairMutexGuard};

use crate::cable::{Cable, Capabilities};
use crate::error::{JtagError, Result};
use crate::scan::{Direction, ScanEngine, ScanRequest};
use crate::statemachine::{JtagState, Register};
use crate::taps::{IdCode, Taps};

/// Width of an IDCODE register.
const IDCODE_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// TCK frequency applied on attach.  `None` keeps whatever the cable runs at.
    pub frequency_hz: Option<u32>,
    /// How long a command waits for the controller before failing with a timeout.
    pub command_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            frequency_hz: None,
            command_timeout: Duration::from_secs(5),
        }
    }
}

struct Session<C> {
    engine: ScanEngine<C>,
    taps: Taps,
    frequency: Option<u32>,
}

pub struct Controller<C: Cable> {
    session: FairMutex<Session<C>>,
    config: ControllerConfig,
}

impl<C: Cable> Controller<C> {
    /// Take over `cable`: enable it if it needs enabling, apply the configured frequency and put
    /// the chain in Test-Logic-Reset.
    pub fn attach(mut cable: C, taps: Taps, config: ControllerConfig) -> Result<Self> {
        if cable.capabilities().contains(Capabilities::ENABLE) {
            cable.enable()?;
        }

        let mut engine = ScanEngine::new(cable);
        let frequency = match bring_up(&mut engine, &config) {
            Ok(frequency) => frequency,
            Err(err) => {
                release(engine.cable_mut());
                return Err(err);
            }
        };
        tracing::debug!("attached to a chain of {} TAPs", taps.len());

        Ok(Self {
            session: FairMutex::new(Session {
                engine,
                taps,
                frequency,
            }),
            config,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn lock(&self) -> Result<FairMutexGuard<'_, Session<C>>> {
        let timeout = self.config.command_timeout;
        self.session.try_lock_for(timeout).ok_or_else(|| {
            tracing::warn!("controller busy for {timeout:?}, giving up");
            JtagError::Timeout(timeout)
        })
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.lock()?.engine.cable().capabilities())
    }

    /// The TCK frequency in effect, as last reported by the cable.
    pub fn frequency(&self) -> Result<u32> {
        self.lock()?
            .frequency
            .ok_or_else(|| JtagError::unsupported("cable has no frequency control"))
    }

    /// Request a TCK frequency and return the one the cable settled on.  On failure the
    /// previous frequency stays in effect.
    pub fn set_frequency(&self, hz: u32) -> Result<u32> {
        let mut session = self.lock()?;
        if !session.engine.cable().capabilities().contains(Capabilities::FREQUENCY) {
            return Err(JtagError::unsupported("cable has no frequency control"));
        }
        let achieved = session.engine.cable_mut().set_frequency(hz)?;
        tracing::debug!("TCK set to {achieved} Hz ({hz} Hz requested)");
        session.frequency = Some(achieved);
        Ok(achieved)
    }

    /// The current TAP state, `None` if it is unknown because an earlier command failed.
    pub fn state(&self) -> Result<Option<JtagState>> {
        let mut session = self.lock()?;
        match session.engine.state() {
            Some(_) if session.engine.cable().capabilities().contains(Capabilities::STATE) => {
                session.engine.cable_mut().state().map(Some)
            }
            state => Ok(state),
        }
    }

    /// Move the TAP to a stable state.  With `force_reset` the move goes through
    /// Test-Logic-Reset, which is also the way out of an unknown state.
    pub fn set_state(&self, target: JtagState, force_reset: bool) -> Result<()> {
        if !target.is_stable() {
            return Err(JtagError::invalid(format!("{target} is not a stable state")));
        }
        let mut session = self.lock()?;
        if force_reset {
            session.engine.reset_to(target)?;
        } else {
            session.engine.goto(target)?;
        }
        tracing::debug!("TAP moved to {target}");
        Ok(())
    }

    pub fn execute_scan(&self, request: &ScanRequest) -> Result<BitVec<u8>> {
        request.validate()?;
        let mut session = self.lock()?;
        session.taps.freeze();
        session.engine.execute(request)
    }

    /// Clock one edge with the given TMS and TDI, returning TDO.
    pub fn raw_edge(&self, tms: bool, tdi: bool) -> Result<bool> {
        self.lock()?.engine.raw_edge(tms, tdi)
    }

    /// Spend `cycles` clocks in Run-Test/Idle.
    pub fn idle(&self, cycles: usize) -> Result<()> {
        self.lock()?.engine.idle(cycles)
    }

    /// Append a TAP to the chain.  Only possible until the first scan.
    pub fn add_tap(&self, ir_len: usize) -> Result<usize> {
        self.lock()?.taps.add_tap(ir_len)
    }

    pub fn add_tap_with_idcode(&self, ir_len: usize, idcode_instruction: &BitSlice<u8>) -> Result<usize> {
        self.lock()?.taps.add_tap_with_idcode(ir_len, idcode_instruction)
    }

    /// A snapshot of the chain description.
    pub fn taps(&self) -> Result<Taps> {
        Ok(self.lock()?.taps.clone())
    }

    /// Load `instruction` into TAP `index` and BYPASS into every other TAP, ending in
    /// Run-Test/Idle.
    pub fn write_ir(&self, index: usize, instruction: &BitSlice<u8>) -> Result<()> {
        let mut session = self.lock()?;
        let Session { engine, taps, .. } = &mut *session;
        write_ir(engine, taps, index, instruction)
    }

    /// Scan TAP `index`'s selected data register, with every other TAP in BYPASS, ending in
    /// Run-Test/Idle.  `data` is shifted in for writing directions and ignored for
    /// `Direction::Read`; `bit_len` is the length of the target's register.  Returns the
    /// target's captured bits for reading directions.
    pub fn scan_dr(
        &self,
        index: usize,
        direction: Direction,
        data: &BitSlice<u8>,
        bit_len: usize,
    ) -> Result<BitVec<u8>> {
        let mut session = self.lock()?;
        let Session { engine, taps, .. } = &mut *session;
        scan_dr(engine, taps, index, direction, data, bit_len)
    }

    /// Read the IDCODE of every TAP whose IDCODE instruction is known and record it in the chain
    /// description.  Returns the IDCODE of each TAP, `None` where there was none to read.
    pub fn discover_idcodes(&self) -> Result<Vec<Option<IdCode>>> {
        let mut session = self.lock()?;
        let Session { engine, taps, .. } = &mut *session;

        for index in 0..taps.len() {
            let tap = taps.tap(index)?;
            if tap.idcode().is_some() {
                continue;
            }
            let Some(instruction) = tap.idcode_instruction().map(|i| i.to_bitvec()) else {
                tracing::debug!("TAP {index} has no IDCODE instruction, skipping");
                continue;
            };

            write_ir(engine, taps, index, &instruction)?;
            let zeros = BitVec::<u8>::repeat(false, IDCODE_LEN);
            let bits = scan_dr(engine, taps, index, Direction::Read, &zeros, IDCODE_LEN)?;
            let idcode = IdCode(bits.load_le::<u32>());

            if idcode.valid() {
                tracing::info!("TAP {index}: IDCODE {idcode}");
            } else {
                tracing::warn!("TAP {index}: invalid IDCODE {idcode}");
            }
            taps.set_idcode(index, idcode)?;
        }

        Ok(taps.iter().map(|tap| tap.idcode()).collect())
    }
}

/// Apply the configured frequency and reset the chain.  Returns the TCK frequency in effect.
fn bring_up<C: Cable>(engine: &mut ScanEngine<C>, config: &ControllerConfig) -> Result<Option<u32>> {
    let cable = engine.cable_mut();
    let frequency = match config.frequency_hz {
        Some(hz) => Some(cable.set_frequency(hz)?),
        None if cable.capabilities().contains(Capabilities::FREQUENCY) => cable.frequency().ok(),
        None => None,
    };
    if let Some(hz) = frequency {
        tracing::debug!("TCK running at {hz} Hz");
    }
    engine.reset()?;
    Ok(frequency)
}

/// Disable the cable if it has an enable line.  Failures are only logged.
fn release<C: Cable>(cable: &mut C) {
    if cable.capabilities().contains(Capabilities::ENABLE) {
        if let Err(err) = cable.disable() {
            tracing::warn!("failed to disable cable: {err}");
        }
    }
}

fn write_ir<C: Cable>(
    engine: &mut ScanEngine<C>,
    taps: &mut Taps,
    index: usize,
    instruction: &BitSlice<u8>,
) -> Result<()> {
    let payload = taps.ir_payload(index, instruction)?;
    taps.freeze();
    engine.execute(&ScanRequest::write(
        Register::Instruction,
        payload,
        JtagState::Idle,
    ))?;
    Ok(())
}

fn scan_dr<C: Cable>(
    engine: &mut ScanEngine<C>,
    taps: &mut Taps,
    index: usize,
    direction: Direction,
    data: &BitSlice<u8>,
    bit_len: usize,
) -> Result<BitVec<u8>> {
    if bit_len == 0 {
        return Err(JtagError::invalid("scan length must be at least 1 bit"));
    }
    let request = if direction.writes() {
        if data.len() != bit_len {
            return Err(JtagError::invalid(format!(
                "scan of {bit_len} bits given {} data bits",
                data.len()
            )));
        }
        let payload = taps.dr_payload(index, data)?;
        ScanRequest {
            direction,
            ..ScanRequest::write(Register::Data, payload, JtagState::Idle)
        }
    } else {
        ScanRequest::read(Register::Data, taps.dr_scan_len(index, bit_len)?, JtagState::Idle)
    };

    taps.freeze();
    let captured = engine.execute(&request)?;
    if direction.reads() {
        taps.dr_extract(index, &captured, bit_len)
    } else {
        Ok(captured)
    }
}

impl<C: Cable> Drop for Controller<C> {
    fn drop(&mut self) {
        release(self.session.get_mut().engine.cable_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimChain, SimTap};
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::rc::Rc;
    use test_case::test_case;

    fn sim() -> SimChain {
        SimChain::new(vec![
            SimTap::new(4).with_idcode(0x4BA0_0477, bits![u8, Lsb0; 0, 1, 1, 1]),
            SimTap::new(5).with_user_register(16),
            SimTap::new(6).with_idcode(0x0692_E093, bits![u8, Lsb0; 1, 0, 0, 1, 0, 0]),
        ])
    }

    fn controller() -> Controller<SimChain> {
        let mut taps = Taps::new();
        taps.add_tap_with_idcode(4, bits![u8, Lsb0; 0, 1, 1, 1]).unwrap();
        taps.add_tap(5).unwrap();
        taps.add_tap_with_idcode(6, bits![u8, Lsb0; 1, 0, 0, 1, 0, 0]).unwrap();
        Controller::attach(sim(), taps, ControllerConfig::default()).unwrap()
    }

    #[test]
    fn attach_enables_and_resets() {
        let controller = controller();
        assert_eq!(controller.state().unwrap(), Some(JtagState::Reset));
        let session = controller.session.lock();
        assert!(session.engine.cable().is_enabled());
        assert_eq!(session.engine.cable().tap_state(), JtagState::Reset);
    }

    #[test]
    fn attach_applies_frequency() {
        let config = ControllerConfig {
            frequency_hz: Some(250_000),
            ..Default::default()
        };
        let controller = Controller::attach(sim(), Taps::new(), config).unwrap();
        assert_eq!(controller.frequency().unwrap(), 250_000);
    }

    #[test]
    fn failed_set_frequency_keeps_previous() {
        let controller = controller();
        assert_eq!(controller.set_frequency(2_000_000).unwrap(), 2_000_000);
        assert_eq!(
            controller.set_frequency(0).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(controller.frequency().unwrap(), 2_000_000);
    }

    #[test]
    fn discovers_idcodes() {
        let controller = controller();
        let idcodes = controller.discover_idcodes().unwrap();
        assert_eq!(
            idcodes,
            vec![Some(IdCode(0x4BA0_0477)), None, Some(IdCode(0x0692_E093))]
        );
        let taps = controller.taps().unwrap();
        assert_eq!(taps.tap(2).unwrap().idcode(), Some(IdCode(0x0692_E093)));
        assert_eq!(controller.state().unwrap(), Some(JtagState::Idle));

        // Already known, nothing is scanned again
        let edges = controller.session.lock().engine.cable().edges();
        controller.discover_idcodes().unwrap();
        assert_eq!(controller.session.lock().engine.cable().edges(), edges);
    }

    #[test]
    fn user_register_round_trip() {
        let controller = controller();
        controller.write_ir(1, bits![u8, Lsb0; 0, 1, 0, 0, 0]).unwrap();

        let value = bitvec![u8, Lsb0; 1, 0, 1, 1, 0, 0, 0, 1, 1, 1, 1, 0, 1, 0, 0, 1];
        let old = controller
            .scan_dr(1, Direction::ReadWrite, &value, 16)
            .unwrap();
        assert_eq!(old, bitvec![u8, Lsb0; 0; 16]);
        assert_eq!(
            controller.session.lock().engine.cable().tap(1).user_register(),
            &value[..]
        );

        let back = controller
            .scan_dr(1, Direction::Read, BitSlice::<u8>::empty(), 16)
            .unwrap();
        assert_eq!(back, value);
        // Reading shifts zeros in, and Update-DR latches them
        assert!(controller
            .session
            .lock()
            .engine
            .cable()
            .tap(1)
            .user_register()
            .not_any());
    }

    #[test]
    fn chain_freezes_on_first_scan() {
        let controller = controller();
        assert_eq!(controller.add_tap(3).unwrap(), 3);
        controller.write_ir(0, bits![u8, Lsb0; 1, 1, 1, 1]).unwrap();
        assert_eq!(
            controller.add_tap(3).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(controller.taps().unwrap().is_frozen());
    }

    #[test_case(JtagState::Reset)]
    #[test_case(JtagState::Idle)]
    #[test_case(JtagState::ShiftDR)]
    #[test_case(JtagState::PauseDR)]
    #[test_case(JtagState::ShiftIR)]
    #[test_case(JtagState::PauseIR)]
    fn set_stable_state(target: JtagState) {
        let controller = controller();
        controller.set_state(target, false).unwrap();
        assert_eq!(controller.state().unwrap(), Some(target));
        assert_eq!(controller.state().unwrap(), Some(target));
        assert_eq!(controller.session.lock().engine.cable().tap_state(), target);
    }

    #[test_case(JtagState::SelectDR)]
    #[test_case(JtagState::CaptureIR)]
    #[test_case(JtagState::Exit1DR)]
    #[test_case(JtagState::UpdateIR)]
    fn transient_states_are_rejected(target: JtagState) {
        let controller = controller();
        assert_eq!(
            controller.set_state(target, false).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(controller.state().unwrap(), Some(JtagState::Reset));
    }

    #[test]
    fn raw_edges_move_the_state() {
        let controller = controller();
        controller.set_state(JtagState::Idle, false).unwrap();
        controller.raw_edge(true, false).unwrap();
        controller.raw_edge(false, false).unwrap();
        assert_eq!(controller.state().unwrap(), Some(JtagState::CaptureDR));
    }

    #[test]
    fn scan_dr_checks_lengths() {
        let controller = controller();
        let data = bitvec![u8, Lsb0; 0; 8];
        assert_eq!(
            controller
                .scan_dr(1, Direction::Write, &data, 16)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            controller
                .scan_dr(4, Direction::Read, &data, 8)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
    }

    /// Reports its enable line through a shared flag, which outlives the controller.
    struct Flagged {
        sim: SimChain,
        enabled: Rc<Cell<bool>>,
        cut: bool,
    }

    impl Cable for Flagged {
        fn transfer(
            &mut self,
            tms: &BitSlice<u8>,
            tdi: &BitSlice<u8>,
            capture: bool,
        ) -> Result<BitVec<u8>> {
            if self.cut {
                return Err(JtagError::BusFault("wire cut".into()));
            }
            self.sim.transfer(tms, tdi, capture)
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::ENABLE
        }

        fn enable(&mut self) -> Result<()> {
            self.enabled.set(true);
            Ok(())
        }

        fn disable(&mut self) -> Result<()> {
            self.enabled.set(false);
            Ok(())
        }
    }

    #[test]
    fn drop_disables_cable() {
        let enabled = Rc::new(Cell::new(false));
        let cable = Flagged {
            sim: sim(),
            enabled: enabled.clone(),
            cut: false,
        };
        let controller = Controller::attach(cable, Taps::new(), ControllerConfig::default()).unwrap();
        assert!(enabled.get());
        assert_eq!(
            controller.frequency().unwrap_err().kind(),
            ErrorKind::Unsupported
        );

        drop(controller);
        assert!(!enabled.get());
    }

    #[test]
    fn failed_attach_disables_cable() {
        let enabled = Rc::new(Cell::new(false));
        let cable = Flagged {
            sim: sim(),
            enabled: enabled.clone(),
            cut: true,
        };
        let err = Controller::attach(cable, Taps::new(), ControllerConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::BusFault);
        assert!(!enabled.get());
    }

    #[test]
    fn rejected_scan_leaves_chain_open() {
        let controller = controller();
        assert_eq!(
            controller
                .execute_scan(&ScanRequest::read(Register::Data, 0, JtagState::Idle))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert!(!controller.taps().unwrap().is_frozen());
        controller.add_tap(3).unwrap();
    }
}
