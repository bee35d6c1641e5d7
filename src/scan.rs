//! Turns a scan request into TMS/TDI edge sequences on a cable.
//!
//! A scan is three pieces driven back to back: a prefix that navigates to the shift state of the
//! selected register (starting with a reset when the TAP state is not known), the shift itself
//! with TMS high on the last bit only, and a suffix from Exit1 to the requested end state.  The
//! engine tracks the TAP state across scans; any failure leaves it unknown so that the next
//! operation starts from a reset.
use bitvec::prelude::*;

use crate::cable::{Cable, Capabilities};
use crate::error::{JtagError, Result};
use crate::statemachine::{path, JtagState, Register, RESET_SEQUENCE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Write,
    Read,
    ReadWrite,
}

impl Direction {
    pub fn reads(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub register: Register,
    pub direction: Direction,
    pub bit_len: usize,
    pub end_state: JtagState,
    /// Bits to shift in, first bit first.  Ignored (and may be empty) for `Direction::Read`.
    pub input: BitVec<u8>,
}

impl ScanRequest {
    pub fn write(register: Register, input: BitVec<u8>, end_state: JtagState) -> Self {
        Self {
            register,
            direction: Direction::Write,
            bit_len: input.len(),
            end_state,
            input,
        }
    }

    /// Read `bit_len` bits, shifting zeros in.
    pub fn read(register: Register, bit_len: usize, end_state: JtagState) -> Self {
        Self {
            register,
            direction: Direction::Read,
            bit_len,
            end_state,
            input: BitVec::new(),
        }
    }

    pub fn read_write(register: Register, input: BitVec<u8>, end_state: JtagState) -> Self {
        Self {
            direction: Direction::ReadWrite,
            ..Self::write(register, input, end_state)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bit_len == 0 {
            return Err(JtagError::invalid("scan length must be at least 1 bit"));
        }
        if self.direction.writes() && self.input.len() != self.bit_len {
            return Err(JtagError::invalid(format!(
                "scan of {} bits given {} input bits",
                self.bit_len,
                self.input.len()
            )));
        }
        if !self.end_state.is_scan_end_for(self.register) {
            return Err(JtagError::invalid(format!(
                "{} is not a valid end state for a {:?} register scan",
                self.end_state, self.register
            )));
        }
        Ok(())
    }
}

pub struct ScanEngine<C> {
    cable: C,
    state: JtagState,
    known: bool,
}

impl<C: Cable> ScanEngine<C> {
    /// Wrap `cable`.  Nothing is known about the TAP state until the first reset.
    pub fn new(cable: C) -> Self {
        Self {
            cable,
            state: JtagState::Reset,
            known: false,
        }
    }

    pub fn cable(&self) -> &C {
        &self.cable
    }

    pub fn cable_mut(&mut self) -> &mut C {
        &mut self.cable
    }

    pub fn into_inner(self) -> C {
        self.cable
    }

    /// The tracked TAP state, `None` when it is unknown.
    pub fn state(&self) -> Option<JtagState> {
        self.known.then_some(self.state)
    }

    /// Forget the tracked state; the next operation starts with a reset.
    pub fn invalidate(&mut self) {
        self.known = false;
    }

    fn settle<T>(&mut self, result: Result<T>, state: JtagState) -> Result<T> {
        match result {
            Ok(value) => {
                self.state = state;
                self.known = true;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!("TAP state unknown after failure: {err}");
                self.known = false;
                Err(err)
            }
        }
    }

    /// TMS edges from the current state to `to`, with a leading reset if the state is unknown.
    fn prefix(&self, to: JtagState, force_reset: bool) -> Vec<bool> {
        if self.known && !force_reset {
            path(self.state, to)
        } else {
            let mut tms = RESET_SEQUENCE.to_vec();
            tms.extend(path(JtagState::Reset, to));
            tms
        }
    }

    /// Clock `tms`/`tdi` through the cable, split into pieces no longer than it accepts.
    fn drive(&mut self, tms: &BitSlice<u8>, tdi: &BitSlice<u8>, capture: bool) -> Result<BitVec<u8>> {
        let chunk = self.cable.max_transfer_bits().unwrap_or(usize::MAX).max(1);
        let mut out = BitVec::with_capacity(if capture { tms.len() } else { 0 });

        let mut start = 0;
        while start < tms.len() {
            let end = tms.len().min(start.saturating_add(chunk));
            tracing::trace!("transfer of edges {start}..{end}");
            let tdo = self.cable.transfer(&tms[start..end], &tdi[start..end], capture)?;
            if capture && tdo.len() != end - start {
                return Err(JtagError::BusFault(format!(
                    "cable returned {} bits for a {}-bit transfer",
                    tdo.len(),
                    end - start
                )));
            }
            out.extend_from_bitslice(&tdo);
            start = end;
        }
        Ok(out)
    }

    fn drive_tms(&mut self, tms: &[bool]) -> Result<()> {
        if tms.is_empty() {
            return Ok(());
        }
        tracing::trace!("TMS path {tms:?}");
        let tms: BitVec<u8> = tms.iter().copied().collect();
        self.drive(&tms, &BitVec::<u8>::repeat(false, tms.len()), false)?;
        Ok(())
    }

    fn navigate(&mut self, to: JtagState, force_reset: bool) -> Result<()> {
        let result = if self.cable.capabilities().contains(Capabilities::STATE) {
            let reset = force_reset || !self.known;
            self.cable.set_state(to, reset)
        } else {
            let tms = self.prefix(to, force_reset);
            self.drive_tms(&tms)
        };
        self.settle(result, to)
    }

    /// Move the TAP to `to` along the shortest path.
    pub fn goto(&mut self, to: JtagState) -> Result<()> {
        self.navigate(to, false)
    }

    /// Move the TAP to `to` by way of Test-Logic-Reset.
    pub fn reset_to(&mut self, to: JtagState) -> Result<()> {
        self.navigate(to, true)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.navigate(JtagState::Reset, true)
    }

    /// Go to Run-Test/Idle and stay there for `cycles` clocks.
    pub fn idle(&mut self, cycles: usize) -> Result<()> {
        self.goto(JtagState::Idle)?;
        let result = self.drive_tms(&vec![false; cycles]);
        self.settle(result, JtagState::Idle)
    }

    /// Clock one edge directly.  The tracked state follows TMS.
    pub fn raw_edge(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        match self.cable.clock_edge(tms, tdi) {
            Ok(tdo) => {
                self.state = self.state.next(tms);
                Ok(tdo)
            }
            // Nothing was clocked
            Err(err @ JtagError::Unsupported(_)) => Err(err),
            Err(err) => {
                self.known = false;
                Err(err)
            }
        }
    }

    /// Run one scan.  Returns the captured bits for reading directions, an empty vector
    /// otherwise.
    pub fn execute(&mut self, request: &ScanRequest) -> Result<BitVec<u8>> {
        request.validate()?;
        let shift = JtagState::shift_state(request.register);
        let exit1 = JtagState::exit1_state(request.register);
        tracing::debug!(
            "{:?} {:?} scan of {} bits, ending in {}",
            request.register,
            request.direction,
            request.bit_len,
            request.end_state
        );

        let prefix = if self.cable.capabilities().contains(Capabilities::STATE) {
            // The cable navigates on its own
            self.navigate(shift, false)?;
            Vec::new()
        } else {
            self.prefix(shift, false)
        };
        let suffix = path(exit1, request.end_state);

        let mut tms = BitVec::<u8>::with_capacity(prefix.len() + request.bit_len + suffix.len());
        let mut tdi = BitVec::<u8>::with_capacity(tms.capacity());
        tms.extend(prefix.iter().copied());
        tdi.resize(prefix.len(), false);
        for i in 0..request.bit_len {
            let is_last = i == request.bit_len - 1;
            tms.push(is_last);
            tdi.push(request.direction.writes() && request.input[i]);
        }
        tms.extend(suffix.iter().copied());
        tdi.resize(tms.len(), false);

        let capture = request.direction.reads();
        let result = self.drive(&tms, &tdi, capture).map(|tdo| {
            if capture {
                tdo[prefix.len()..prefix.len() + request.bit_len].to_bitvec()
            } else {
                tdo
            }
        });
        self.settle(result, request.end_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::accel::{tests::FakeEngine, Accelerator, AcceleratorConfig};
    use crate::cable::sim::{SimChain, SimTap};
    use crate::error::ErrorKind;
    use crate::taps::Taps;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    /// Wraps a simulated chain and records every transfer.
    struct Recorder {
        sim: SimChain,
        tms: BitVec<u8>,
        chunks: Vec<usize>,
        max: Option<usize>,
        fail: bool,
    }

    impl Recorder {
        fn new(sim: SimChain) -> Self {
            Self {
                sim,
                tms: BitVec::new(),
                chunks: vec![],
                max: None,
                fail: false,
            }
        }
    }

    impl Cable for Recorder {
        fn transfer(
            &mut self,
            tms: &BitSlice<u8>,
            tdi: &BitSlice<u8>,
            capture: bool,
        ) -> Result<BitVec<u8>> {
            if self.fail {
                return Err(JtagError::BusFault("cable unplugged".into()));
            }
            self.tms.extend_from_bitslice(tms);
            self.chunks.push(tms.len());
            self.sim.transfer(tms, tdi, capture)
        }

        fn max_transfer_bits(&self) -> Option<usize> {
            self.max
        }

        fn clock_edge(&mut self, tms: bool, tdi: bool) -> Result<bool> {
            self.sim.clock_edge(tms, tdi)
        }
    }

    fn chain() -> SimChain {
        SimChain::new(vec![
            SimTap::new(4).with_idcode(0xABCD_1235, bits![u8, Lsb0; 0, 1, 1, 1]),
            SimTap::new(6).with_user_register(12),
        ])
    }

    #[test]
    fn first_scan_resets() {
        let mut engine = ScanEngine::new(Recorder::new(chain()));
        assert_eq!(engine.state(), None);

        let request = ScanRequest::read(Register::Data, 33, JtagState::Idle);
        let out = engine.execute(&request).unwrap();

        assert_eq!(out[..32].load_le::<u32>(), 0xABCD_1235);
        assert!(engine.cable().tms[..5].all());
        assert_eq!(engine.state(), Some(JtagState::Idle));
        assert_eq!(engine.cable().sim.tap_state(), JtagState::Idle);
    }

    #[test]
    fn single_bit_shift_leaves_on_its_only_edge() {
        let mut engine = ScanEngine::new(Recorder::new(SimChain::new(vec![SimTap::new(3)])));
        engine.goto(JtagState::Idle).unwrap();
        engine.cable_mut().tms.clear();

        let request = ScanRequest::write(Register::Data, bitvec![u8, Lsb0; 1], JtagState::Exit1DR);
        engine.execute(&request).unwrap();

        // Idle -> SelectDR -> CaptureDR -> ShiftDR, then the single shift edge
        assert_eq!(engine.cable().tms, bits![u8, Lsb0; 1, 0, 0, 1]);
        assert_eq!(engine.cable().sim.tap_state(), JtagState::Exit1DR);
    }

    #[test]
    fn fragmented_scan_matches_unfragmented() {
        let input: BitVec<u8> = (0..22).map(|i| i % 3 == 0).collect();
        let request = ScanRequest::read_write(Register::Data, input, JtagState::PauseDR);

        let mut whole = ScanEngine::new(Recorder::new(chain()));
        let mut pieces = ScanEngine::new(Recorder::new(chain()));
        pieces.cable_mut().max = Some(3);
        for engine in [&mut whole, &mut pieces] {
            engine.reset().unwrap();
            let ir = Taps::from_ir_lengths(&[4, 6])
                .unwrap()
                .ir_payload(1, bits![u8, Lsb0; 0, 0, 0, 1, 0, 0])
                .unwrap();
            engine
                .execute(&ScanRequest::write(Register::Instruction, ir, JtagState::Idle))
                .unwrap();
        }

        let a = whole.execute(&request).unwrap();
        let b = pieces.execute(&request).unwrap();
        assert_eq!(a, b);
        assert_eq!(whole.cable().tms, pieces.cable().tms);
        assert!(pieces.cable().chunks.iter().all(|&len| len <= 3));
        assert_eq!(pieces.cable().sim.tap_state(), JtagState::PauseDR);
    }

    #[test_case(ScanRequest::read(Register::Data, 0, JtagState::Idle); "zero length")]
    #[test_case(ScanRequest { bit_len: 4, ..ScanRequest::write(Register::Data, bitvec![u8, Lsb0; 1; 3], JtagState::Idle) }; "input mismatch")]
    #[test_case(ScanRequest::read(Register::Data, 8, JtagState::ShiftDR); "shift end state")]
    #[test_case(ScanRequest::read(Register::Data, 8, JtagState::PauseIR); "other register")]
    #[test_case(ScanRequest::read(Register::Instruction, 8, JtagState::SelectDR); "select")]
    fn invalid_requests_are_rejected(request: ScanRequest) {
        let mut engine = ScanEngine::new(Recorder::new(chain()));
        assert_eq!(
            engine.execute(&request).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(engine.cable().chunks.len(), 0);
    }

    #[test_case(JtagState::Exit1DR)]
    #[test_case(JtagState::PauseDR)]
    #[test_case(JtagState::Exit2DR)]
    #[test_case(JtagState::UpdateDR)]
    #[test_case(JtagState::Idle)]
    #[test_case(JtagState::Reset)]
    fn scan_ends_where_requested(end: JtagState) {
        let mut engine = ScanEngine::new(Recorder::new(chain()));
        engine
            .execute(&ScanRequest::read(Register::Data, 40, end))
            .unwrap();
        assert_eq!(engine.state(), Some(end));
        assert_eq!(engine.cable().sim.tap_state(), end);
    }

    #[test]
    fn failure_forgets_state() {
        let mut engine = ScanEngine::new(Recorder::new(chain()));
        engine.goto(JtagState::PauseDR).unwrap();
        assert_eq!(engine.state(), Some(JtagState::PauseDR));

        engine.cable_mut().fail = true;
        let err = engine
            .execute(&ScanRequest::read(Register::Data, 8, JtagState::Idle))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusFault);
        assert_eq!(engine.state(), None);

        engine.cable_mut().fail = false;
        engine.cable_mut().tms.clear();
        engine.goto(JtagState::Idle).unwrap();
        assert_eq!(engine.cable().tms, bits![u8, Lsb0; 1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn idle_clocks_in_run_test_idle() {
        let mut engine = ScanEngine::new(Recorder::new(chain()));
        engine.reset().unwrap();
        let before = engine.cable().sim.edges();
        engine.idle(10).unwrap();
        assert_eq!(engine.cable().sim.edges() - before, 11);
        assert_eq!(engine.state(), Some(JtagState::Idle));
    }

    #[test]
    fn raw_edges_are_tracked() {
        let mut engine = ScanEngine::new(Recorder::new(chain()));
        engine.reset().unwrap();
        engine.raw_edge(false, false).unwrap();
        engine.raw_edge(true, false).unwrap();
        assert_eq!(engine.state(), Some(JtagState::SelectDR));
        assert_eq!(engine.cable().sim.tap_state(), JtagState::SelectDR);
    }

    #[test]
    fn native_navigation_is_used_when_offered() {
        let fake = FakeEngine::new(chain());
        let mut engine = ScanEngine::new(Accelerator::new(fake, AcceleratorConfig::default()));

        engine.goto(JtagState::PauseIR).unwrap();
        assert_eq!(engine.cable_mut().state().unwrap(), JtagState::PauseIR);

        let out = engine
            .execute(&ScanRequest::read(Register::Instruction, 10, JtagState::Idle))
            .unwrap();
        assert_eq!(out, bits![u8, Lsb0; 1, 0, 0, 0, 1, 0, 0, 0, 0, 0]);
        assert_eq!(engine.cable_mut().state().unwrap(), JtagState::Idle);
    }
}
