//! This crate drives a JTAG test chain through a serial TAP interface at a few levels of
//! abstraction.  At the lowest level is a cable, anything implementing the `Cable` trait: an
//! accelerated engine that offloads whole transfers to a register block, a bit-banged cable on
//! embedded-hal pins, or a packetized bulk adapter over USB or an FTDI FIFO.  A cable clocks runs
//! of edges with explicit TMS and TDI values and reports which optional capabilities it has.
//!
//! The `statemachine` module knows the 16-state TAP controller graph and finds the shortest TMS
//! path between any two states.  The `ScanEngine` builds on it: it tracks the state of the chain
//! and turns a scan request (register, direction, length, end state) into the prefix, shift and
//! suffix edges, splitting them to fit the cable.
//!
//! If there are multiple TAPs in the chain, describe them with `Taps`.  It pads instruction scans
//! with BYPASS for every other TAP and places data for one TAP between the bypass bits of the
//! others.  `Controller` puts all of this behind a lock with a bounded wait, so that one command
//! runs at a time even when several threads share the chain.
//!
//! # Example
//! ```
//! use bitvec::prelude::*;
//! use jtag_engine::cable::sim::{SimChain, SimTap};
//! use jtag_engine::controller::{Controller, ControllerConfig};
//! use jtag_engine::taps::Taps;
//!
//! let idcode_ir = bits![u8, Lsb0; 0, 1, 1, 1];
//! let cable = SimChain::new(vec![SimTap::new(4).with_idcode(0x4BA00477, idcode_ir)]);
//! let mut taps = Taps::new();
//! taps.add_tap_with_idcode(4, idcode_ir).unwrap();
//!
//! let controller = Controller::attach(cable, taps, ControllerConfig::default()).unwrap();
//! let idcodes = controller.discover_idcodes().unwrap();
//! assert_eq!(idcodes[0].map(|id| id.value()), Some(0x4BA00477));
//! ```

pub mod cable;
pub mod controller;
pub mod error;
pub mod scan;
pub mod statemachine;
pub mod taps;

pub use cable::{Cable, Capabilities};
pub use controller::{Controller, ControllerConfig};
pub use error::{ErrorKind, JtagError, Result};
pub use scan::{Direction, ScanEngine, ScanRequest};
pub use statemachine::{path, JtagState, Register};
pub use taps::{IdCode, TapDevice, Taps};
