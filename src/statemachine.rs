//! The TAP controller state machine.  Every state has exactly two outgoing edges, selected by the
//! value of TMS on a rising TCK edge.  `path` finds the shortest TMS sequence between two states,
//! which is what everything above this module uses to navigate the chain.
use std::collections::VecDeque;
use std::fmt;

/// Clocking TMS high five times reaches `Reset` from any state.
pub const RESET_SEQUENCE: [bool; 5] = [true; 5];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Register {
    Data,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use JtagState::*;

/// `EDGES[state] = [next with TMS=0, next with TMS=1]`
const EDGES: [[JtagState; 2]; 16] = [
    [Idle, Reset],          // Reset
    [Idle, SelectDR],       // Idle
    [CaptureDR, SelectIR],  // SelectDR
    [ShiftDR, Exit1DR],     // CaptureDR
    [ShiftDR, Exit1DR],     // ShiftDR
    [PauseDR, UpdateDR],    // Exit1DR
    [PauseDR, Exit2DR],     // PauseDR
    [ShiftDR, UpdateDR],    // Exit2DR
    [Idle, SelectDR],       // UpdateDR
    [CaptureIR, Reset],     // SelectIR
    [ShiftIR, Exit1IR],     // CaptureIR
    [ShiftIR, Exit1IR],     // ShiftIR
    [PauseIR, UpdateIR],    // Exit1IR
    [PauseIR, Exit2IR],     // PauseIR
    [ShiftIR, UpdateIR],    // Exit2IR
    [Idle, SelectDR],       // UpdateIR
];

impl JtagState {
    pub const ALL: [JtagState; 16] = [
        Reset, Idle, SelectDR, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR, SelectIR,
        CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
    ];

    /// The state reached after one TCK edge with the given TMS value.
    pub fn next(self, tms: bool) -> JtagState {
        EDGES[self as usize][tms as usize]
    }

    /// Follow a whole TMS sequence from `self`.
    pub fn walk(self, tms: impl IntoIterator<Item = bool>) -> JtagState {
        tms.into_iter().fold(self, JtagState::next)
    }

    /// Which register path the state belongs to, `None` for `Reset` and `Idle`.
    pub fn register(self) -> Option<Register> {
        match self {
            Reset | Idle => None,
            SelectDR | CaptureDR | ShiftDR | Exit1DR | PauseDR | Exit2DR | UpdateDR => {
                Some(Register::Data)
            }
            _ => Some(Register::Instruction),
        }
    }

    pub fn is_shift(self) -> bool {
        matches!(self, ShiftDR | ShiftIR)
    }

    /// States the TAP can be parked in without the chain changing underneath it.
    pub fn is_stable(self) -> bool {
        matches!(self, Reset | Idle | ShiftDR | PauseDR | ShiftIR | PauseIR)
    }

    pub fn shift_state(reg: Register) -> JtagState {
        match reg {
            Register::Data => ShiftDR,
            Register::Instruction => ShiftIR,
        }
    }

    pub fn exit1_state(reg: Register) -> JtagState {
        match reg {
            Register::Data => Exit1DR,
            Register::Instruction => Exit1IR,
        }
    }

    /// Whether a scan of `reg` may finish in `self`.  After the last shifted bit the TAP sits in
    /// Exit1; from there a scan may stay on its own exit path or fall through to Idle or Reset.
    pub fn is_scan_end_for(self, reg: Register) -> bool {
        match (self, reg) {
            (Idle | Reset, _) => true,
            (Exit1DR | PauseDR | Exit2DR | UpdateDR, Register::Data) => true,
            (Exit1IR | PauseIR | Exit2IR | UpdateIR, Register::Instruction) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JtagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shortest TMS sequence taking the TAP from `from` to `to`.
///
/// Breadth-first over the graph, trying TMS=0 before TMS=1, so the result is deterministic.
/// `path(s, s)` is empty.
pub fn path(from: JtagState, to: JtagState) -> Vec<bool> {
    let mut came_from: [Option<(JtagState, bool)>; 16] = [None; 16];
    let mut visited = [false; 16];
    let mut queue = VecDeque::from([from]);
    visited[from as usize] = true;

    while let Some(state) = queue.pop_front() {
        if state == to {
            break;
        }
        for tms in [false, true] {
            let next = state.next(tms);
            if !visited[next as usize] {
                visited[next as usize] = true;
                came_from[next as usize] = Some((state, tms));
                queue.push_back(next);
            }
        }
    }

    // Every state is reachable from every other, so the walk back always ends at `from`
    let mut tms = Vec::new();
    let mut state = to;
    while let Some((prev, bit)) = came_from[state as usize] {
        tms.push(bit);
        state = prev;
    }
    tms.reverse();
    tms
}
