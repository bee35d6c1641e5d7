//! Attach to a simulated two-TAP chain, read the IDCODEs and exercise a user data register.
use bitvec::prelude::*;
use jtag_engine::cable::sim::{SimChain, SimTap};
use jtag_engine::{Controller, ControllerConfig, Direction, JtagError, Taps};

fn main() -> Result<(), JtagError> {
    let idcode_ir = bits![u8, Lsb0; 0, 1, 1, 1];
    let user_ir = bits![u8, Lsb0; 0, 1, 0, 0, 0];

    let cable = SimChain::new(vec![
        SimTap::new(4).with_idcode(0x4BA0_0477, idcode_ir),
        SimTap::new(5).with_user_register(16),
    ]);

    let mut taps = Taps::new();
    taps.add_tap_with_idcode(4, idcode_ir)?;
    taps.add_tap(5)?;

    let config = ControllerConfig {
        frequency_hz: Some(1_000_000),
        ..Default::default()
    };
    let controller = Controller::attach(cable, taps, config)?;
    println!("TCK: {} Hz", controller.frequency()?);

    for (index, idcode) in controller.discover_idcodes()?.iter().enumerate() {
        match idcode {
            Some(idcode) => println!("TAP {index}: {idcode}"),
            None => println!("TAP {index}: no IDCODE"),
        }
    }

    controller.write_ir(1, user_ir)?;
    let mut value = BitVec::<u8>::repeat(false, 16);
    value.store_le(0xC0DEu16);
    controller.scan_dr(1, Direction::Write, &value, 16)?;

    let back = controller.scan_dr(1, Direction::Read, BitSlice::<u8>::empty(), 16)?;
    println!("user register: 0x{:04X}", back.load_le::<u16>());
    println!("state: {:?}", controller.state()?);

    Ok(())
}
