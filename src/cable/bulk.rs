//! A cable for packetized bulk adapters: the host sends one request packet per transfer and the
//! adapter answers with one response packet.
//!
//! Request:  `[opcode, target, flags, 0, bit_len (u32 LE), payload...]`
//! Response: `[opcode, status, 0, 0, bit_len (u32 LE), payload...]`
//!
//! For `OP_SCAN` the request payload is the packed TMS bits followed by the packed TDI bits and
//! the response payload is the packed TDO bits (only when `FLAG_CAPTURE` was set).  The clock
//! opcodes carry a u32 LE frequency in Hz.  The transport underneath is a `BulkChannel`; USB
//! (rusb) and FTDI FIFO (libftd2xx) channels are available behind the `usb` and `ftdi` features.
use std::time::Duration;

use bitvec::prelude::*;

use crate::cable::{check_lengths, to_bytes, Cable, Capabilities};
use crate::error::{JtagError, Result};

pub const OP_SCAN: u8 = 0x01;
pub const OP_SET_CLOCK: u8 = 0x02;
pub const OP_GET_CLOCK: u8 = 0x03;

pub const FLAG_CAPTURE: u8 = 1;

pub const STATUS_OK: u8 = 0;
pub const STATUS_TIMEOUT: u8 = 1;
pub const STATUS_UNSUPPORTED: u8 = 2;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel timed out")]
    Timeout,
    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    Partial { expected: usize, actual: usize },
    #[error("Channel I/O error: {0}")]
    Io(String),
}

impl ChannelError {
    fn into_jtag(self, timeout: Duration) -> JtagError {
        match self {
            ChannelError::Timeout => JtagError::Timeout(timeout),
            other => JtagError::BusFault(other.to_string()),
        }
    }
}

/// A packet pipe to the adapter.
pub trait BulkChannel {
    /// Send one whole packet.
    fn write_packet(&mut self, data: &[u8], timeout: Duration) -> Result<(), ChannelError>;

    /// Receive one packet into `buf`, returning its length.
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError>;
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Target selector placed in every request, for adapters with several JTAG ports.
    pub target: u8,
    /// Bound on each packet write and read.
    pub timeout: Duration,
    /// Largest packet the adapter accepts.
    pub max_packet_len: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            target: 0,
            timeout: Duration::from_secs(1),
            max_packet_len: 512,
        }
    }
}

pub struct BulkAdapter<Ch> {
    channel: Ch,
    config: BulkConfig,
    frequency: u32,
}

impl<Ch: BulkChannel> BulkAdapter<Ch> {
    /// Wrap `channel` and read the adapter's current TCK frequency.
    pub fn new(channel: Ch, config: BulkConfig) -> Result<Self> {
        if config.max_packet_len < HEADER_LEN + 2 {
            return Err(JtagError::invalid(format!(
                "packet length {} leaves no room for a payload",
                config.max_packet_len
            )));
        }
        let mut bulk = Self {
            channel,
            config,
            frequency: 0,
        };
        let (_, payload) = bulk.request(OP_GET_CLOCK, 0, 0, &[], 4)?;
        bulk.frequency = clock_from(&payload)?;
        Ok(bulk)
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    pub fn into_inner(self) -> Ch {
        self.channel
    }

    /// Send one request and wait for its response.  Returns the response's bit length field and
    /// at most `payload_len` bytes of payload.
    fn request(
        &mut self,
        opcode: u8,
        flags: u8,
        bit_len: u32,
        payload: &[u8],
        payload_len: usize,
    ) -> Result<(u32, Vec<u8>)> {
        let timeout = self.config.timeout;

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&[opcode, self.config.target, flags, 0]);
        packet.extend_from_slice(&bit_len.to_le_bytes());
        packet.extend_from_slice(payload);
        self.channel
            .write_packet(&packet, timeout)
            .map_err(|e| e.into_jtag(timeout))?;

        let mut response = vec![0; HEADER_LEN + payload_len];
        let len = self
            .channel
            .read_packet(&mut response, timeout)
            .map_err(|e| e.into_jtag(timeout))?;
        if len < HEADER_LEN {
            return Err(JtagError::BusFault(format!(
                "response of {len} bytes is shorter than its header"
            )));
        }
        if response[0] != opcode {
            return Err(JtagError::BusFault(format!(
                "response to opcode 0x{opcode:02x} carries opcode 0x{:02x}",
                response[0]
            )));
        }
        match response[1] {
            STATUS_OK => {}
            STATUS_TIMEOUT => return Err(JtagError::Timeout(timeout)),
            STATUS_UNSUPPORTED => {
                return Err(JtagError::unsupported(format!(
                    "adapter rejected opcode 0x{opcode:02x}"
                )))
            }
            status => {
                return Err(JtagError::BusFault(format!("adapter status 0x{status:02x}")))
            }
        }

        let mut word = [0; 4];
        word.copy_from_slice(&response[4..HEADER_LEN]);
        response.truncate(len);
        Ok((u32::from_le_bytes(word), response.split_off(HEADER_LEN)))
    }
}

fn clock_from(payload: &[u8]) -> Result<u32> {
    match payload.get(..4) {
        Some(bytes) => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(JtagError::BusFault(format!(
            "clock response carries {} bytes",
            payload.len()
        ))),
    }
}

impl<Ch: BulkChannel> Cable for BulkAdapter<Ch> {
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
        let max = (self.config.max_packet_len - HEADER_LEN) / 2 * 8;
        if bits > max {
            return Err(JtagError::unsupported(format!(
                "transfer of {bits} bits exceeds the {max}-bit packet payload"
            )));
        }

        let mut payload = to_bytes(tms);
        payload.extend(to_bytes(tdi));
        let bytes = bits.div_ceil(8);
        let flags = if capture { FLAG_CAPTURE } else { 0 };
        tracing::trace!("bulk scan of {bits} bits");
        let (len, tdo) = self.request(OP_SCAN, flags, bits as u32, &payload, bytes)?;

        if len as usize != bits {
            return Err(JtagError::BusFault(format!(
                "adapter clocked {len} bits, {bits} requested"
            )));
        }
        if !capture {
            return Ok(BitVec::new());
        }
        if tdo.len() < bytes {
            return Err(JtagError::BusFault(
                ChannelError::Partial {
                    expected: bytes,
                    actual: tdo.len(),
                }
                .to_string(),
            ));
        }
        let mut out = BitVec::<u8>::from_vec(tdo);
        out.truncate(bits);
        Ok(out)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FREQUENCY
    }

    fn max_transfer_bits(&self) -> Option<usize> {
        Some((self.config.max_packet_len - HEADER_LEN) / 2 * 8)
    }

    fn frequency(&self) -> Result<u32> {
        Ok(self.frequency)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        if hz == 0 {
            return Err(JtagError::unsupported("0 Hz TCK"));
        }
        let (_, payload) = self.request(OP_SET_CLOCK, 0, 0, &hz.to_le_bytes(), 4)?;
        self.frequency = clock_from(&payload)?;
        Ok(self.frequency)
    }
}

#[cfg(feature = "usb")]
pub use self::usb::UsbChannel;

#[cfg(feature = "usb")]
mod usb {
    use super::{BulkChannel, ChannelError};
    use crate::error::{JtagError, Result};

    use std::time::Duration;

    use rusb::constants::*;
    use rusb::{DeviceHandle, Direction, GlobalContext};

    fn channel_error(err: rusb::Error) -> ChannelError {
        match err {
            rusb::Error::Timeout => ChannelError::Timeout,
            other => ChannelError::Io(other.to_string()),
        }
    }

    /// A vendor-specific USB interface with one bulk IN and one bulk OUT endpoint.
    pub struct UsbChannel {
        device: DeviceHandle<GlobalContext>,
        read_endpoint: u8,
        write_endpoint: u8,
    }

    impl UsbChannel {
        pub fn open(vid: u16, pid: u16) -> Result<Self> {
            let mut device = rusb::open_device_with_vid_pid(vid, pid).ok_or_else(|| {
                JtagError::BusFault(format!("no adapter {vid:04x}:{pid:04x} attached"))
            })?;
            let descriptor = device
                .device()
                .active_config_descriptor()
                .map_err(JtagError::bus_fault)?;

            for i in descriptor.interfaces() {
                for d in i.descriptors() {
                    if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC || d.num_endpoints() < 2 {
                        continue;
                    }

                    let mut read_endpoint = None;
                    let mut write_endpoint = None;
                    for e in d.endpoint_descriptors() {
                        match e.direction() {
                            Direction::In => read_endpoint = Some(e.address()),
                            Direction::Out => write_endpoint = Some(e.address()),
                        }
                    }

                    let (Some(read_endpoint), Some(write_endpoint)) =
                        (read_endpoint, write_endpoint)
                    else {
                        continue;
                    };

                    device
                        .claim_interface(d.interface_number())
                        .map_err(JtagError::bus_fault)?;
                    tracing::debug!(
                        "using interface {} of {vid:04x}:{pid:04x}",
                        d.interface_number()
                    );
                    return Ok(Self {
                        device,
                        read_endpoint,
                        write_endpoint,
                    });
                }
            }
            Err(JtagError::BusFault(format!(
                "{vid:04x}:{pid:04x} has no vendor bulk interface"
            )))
        }
    }

    impl BulkChannel for UsbChannel {
        fn write_packet(&mut self, data: &[u8], timeout: Duration) -> Result<(), ChannelError> {
            let written = self
                .device
                .write_bulk(self.write_endpoint, data, timeout)
                .map_err(channel_error)?;
            if written != data.len() {
                return Err(ChannelError::Partial {
                    expected: data.len(),
                    actual: written,
                });
            }
            Ok(())
        }

        fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
            self.device
                .read_bulk(self.read_endpoint, buf, timeout)
                .map_err(channel_error)
        }
    }
}

#[cfg(feature = "ftdi")]
pub use self::ftdi::FtdiChannel;

#[cfg(feature = "ftdi")]
mod ftdi {
    use super::{BulkChannel, ChannelError};
    use crate::error::{JtagError, Result};

    use std::time::Duration;

    use libftd2xx::{Ftdi, FtdiCommon};

    /// An FTDI FIFO interface carrying the packet protocol.
    pub struct FtdiChannel {
        ft: Ftdi,
        timeout: Option<Duration>,
    }

    impl FtdiChannel {
        /// Open the device whose description matches `description`.
        pub fn open(description: &str) -> Result<Self> {
            let ft = Ftdi::with_description(description).map_err(JtagError::bus_fault)?;
            Ok(Self { ft, timeout: None })
        }

        fn apply_timeout(&mut self, timeout: Duration) -> Result<(), ChannelError> {
            if self.timeout != Some(timeout) {
                self.ft
                    .set_timeouts(timeout, timeout)
                    .map_err(|e| ChannelError::Io(format!("{e:?}")))?;
                self.timeout = Some(timeout);
            }
            Ok(())
        }
    }

    impl BulkChannel for FtdiChannel {
        fn write_packet(&mut self, data: &[u8], timeout: Duration) -> Result<(), ChannelError> {
            self.apply_timeout(timeout)?;
            let written = self
                .ft
                .write(data)
                .map_err(|e| ChannelError::Io(format!("{e:?}")))?;
            match written {
                0 if !data.is_empty() => Err(ChannelError::Timeout),
                n if n != data.len() => Err(ChannelError::Partial {
                    expected: data.len(),
                    actual: n,
                }),
                _ => Ok(()),
            }
        }

        fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
            self.apply_timeout(timeout)?;
            // The FIFO has no packet boundaries; the header says how much follows
            let header = super::HEADER_LEN.min(buf.len());
            let got = self
                .ft
                .read(&mut buf[..header])
                .map_err(|e| ChannelError::Io(format!("{e:?}")))?;
            if got == 0 {
                return Err(ChannelError::Timeout);
            }
            if got < header {
                return Ok(got);
            }

            let bits = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            let rest = match buf[0] {
                super::OP_SCAN => bits.div_ceil(8),
                _ => 4,
            }
            .min(buf.len() - header);
            let more = self
                .ft
                .read(&mut buf[header..header + rest])
                .map_err(|e| ChannelError::Io(format!("{e:?}")))?;
            Ok(header + more)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimChain, SimTap};
    use crate::error::ErrorKind;
    use crate::statemachine::{path, JtagState};
    use pretty_assertions::assert_eq;

    /// An adapter model answering requests from a simulated chain.
    struct Loopback {
        sim: SimChain,
        clock: u32,
        response: Vec<u8>,
        truncate: Option<usize>,
        stall: bool,
        status: u8,
        requests: usize,
    }

    impl Loopback {
        fn new(sim: SimChain) -> Self {
            Self {
                sim,
                clock: 4_000_000,
                response: vec![],
                truncate: None,
                stall: false,
                status: STATUS_OK,
                requests: 0,
            }
        }
    }

    impl BulkChannel for Loopback {
        fn write_packet(&mut self, data: &[u8], _timeout: Duration) -> Result<(), ChannelError> {
            self.requests += 1;
            let bits = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
            let payload = &data[HEADER_LEN..];
            let mut out = match data[0] {
                OP_SCAN => {
                    let bytes = bits.div_ceil(8);
                    let tms = &payload[..bytes].view_bits::<Lsb0>()[..bits];
                    let tdi = &payload[bytes..].view_bits::<Lsb0>()[..bits];
                    let tdo = self.sim.transfer(tms, tdi, true).unwrap();
                    if data[2] & FLAG_CAPTURE != 0 {
                        to_bytes(&tdo)
                    } else {
                        vec![]
                    }
                }
                OP_SET_CLOCK => {
                    let hz = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    // The adapter divides a 48 MHz clock by an even number
                    self.clock = 24_000_000 / 24_000_000u32.div_ceil(hz);
                    self.clock.to_le_bytes().to_vec()
                }
                _ => self.clock.to_le_bytes().to_vec(),
            };
            let mut response = vec![data[0], self.status, 0, 0];
            response.extend_from_slice(&(bits as u32).to_le_bytes());
            response.append(&mut out);
            if let Some(len) = self.truncate {
                response.truncate(len);
            }
            self.response = response;
            Ok(())
        }

        fn read_packet(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ChannelError> {
            if self.stall {
                return Err(ChannelError::Timeout);
            }
            let len = self.response.len().min(buf.len());
            buf[..len].copy_from_slice(&self.response[..len]);
            Ok(len)
        }
    }

    fn adapter() -> BulkAdapter<Loopback> {
        let sim = SimChain::new(vec![
            SimTap::new(5).with_idcode(0x0BA0_0477, bits![u8, Lsb0; 0, 1, 1, 1, 1])
        ]);
        BulkAdapter::new(Loopback::new(sim), BulkConfig::default()).unwrap()
    }

    #[test]
    fn reads_clock_on_open() {
        let bulk = adapter();
        assert_eq!(bulk.frequency().unwrap(), 4_000_000);
    }

    #[test]
    fn scan_round_trips_through_packets() {
        let mut bulk = adapter();
        let nav: BitVec<u8> = path(JtagState::Reset, JtagState::ShiftDR).into_iter().collect();
        bulk.transfer(&nav, &BitVec::<u8>::repeat(false, nav.len()), false)
            .unwrap();

        let mut tms = BitVec::<u8>::repeat(false, 32);
        tms.set(31, true);
        let out = bulk.transfer(&tms, &BitVec::<u8>::repeat(true, 32), true).unwrap();
        assert_eq!(out.load_le::<u32>(), 0x0BA0_0477);

        let loopback = bulk.into_inner();
        assert_eq!(loopback.sim.tap_state(), JtagState::Exit1DR);
    }

    #[test]
    fn set_frequency_reports_adapter_rate() {
        let mut bulk = adapter();
        assert_eq!(bulk.set_frequency(5_000_000).unwrap(), 4_800_000);
        assert_eq!(bulk.frequency().unwrap(), 4_800_000);
        assert_eq!(bulk.set_frequency(0).unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn oversize_transfer_is_unsupported() {
        let mut bulk = adapter();
        assert_eq!(bulk.max_transfer_bits(), Some(2016));
        let bits = BitVec::<u8>::repeat(false, 2017);
        let err = bulk.transfer(&bits, &bits, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(bulk.into_inner().requests, 1);
    }

    #[test]
    fn short_response_is_a_bus_fault() {
        let mut bulk = adapter();
        bulk.channel.truncate = Some(HEADER_LEN + 1);
        let bits = BitVec::<u8>::repeat(false, 16);
        let err = bulk.transfer(&bits, &bits, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusFault);

        bulk.channel.truncate = Some(3);
        let err = bulk.transfer(&bits, &bits, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusFault);
    }

    #[test]
    fn stalled_channel_times_out() {
        let mut bulk = adapter();
        bulk.channel.stall = true;
        let bits = BitVec::<u8>::repeat(false, 8);
        assert_eq!(
            bulk.transfer(&bits, &bits, true).unwrap_err(),
            JtagError::Timeout(Duration::from_secs(1))
        );
    }

    #[test]
    fn adapter_status_maps_to_error_kind() {
        let mut bulk = adapter();
        let bits = BitVec::<u8>::repeat(false, 8);
        for (status, kind) in [
            (STATUS_TIMEOUT, ErrorKind::Timeout),
            (STATUS_UNSUPPORTED, ErrorKind::Unsupported),
            (0x7f, ErrorKind::BusFault),
        ] {
            bulk.channel.status = status;
            assert_eq!(bulk.transfer(&bits, &bits, false).unwrap_err().kind(), kind);
        }
    }
}
