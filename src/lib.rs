//! Q.921 (LAPD) and LAPB data link layer.
//!
//! The protocol core is sans-IO: [`state::Link`] and [`interface::Interface`]
//! take events (received frames, client requests, timer polls) together with
//! the current time, and return [`state::ReturnEvent`]s for the caller to act
//! on. [`Client`] and [`r#async::Client`] are drivers that wire the core to a
//! physical layer.
use std::io::{Read, Write};

use anyhow::{Error, Result};
use log::debug;

pub mod r#async;
pub mod client;
pub mod config;
pub mod fsm;
mod hdlc;
pub mod interface;
pub mod pcap;
pub mod state;
pub mod tei;
mod window;

pub use client::Client;
pub use config::{Config, PollFailure, Role, Variant};
pub use interface::{Interface, LinkId};
pub use state::{Dl, Link, MdlError, ReturnEvent};
pub use window::Info;

/// TEI used for broadcast, and for "any TEI" in identity requests.
pub const GROUP_TEI: u8 = 127;

/// SAPI of the layer 2 management entity (TEI assignment).
pub const TEI_SAPI: u8 = 63;

/// Address and control field layout of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// One octet LAPB address instead of the two octet SAPI/TEI address.
    pub lapb: bool,
    /// Modulo 128: two octet control field for I and S frames.
    pub ext: bool,
}

impl Format {
    pub const LAPD: Format = Format {
        lapb: false,
        ext: true,
    };

    #[must_use]
    pub fn addr_len(&self) -> usize {
        if self.lapb {
            1
        } else {
            2
        }
    }

    #[must_use]
    pub fn modulus(&self) -> u8 {
        if self.ext {
            128
        } else {
            8
        }
    }

    /// Address plus control field length for I and S frames.
    #[must_use]
    pub fn numbered_header_len(&self) -> usize {
        self.addr_len() + if self.ext { 2 } else { 1 }
    }
}

/// LAPD address. LAPB frames parse to SAPI 0, TEI 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    pub sapi: u8,
    pub tei: u8,
}

pub const LAPB_ADDR_A: u8 = 0x03;
pub const LAPB_ADDR_B: u8 = 0x01;

impl Addr {
    pub fn new(sapi: u8, tei: u8) -> Result<Self> {
        if sapi > 63 {
            return Err(Error::msg(format!("invalid SAPI {sapi}")));
        }
        if tei > GROUP_TEI {
            return Err(Error::msg(format!("invalid TEI {tei}")));
        }
        Ok(Self { sapi, tei })
    }

    #[must_use]
    pub fn serialize(&self, cr: bool) -> [u8; 2] {
        [
            (self.sapi << 2) | if cr { 0b10 } else { 0 },
            (self.tei << 1) | 1,
        ]
    }

    /// Parse a two octet LAPD address, returning the address and the C/R bit.
    pub fn parse(bytes: &[u8]) -> Result<(Self, bool)> {
        if bytes.len() < 2 {
            return Err(Error::msg("address field too short"));
        }
        if bytes[0] & 1 != 0 || bytes[1] & 1 == 0 {
            return Err(Error::msg(format!(
                "wrong EA bits in address {:02x} {:02x}",
                bytes[0], bytes[1]
            )));
        }
        Ok((
            Self {
                sapi: bytes[0] >> 2,
                tei: bytes[1] >> 1,
            },
            bytes[0] & 0b10 != 0,
        ))
    }
}

/// A frame that was understood at the address level, but is not a frame
/// this data link accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub code: MdlError,
    pub reason: String,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame error {}: {}", self.code, self.reason)
    }
}

impl std::error::Error for FrameError {}

fn frame_error(code: MdlError, reason: String) -> Error {
    FrameError { code, reason }.into()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub addr: Addr,
    /// C/R bit as seen on the wire. For LAPB, set means address A.
    pub cr: bool,
    pub packet_type: PacketType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketType {
    Sabm(Sabm),
    Sabme(Sabme),
    Ua(Ua),
    Dm(Dm),
    Disc(Disc),
    Frmr(Frmr),
    Ui(Ui),
    Iframe(Iframe),
    Rr(Rr),
    Rnr(Rnr),
    Rej(Rej),
}

// Unnumbered frames. Ending in 11.
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABM: u8 = 0b001_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABME: u8 = 0b011_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_UI: u8 = 0b000_0_00_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_DISC: u8 = 0b010_0_00_11;
pub const CONTROL_DM: u8 = 0b0000_1111;
pub const CONTROL_UA: u8 = 0b0110_0011;
pub const CONTROL_FRMR: u8 = 0b1000_0111;

// Supervisory frames. Ending in 01.
pub const CONTROL_RR: u8 = 0b0000_0001;
pub const CONTROL_RNR: u8 = 0b0000_0101;
pub const CONTROL_REJ: u8 = 0b0000_1001;

// Masks.
pub const CONTROL_POLL: u8 = 0b0001_0000;
pub const NR_MASK: u8 = 0b1110_0000;
pub const TYPE_MASK: u8 = 0b0000_0011;

#[derive(Clone, Debug, PartialEq)]
pub struct Sabm {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sabme {
    pub poll: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Ua {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dm {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Disc {
    pub poll: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Frmr {
    pub poll: bool,
    pub info: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ui {
    pub poll: bool,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Iframe {
    pub ns: u8,
    pub nr: u8,
    pub poll: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Rr {
    pub nr: u8,
    pub poll: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Rnr {
    pub nr: u8,
    pub poll: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Rej {
    pub nr: u8,
    pub poll: bool,
}

fn poll_bit(poll: bool) -> u8 {
    if poll {
        CONTROL_POLL
    } else {
        0
    }
}

impl Packet {
    #[must_use]
    pub fn serialize(&self, fmt: Format) -> Vec<u8> {
        let mut ret = Vec::with_capacity(
            fmt.numbered_header_len()
                + match &self.packet_type {
                    PacketType::Iframe(i) => i.payload.len(),
                    PacketType::Ui(u) => u.payload.len(),
                    PacketType::Frmr(f) => f.info.len(),
                    _ => 0,
                },
        );
        if fmt.lapb {
            ret.push(if self.cr { LAPB_ADDR_A } else { LAPB_ADDR_B });
        } else {
            ret.extend(self.addr.serialize(self.cr));
        }
        let supervisory = |ret: &mut Vec<u8>, control: u8, nr: u8, poll: bool| {
            if fmt.ext {
                ret.push(control);
                ret.push((nr << 1) | u8::from(poll));
            } else {
                ret.push(control | poll_bit(poll) | ((nr << 5) & NR_MASK));
            }
        };
        match &self.packet_type {
            PacketType::Sabm(s) => ret.push(CONTROL_SABM | poll_bit(s.poll)),
            PacketType::Sabme(s) => ret.push(CONTROL_SABME | poll_bit(s.poll)),
            PacketType::Ua(s) => ret.push(CONTROL_UA | poll_bit(s.poll)),
            PacketType::Dm(s) => ret.push(CONTROL_DM | poll_bit(s.poll)),
            PacketType::Disc(s) => ret.push(CONTROL_DISC | poll_bit(s.poll)),
            PacketType::Frmr(s) => {
                ret.push(CONTROL_FRMR | poll_bit(s.poll));
                ret.extend(&s.info);
            }
            PacketType::Ui(s) => {
                ret.push(CONTROL_UI | poll_bit(s.poll));
                ret.extend(&s.payload);
            }
            PacketType::Rr(s) => supervisory(&mut ret, CONTROL_RR, s.nr, s.poll),
            PacketType::Rnr(s) => supervisory(&mut ret, CONTROL_RNR, s.nr, s.poll),
            PacketType::Rej(s) => supervisory(&mut ret, CONTROL_REJ, s.nr, s.poll),
            PacketType::Iframe(iframe) => {
                if fmt.ext {
                    ret.push(iframe.ns << 1);
                    ret.push((iframe.nr << 1) | u8::from(iframe.poll));
                } else {
                    ret.push(
                        poll_bit(iframe.poll)
                            | ((iframe.nr << 5) & NR_MASK)
                            | ((iframe.ns << 1) & 0b0000_1110),
                    );
                }
                ret.extend(&iframe.payload);
            }
        };
        ret
    }

    /// Parse a frame (without flags or FCS).
    ///
    /// Address problems come back as plain errors: such a frame is not for
    /// anybody and should be dropped. Problems after the address come back as
    /// a [`FrameError`] carrying the MDL error code.
    pub fn parse(bytes: &[u8], fmt: Format) -> Result<Self> {
        let alen = fmt.addr_len();
        if bytes.len() <= alen {
            return Err(frame_error(
                MdlError::N,
                format!("frame too short: {} bytes", bytes.len()),
            ));
        }
        let (addr, cr) = if fmt.lapb {
            match bytes[0] {
                LAPB_ADDR_A => (Addr { sapi: 0, tei: 0 }, true),
                LAPB_ADDR_B => (Addr { sapi: 0, tei: 0 }, false),
                a => return Err(Error::msg(format!("invalid LAPB address {a:02x}"))),
            }
        } else {
            Addr::parse(bytes)?
        };
        let control = bytes[alen];
        let rest = &bytes[alen + 1..];
        let numbered = |rest: &[u8]| -> Result<(u8, bool)> {
            // Second control octet: N(R) and P/F.
            let c2 = *rest.first().ok_or_else(|| {
                frame_error(MdlError::N, "missing second control octet".to_string())
            })?;
            Ok((c2 >> 1, c2 & 1 != 0))
        };
        let packet_type = match control & TYPE_MASK {
            0 | 2 => {
                if fmt.ext {
                    let (nr, poll) = numbered(rest)?;
                    PacketType::Iframe(Iframe {
                        ns: control >> 1,
                        nr,
                        poll,
                        payload: rest[1..].to_vec(),
                    })
                } else {
                    PacketType::Iframe(Iframe {
                        ns: (control >> 1) & 7,
                        nr: (control >> 5) & 7,
                        poll: control & CONTROL_POLL != 0,
                        payload: rest.to_vec(),
                    })
                }
            }
            1 => {
                let (kind, nr, poll, extra) = if fmt.ext {
                    let (nr, poll) = numbered(rest)?;
                    (control, nr, poll, rest.len() - 1)
                } else {
                    (
                        control & !NR_MASK & !CONTROL_POLL,
                        (control >> 5) & 7,
                        control & CONTROL_POLL != 0,
                        rest.len(),
                    )
                };
                if extra != 0 {
                    return Err(frame_error(
                        MdlError::N,
                        format!("supervisory frame with {extra} extra octets"),
                    ));
                }
                match kind {
                    CONTROL_RR => PacketType::Rr(Rr { nr, poll }),
                    CONTROL_RNR => PacketType::Rnr(Rnr { nr, poll }),
                    CONTROL_REJ => PacketType::Rej(Rej { nr, poll }),
                    c => {
                        return Err(frame_error(
                            MdlError::L,
                            format!("unimplemented supervisory control {c:08b}"),
                        ))
                    }
                }
            }
            _ => {
                let poll = control & CONTROL_POLL != 0;
                let no_info = |t: PacketType| -> Result<PacketType> {
                    if rest.is_empty() {
                        Ok(t)
                    } else {
                        Err(frame_error(
                            MdlError::N,
                            format!("unnumbered frame with {} octets of information", rest.len()),
                        ))
                    }
                };
                match control & !CONTROL_POLL {
                    CONTROL_SABM => no_info(PacketType::Sabm(Sabm { poll }))?,
                    CONTROL_SABME => no_info(PacketType::Sabme(Sabme { poll }))?,
                    CONTROL_UA => no_info(PacketType::Ua(Ua { poll }))?,
                    CONTROL_DISC => no_info(PacketType::Disc(Disc { poll }))?,
                    CONTROL_DM => no_info(PacketType::Dm(Dm { poll }))?,
                    CONTROL_FRMR => PacketType::Frmr(Frmr {
                        poll,
                        info: rest.to_vec(),
                    }),
                    CONTROL_UI => PacketType::Ui(Ui {
                        poll,
                        payload: rest.to_vec(),
                    }),
                    c => {
                        return Err(frame_error(
                            MdlError::L,
                            format!("unimplemented control {c:08b}"),
                        ))
                    }
                }
            }
        };
        Ok(Packet {
            addr,
            cr,
            packet_type,
        })
    }
}

/// Physical layer: PH-DATA request and indication.
pub trait Phy {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn recv_timeout(&mut self, timeout: std::time::Duration) -> Result<Option<Vec<u8>>>;
}

/// Frames carried over a serial port, HDLC octet stuffed with FCS.
pub struct Serial {
    decoder: hdlc::Decoder,
    port: Box<dyn serialport::SerialPort>,
}

impl Serial {
    pub fn new(port: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(port, baud)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(Self {
            decoder: hdlc::Decoder::default(),
            port,
        })
    }
}

impl Phy for Serial {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        debug!("Sending frame {frame:02x?}");
        self.port.write_all(&hdlc::escape(frame))?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: std::time::Duration) -> Result<Option<Vec<u8>>> {
        let end = std::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(frame));
            }
            let left = end.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.port.set_timeout(left)?;
            let mut buf = [0u8; 256];
            match self.port.read(&mut buf) {
                Ok(n) => {
                    debug!("Got {n} bytes from serial");
                    self.decoder.push(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// In-process network side of a LAPD user link, for tests.
///
/// Assigns TEI 64 to any identity request, accepts any SABME, answers
/// polls, and answers every in-sequence I frame with an I frame carrying the
/// payload reversed.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FakeNetwork {
    vs: u8,
    vr: u8,
    pub(crate) seen: Vec<Packet>,
}

#[cfg(test)]
impl FakeNetwork {
    pub(crate) const TEI: u8 = 64;

    fn frame(&self, cr: bool, packet_type: PacketType) -> Vec<u8> {
        Packet {
            addr: Addr {
                sapi: 0,
                tei: Self::TEI,
            },
            cr,
            packet_type,
        }
        .serialize(Format::LAPD)
    }

    pub(crate) fn respond(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if let Ok(msg) = tei::TeiMessage::parse(frame) {
            if msg.kind == tei::MessageType::IdRequest {
                return vec![tei::TeiMessage {
                    ri: msg.ri,
                    kind: tei::MessageType::IdAssigned,
                    ai: Self::TEI,
                }
                .serialize(true)];
            }
            return vec![];
        }
        let Ok(packet) = Packet::parse(frame, Format::LAPD) else {
            return vec![];
        };
        self.seen.push(packet.clone());
        // Network commands carry C/R 1, responses 0.
        match packet.packet_type {
            PacketType::Sabme(s) => {
                self.vs = 0;
                self.vr = 0;
                vec![self.frame(false, PacketType::Ua(Ua { poll: s.poll }))]
            }
            PacketType::Disc(s) => vec![self.frame(false, PacketType::Ua(Ua { poll: s.poll }))],
            PacketType::Rr(rr) if rr.poll => vec![self.frame(
                false,
                PacketType::Rr(Rr {
                    nr: self.vr,
                    poll: true,
                }),
            )],
            PacketType::Iframe(i) if i.ns == self.vr => {
                self.vr = (self.vr + 1) % 128;
                let reply = PacketType::Iframe(Iframe {
                    ns: self.vs,
                    nr: self.vr,
                    poll: false,
                    payload: i.payload.iter().rev().copied().collect(),
                });
                self.vs = (self.vs + 1) % 128;
                vec![self.frame(true, reply)]
            }
            _ => vec![],
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FakePhy {
    pub(crate) network: FakeNetwork,
    pub(crate) queue: std::collections::VecDeque<Vec<u8>>,
}

#[cfg(test)]
impl Phy for FakePhy {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let replies = self.network.respond(frame);
        self.queue.extend(replies);
        Ok(())
    }
    fn recv_timeout(&mut self, _timeout: std::time::Duration) -> Result<Option<Vec<u8>>> {
        Ok(self.queue.pop_front())
    }
}
