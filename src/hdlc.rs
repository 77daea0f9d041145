//! HDLC framing for byte streams: flags, octet stuffing, FCS-16.
use std::collections::VecDeque;

use anyhow::{Error, Result};
use log::debug;

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// CRC-16/X.25 as used for the HDLC frame check sequence.
const X25: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

#[must_use]
pub fn fcs(data: &[u8]) -> u16 {
    X25.checksum(data)
}

/// Wrap a frame: FCS appended, stuffed, between flags.
#[must_use]
pub fn escape(bytes: &[u8]) -> Vec<u8> {
    let fcs = fcs(bytes).to_le_bytes();
    let mut ret = Vec::with_capacity(bytes.len() + 6);
    ret.push(FLAG);
    for &b in bytes.iter().chain(fcs.iter()) {
        match b {
            FLAG | ESCAPE => ret.extend([ESCAPE, b ^ ESCAPE_XOR]),
            b => ret.push(b),
        }
    }
    ret.push(FLAG);
    ret
}

/// Find the first two flags.
#[must_use]
pub fn find_frame(vec: &VecDeque<u8>) -> Option<(usize, usize)> {
    let start = vec.iter().position(|&b| b == FLAG)?;
    let end = vec.iter().skip(start + 1).position(|&b| b == FLAG)?;
    Some((start, start + 1 + end))
}

#[must_use]
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut unescaped = Vec::with_capacity(data.len());
    let mut is_escaped = false;
    for &byte in data {
        if is_escaped {
            unescaped.push(byte ^ ESCAPE_XOR);
            is_escaped = false;
        } else if byte == ESCAPE {
            is_escaped = true;
        } else {
            unescaped.push(byte);
        }
    }
    unescaped
}

/// Check and strip the trailing FCS.
pub fn strip_fcs(mut frame: Vec<u8>) -> Result<Vec<u8>> {
    if frame.len() < 3 {
        return Err(Error::msg(format!("frame too short: {frame:02x?}")));
    }
    let n = frame.len() - 2;
    let got = u16::from_le_bytes([frame[n], frame[n + 1]]);
    let want = fcs(&frame[..n]);
    if got != want {
        return Err(Error::msg(format!(
            "bad FCS {got:04x}, want {want:04x} for {:02x?}",
            &frame[..n]
        )));
    }
    frame.truncate(n);
    Ok(frame)
}

/// Incremental deframer.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: VecDeque<u8>,
}

impl Decoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    /// Next good frame, if a complete one is buffered. Frames with a bad
    /// FCS are dropped.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        while let Some((a, b)) = find_frame(&self.buf) {
            let raw: Vec<u8> = self.buf.range(a + 1..b).copied().collect();
            // The closing flag may open the next frame.
            self.buf.drain(..b);
            if raw.is_empty() {
                continue;
            }
            match strip_fcs(unescape(&raw)) {
                Ok(frame) => return Some(frame),
                Err(e) => debug!("Dropping frame: {e}"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(fcs(b"123456789"), 0x906E);
    }

    #[test]
    fn stuffing() {
        let wire = escape(&[0x00, 0x7E, 0x7D, 0x01]);
        assert_eq!(&wire[..7], &[FLAG, 0x00, ESCAPE, 0x5E, ESCAPE, 0x5D, 0x01]);
        assert_eq!(*wire.last().unwrap(), FLAG);
        assert!(!wire[1..wire.len() - 1].contains(&FLAG));
    }

    #[test]
    fn decode_stream() {
        let mut d = Decoder::default();
        let mut wire = vec![0xAA, 0xBB];
        wire.extend(escape(&[0x02, 0x81, 0x7F]));
        wire.extend(escape(&[0x00, 0x81, 0x7E, 0x7D]));
        let (first, second) = wire.split_at(7);
        d.push(first);
        assert_eq!(d.next_frame(), None);
        d.push(second);
        assert_eq!(d.next_frame(), Some(vec![0x02, 0x81, 0x7F]));
        assert_eq!(d.next_frame(), Some(vec![0x00, 0x81, 0x7E, 0x7D]));
        assert_eq!(d.next_frame(), None);
    }

    #[test]
    fn bad_fcs_dropped() {
        let mut d = Decoder::default();
        let mut bad = escape(&[0x02, 0x81, 0x7F]);
        bad[2] ^= 0x04;
        d.push(&bad);
        d.push(&escape(&[0x00, 0x81, 0x73]));
        assert_eq!(d.next_frame(), Some(vec![0x00, 0x81, 0x73]));
    }
}
