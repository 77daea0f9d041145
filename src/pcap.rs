//! pcap writer
//!
//! The pcap format is very simple, so no need for an external crate or linking
//! to libpcap.
//!
//! This implementation writes little endian pcap files on all platforms.
//!
//! LAPD frames are written as `LINKTYPE_LINUX_LAPD`, which wraps each frame in
//! a 16 byte pseudo-header saying whether the network sent it. LAPB frames
//! are written as `LINKTYPE_LAPB_WITH_DIR`, with a one byte direction.
//!
//! Useful resources:
//! * https://wiki.wireshark.org/Development/LibpcapFileFormat
//! * https://www.tcpdump.org/linktypes.html
//! * https://www.tcpdump.org/linktypes/LINKTYPE_LINUX_LAPD.html

use std::io::BufWriter;
use std::io::Write;

use anyhow::Result;

use crate::config::{Role, Variant};

// Little endian magic.
const MAGIC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const LINKTYPE_LINUX_LAPD: u32 = 177;
const LINKTYPE_LAPB_WITH_DIR: u32 = 207;

// Pseudo-header fields.
const PACKET_HOST: u16 = 0;
const PACKET_OUTGOING: u16 = 4;
const ARPHRD_LAPD: u16 = 8445;
const ETH_P_LAPD: u16 = 0x0030;

fn write_u16(mut w: impl std::io::Write, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32(mut w: impl std::io::Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

/// PcapWriter writes LAPD or LAPB pcap files.
pub struct PcapWriter<W: Write> {
    f: W,
    variant: Variant,
    role: Role,
}

impl PcapWriter<BufWriter<std::fs::File>> {
    /// Create a new pcap file. Fails if the file already exists.
    ///
    /// It writes buffered, for efficiency, so a crash could lose the last
    /// packets.
    pub fn create(filename: std::path::PathBuf, variant: Variant, role: Role) -> Result<Self> {
        let f = BufWriter::new(
            std::fs::File::options()
                .read(false)
                .write(true)
                .create_new(true)
                .open(filename)?,
        );
        Self::new(f, variant, role)
    }
}

impl<W: Write> PcapWriter<W> {
    /// Start a capture on any writer, writing the file header.
    pub fn new(mut f: W, variant: Variant, role: Role) -> Result<Self> {
        f.write_all(&MAGIC)?;
        write_u16(&mut f, VERSION_MAJOR)?;
        write_u16(&mut f, VERSION_MINOR)?;

        // GMT offset and time source accuracy. All tools set zero.
        write_u32(&mut f, 0)?;
        write_u32(&mut f, 0)?;

        // Snaplen.
        write_u32(&mut f, 65535)?;

        // Frames are written without FCS.
        write_u32(
            &mut f,
            match variant {
                Variant::Lapd => LINKTYPE_LINUX_LAPD,
                Variant::Lapb => LINKTYPE_LAPB_WITH_DIR,
            },
        )?;
        Ok(Self { f, variant, role })
    }

    fn sent_by_network(&self, dir: Direction) -> bool {
        (dir == Direction::Received) == (self.role == Role::User)
    }

    fn header(&self, dir: Direction) -> Vec<u8> {
        let network = u8::from(self.sent_by_network(dir));
        match self.variant {
            Variant::Lapd => {
                let mut h = Vec::with_capacity(16);
                let pkttype = match dir {
                    Direction::Received => PACKET_HOST,
                    Direction::Sent => PACKET_OUTGOING,
                };
                h.extend(pkttype.to_be_bytes());
                h.extend(ARPHRD_LAPD.to_be_bytes());
                // Address length, and the address: first octet is the
                // network flag.
                h.extend(1u16.to_be_bytes());
                h.extend([network, 0, 0, 0, 0, 0, 0, 0]);
                h.extend(ETH_P_LAPD.to_be_bytes());
                h
            }
            // DCE is the network side.
            Variant::Lapb => vec![network],
        }
    }

    /// Write one frame as a new packet entry.
    ///
    /// If this write fails, no further writes can be made, as the added record
    /// is now only partially added.
    pub fn write(&mut self, frame: &[u8], dir: Direction) -> Result<()> {
        let header = self.header(dir);
        let len = (header.len() + frame.len()) as u32;
        let now = std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH)?;
        // TODO: the pcap format is not Y2036 safe. Move to pcapng.
        write_u32(&mut self.f, now.as_secs() as u32)?;
        write_u32(&mut self.f, now.subsec_micros())?;
        write_u32(&mut self.f, len)?;
        write_u32(&mut self.f, len)?;
        self.f.write_all(&header)?;
        self.f.write_all(frame)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.f.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lapd_layout() -> Result<()> {
        let mut w = PcapWriter::new(Vec::new(), Variant::Lapd, Role::User)?;
        w.write(&[0x00, 0x81, 0x7F], Direction::Sent)?;
        w.write(&[0x00, 0x81, 0x73], Direction::Received)?;
        let buf = w.into_inner();
        assert_eq!(&buf[..4], &MAGIC);
        assert_eq!(&buf[20..24], &177u32.to_le_bytes());

        let rec = &buf[24..];
        // Captured and original length: pseudo-header plus frame.
        assert_eq!(&rec[8..12], &19u32.to_le_bytes());
        assert_eq!(&rec[12..16], &19u32.to_le_bytes());
        let pseudo = &rec[16..32];
        assert_eq!(&pseudo[..2], &[0, 4]);
        assert_eq!(&pseudo[2..4], &ARPHRD_LAPD.to_be_bytes());
        assert_eq!(&pseudo[4..6], &[0, 1]);
        // Sent by the user.
        assert_eq!(pseudo[6], 0);
        assert_eq!(&pseudo[14..16], &[0x00, 0x30]);
        assert_eq!(&rec[32..35], &[0x00, 0x81, 0x7F]);

        let rec = &rec[35..];
        assert_eq!(&rec[16..18], &[0, 0]);
        // Sent by the network.
        assert_eq!(rec[22], 1);
        assert_eq!(rec.len(), 16 + 16 + 3);
        Ok(())
    }

    #[test]
    fn lapb_direction() -> Result<()> {
        let mut w = PcapWriter::new(Vec::new(), Variant::Lapb, Role::Network)?;
        w.write(&[0x01, 0x3F], Direction::Sent)?;
        let buf = w.into_inner();
        assert_eq!(&buf[20..24], &207u32.to_le_bytes());
        assert_eq!(&buf[24 + 16..], &[1, 0x01, 0x3F]);
        Ok(())
    }
}
