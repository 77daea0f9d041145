//! Client code.
//!
//! This file implements a blocking driver for one data link: it owns the
//! physical layer and an [`Interface`] with a single link, runs the timers,
//! and turns the link's output into frames on the wire and data for the
//! caller.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use std::time::Duration;
//! use rlapd::{Client, Config, Serial};
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let phy = Serial::new("/dev/ttyUSB0", 115200)?;
//! let mut client = Client::new(Config::default(), Box::new(phy))?;
//! client.connect(Duration::from_secs(10))?;
//! client.write("Hello\r".as_bytes())?;
//! println!("{:?}", client.read_until(done.clone()));
//! # Ok::<(), anyhow::Error>(())
//! ```
use std::collections::VecDeque;
use std::io::BufWriter;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, error, warn};

use crate::interface::{Interface, LinkId};
use crate::pcap::{Direction, PcapWriter};
use crate::state::{Dl, Link, MdlError, ReturnEvent};
use crate::{Config, Info, Phy};

/// A data link client.
///
/// `.read_until()` MUST be called fairly often (how often depends on T200
/// and T203), in order to drain received frames, answer polls from the
/// peer, and see a DISC.
#[must_use]
pub struct Client {
    phy: Box<dyn Phy>,
    iface: Interface,
    id: LinkId,
    established: bool,
    eof: bool,
    failed: bool,
    incoming: VecDeque<Vec<u8>>,
    unit_data: VecDeque<Vec<u8>>,
    errors: Vec<MdlError>,
    pcap: Option<PcapWriter<BufWriter<std::fs::File>>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.established {
            return;
        }
        let now = Instant::now();
        if let Err(e) = self
            .iface
            .request(self.id, now, Link::dl_release_request)
            .and_then(|ev| self.actions(ev))
        {
            error!("Error disconnecting on drop: {e}");
        }
    }
}

impl Client {
    /// Create a new client for one link over the given physical layer.
    pub fn new(config: Config, phy: Box<dyn Phy>) -> Result<Self> {
        let mut iface = Interface::new();
        let id = iface.add_link(config, Instant::now())?;
        Ok(Self {
            phy,
            iface,
            id,
            established: false,
            eof: false,
            failed: false,
            incoming: VecDeque::new(),
            unit_data: VecDeque::new(),
            errors: Vec::new(),
            pcap: None,
        })
    }

    /// Write every frame sent or received to a new pcap file.
    pub fn capture(&mut self, filename: std::path::PathBuf) -> Result<()> {
        let config = self.config()?;
        self.pcap = Some(PcapWriter::create(filename, config.variant, config.role)?);
        Ok(())
    }

    fn config(&self) -> Result<Config> {
        Ok(self.link()?.config().clone())
    }

    pub fn link(&self) -> Result<&Link> {
        self.iface
            .link(self.id)
            .ok_or_else(|| Error::msg("link went away"))
    }

    /// Management errors seen so far.
    #[must_use]
    pub fn errors(&self) -> &[MdlError] {
        &self.errors
    }

    /// Returns true if the link was released.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Establish the link, getting a TEI first if needed.
    pub fn connect(&mut self, timeout: Duration) -> Result<()> {
        let until = Instant::now() + timeout;
        self.failed = false;
        let ev = self
            .iface
            .request(self.id, Instant::now(), Link::dl_establish_request)?;
        self.actions(ev)?;
        while !self.established {
            if self.failed {
                return Err(Error::msg("establishment failed"));
            }
            let now = Instant::now();
            if now >= until {
                return Err(Error::msg("connection timeout"));
            }
            self.step(until - now)?;
        }
        debug!("Connection successful");
        self.eof = false;
        Ok(())
    }

    /// Wait for the peer to establish the link.
    ///
    /// Returns false if `until` passed first.
    pub fn accept(&mut self, until: Instant) -> Result<bool> {
        while !self.established {
            let now = Instant::now();
            if now >= until {
                return Ok(false);
            }
            self.step(until - now)?;
        }
        self.eof = false;
        Ok(true)
    }

    /// Release the link, and wait for the peer to confirm.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.established {
            return Ok(());
        }
        let config = self.config()?;
        let until = Instant::now() + config.t200 * (u32::from(config.n200) + 2);
        let ev = self
            .iface
            .request(self.id, Instant::now(), Link::dl_release_request)?;
        self.actions(ev)?;
        while self.established {
            let now = Instant::now();
            if now >= until {
                return Err(Error::msg("disconnect timeout"));
            }
            self.step(until - now)?;
        }
        Ok(())
    }

    /// Write data on an established link.
    ///
    /// This may block.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.established {
            return Err(Error::msg("link not established"));
        }
        let info = Info::new(data.to_vec());
        let ev = self
            .iface
            .request(self.id, Instant::now(), |l, now| l.dl_data_request(info, now))?;
        self.actions(ev)
    }

    /// Send unacknowledged data.
    pub fn write_unit(&mut self, data: &[u8]) -> Result<()> {
        let payload = data.to_vec();
        let ev = self.iface.request(self.id, Instant::now(), |l, now| {
            l.dl_unit_data_request(payload, now)
        })?;
        self.actions(ev)
    }

    /// Unacknowledged data received so far.
    pub fn read_unit(&mut self) -> Option<Vec<u8>> {
        self.unit_data.pop_front()
    }

    /// Read data, or give up when `done` is set.
    ///
    /// Returns an error, Some data, or None if the link was released.
    pub fn read_until(
        &mut self,
        done: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<Option<Vec<u8>>> {
        while self.incoming.is_empty() {
            if self.eof {
                return Ok(None);
            }
            if done.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.step(Duration::from_millis(100))?;
        }
        Ok(self.incoming.pop_front())
    }

    /// Wait for one frame or timer, at most `max`.
    fn step(&mut self, max: Duration) -> Result<()> {
        let now = Instant::now();
        let timeout = match self.iface.next_deadline() {
            Some(d) => max.min(d.saturating_duration_since(now)),
            None => max,
        };
        if let Some(frame) = self.phy.recv_timeout(timeout)? {
            if let Some(pcap) = &mut self.pcap {
                pcap.write(&frame, Direction::Received)?;
            }
            let ev = self.iface.frame_received(&frame, Instant::now());
            self.actions(ev)?;
        }
        let ev = self.iface.poll_timers(Instant::now());
        self.actions(ev)
    }

    /// Carry out what the link asked for.
    fn actions(&mut self, events: Vec<(LinkId, ReturnEvent)>) -> Result<()> {
        let mut work: VecDeque<_> = events.into();
        while let Some((id, ev)) = work.pop_front() {
            match ev {
                ReturnEvent::Frame(frame) => {
                    if let Some(pcap) = &mut self.pcap {
                        pcap.write(&frame, Direction::Sent)?;
                    }
                    self.phy.send(&frame)?;
                    work.extend(self.iface.ph_pull_confirm(id, Instant::now())?);
                }
                ReturnEvent::Dl(dl) => self.deliver(dl),
                ReturnEvent::MdlError(code) => {
                    warn!("MDL-ERROR {code}");
                    self.errors.push(code);
                }
                // A serial line is always up.
                ReturnEvent::PhActivateRequest => {
                    work.extend(self.iface.ph_activate_indication(Instant::now()));
                }
                ReturnEvent::PhDeactivateRequest => debug!("PH-DEACTIVATE requested"),
                ReturnEvent::TeiConflict(tei) => debug!("TEI {tei} conflict handled"),
            }
        }
        if let Some(pcap) = &mut self.pcap {
            pcap.flush()?;
        }
        Ok(())
    }

    fn deliver(&mut self, dl: Dl) {
        match dl {
            Dl::EstablishConfirm | Dl::EstablishIndication => {
                debug!("{dl:?}");
                self.established = true;
                self.eof = false;
            }
            Dl::ReleaseConfirm | Dl::ReleaseIndication => {
                debug!("{dl:?}");
                if !self.established {
                    self.failed = true;
                }
                self.established = false;
                self.eof = true;
            }
            Dl::Data(data) => self.incoming.push_back(data),
            Dl::UnitData(data) => self.unit_data.push_back(data),
            Dl::BufferFreed(n) => debug!("{n} octets acknowledged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use crate::FakePhy;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn talk_to_network() -> Result<()> {
        let mut c = Client::new(Config::default(), Box::new(FakePhy::default()))?;
        let path = std::env::temp_dir().join(format!("rlapd-client-{}.pcap", std::process::id()));
        let _ = std::fs::remove_file(&path);
        c.capture(path.clone())?;

        c.connect(Duration::from_secs(5))?;
        assert_eq!(c.link()?.tei(), Some(crate::FakeNetwork::TEI));
        assert_eq!(c.link()?.state(), State::DataTransferReady);

        c.write(&[1, 2, 3])?;
        let done = Arc::new(AtomicBool::new(false));
        assert_eq!(c.read_until(done.clone())?, Some(vec![3, 2, 1]));

        c.disconnect()?;
        assert!(c.eof());
        assert_eq!(c.read_until(done)?, None);
        assert!(c.errors().is_empty());
        assert_eq!(c.link()?.state(), State::Disconnected);
        drop(c);

        let captured = std::fs::metadata(&path)?.len();
        std::fs::remove_file(&path)?;
        // Header plus at least the request, SABME and I frame each way.
        assert!(captured > 24 + 6 * 16);
        Ok(())
    }

    #[test]
    fn write_needs_link() -> Result<()> {
        let mut c = Client::new(Config::default(), Box::new(FakePhy::default()))?;
        assert!(c.write(b"x").is_err());
        // Unit data is held until a TEI is assigned.
        c.write_unit(b"hello")?;
        assert!(!c.accept(Instant::now() + Duration::from_millis(50))?);
        assert_eq!(c.link()?.tei(), Some(crate::FakeNetwork::TEI));
        assert_eq!(c.link()?.state(), State::Disconnected);
        Ok(())
    }

    #[test]
    fn fixed_tei_skips_assignment() -> Result<()> {
        let config = Config::default().with_fixed_tei(crate::FakeNetwork::TEI);
        let mut c = Client::new(config, Box::new(FakePhy::default()))?;
        assert_eq!(c.link()?.state(), State::Disconnected);
        c.connect(Duration::from_secs(5))?;
        assert_eq!(c.link()?.state(), State::DataTransferReady);
        Ok(())
    }
}
