//! Async client.
//!
//! Same as [`crate::Client`], but driven by tokio over any byte stream,
//! such as a `tokio_serial::SerialStream`. Frames are HDLC framed on the
//! stream.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::interface::{Interface, LinkId};
use crate::state::{Dl, Link, MdlError, ReturnEvent};
use crate::{hdlc, Config, Info};

pub struct Client<T: AsyncRead + AsyncWrite + Unpin> {
    iface: Interface,
    id: LinkId,
    port: T,
    bytes_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    frame_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    established: bool,
    failed: bool,
    eof: bool,
    incoming: VecDeque<Vec<u8>>,
    unit_data: VecDeque<Vec<u8>>,
    errors: Vec<MdlError>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Client<T> {
    /// Establish a link over `port`, getting a TEI first if needed.
    ///
    /// Gives up when the link does, after N200 retries.
    pub async fn connect(config: Config, port: T) -> Result<Self> {
        let mut iface = Interface::new();
        let id = iface.add_link(config, Instant::now())?;
        let (bytes_tx, mut bytes_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(10);
        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(10);
        tokio::spawn(async move {
            let mut decoder = hdlc::Decoder::default();
            while let Some(bytes) = bytes_rx.recv().await {
                debug!("Got {} HDLC bytes", bytes.len());
                decoder.push(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    if frame_tx.send(frame).await.is_err() {
                        debug!("Frame receiver gone");
                        return;
                    }
                }
            }
            debug!("HDLC decoder ending");
        });
        let mut cli = Self {
            iface,
            id,
            port,
            bytes_tx,
            frame_rx,
            established: false,
            failed: false,
            eof: false,
            incoming: VecDeque::new(),
            unit_data: VecDeque::new(),
            errors: Vec::new(),
        };
        let ev = cli
            .iface
            .request(id, Instant::now(), Link::dl_establish_request)?;
        cli.actions(ev).await?;
        while !cli.established {
            if cli.failed {
                return Err(Error::msg("establishment failed"));
            }
            cli.wait_event().await?;
        }
        Ok(cli)
    }

    pub fn link(&self) -> Result<&Link> {
        self.iface
            .link(self.id)
            .ok_or_else(|| Error::msg("link went away"))
    }

    #[must_use]
    pub fn errors(&self) -> &[MdlError] {
        &self.errors
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    fn remaining(&self) -> Duration {
        self.iface
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(86400))
    }

    async fn wait_event(&mut self) -> Result<()> {
        let timer = tokio::time::sleep(self.remaining());
        tokio::pin!(timer);

        let mut buf = [0; 1024];
        tokio::select! {
            () = &mut timer => {
                let ev = self.iface.poll_timers(Instant::now());
                self.actions(ev).await?;
            },
            frame = self.frame_rx.recv() => {
                let frame = frame.ok_or(Error::msg("HDLC decoder closed channel"))?;
                debug!("Got frame: {frame:02x?}");
                let ev = self.iface.frame_received(&frame, Instant::now());
                self.actions(ev).await?;
            },
            res = self.port.read(&mut buf) => match res? {
                0 => return Err(Error::msg("port closed")),
                n => {
                    debug!("Read {n} bytes from port");
                    self.bytes_tx.send(buf[..n].to_vec()).await?;
                },
            },
        }
        Ok(())
    }

    /// Release the link, and wait for the peer to confirm.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.established {
            return Ok(());
        }
        let ev = self
            .iface
            .request(self.id, Instant::now(), Link::dl_release_request)?;
        self.actions(ev).await?;
        while self.established {
            self.wait_event().await?;
        }
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.established {
            return Err(Error::msg("link not established"));
        }
        let info = Info::new(data.to_vec());
        let ev = self
            .iface
            .request(self.id, Instant::now(), |l, now| l.dl_data_request(info, now))?;
        self.actions(ev).await
    }

    pub async fn write_unit(&mut self, data: &[u8]) -> Result<()> {
        let payload = data.to_vec();
        let ev = self.iface.request(self.id, Instant::now(), |l, now| {
            l.dl_unit_data_request(payload, now)
        })?;
        self.actions(ev).await
    }

    /// Read one I frame worth of data. Empty means the link was released.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(data) = self.incoming.pop_front() {
                return Ok(data);
            }
            if self.eof {
                return Ok(vec![]);
            }
            self.wait_event().await?;
        }
    }

    /// Read one UI frame worth of data.
    pub async fn read_unit(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(data) = self.unit_data.pop_front() {
                return Ok(data);
            }
            self.wait_event().await?;
        }
    }

    async fn actions(&mut self, events: Vec<(LinkId, ReturnEvent)>) -> Result<()> {
        let mut work: VecDeque<_> = events.into();
        while let Some((id, ev)) = work.pop_front() {
            match ev {
                ReturnEvent::Frame(frame) => {
                    self.port.write_all(&hdlc::escape(&frame)).await?;
                    self.port.flush().await?;
                    work.extend(self.iface.ph_pull_confirm(id, Instant::now())?);
                }
                ReturnEvent::Dl(dl) => match dl {
                    Dl::EstablishConfirm | Dl::EstablishIndication => {
                        self.established = true;
                        self.eof = false;
                    }
                    Dl::ReleaseConfirm | Dl::ReleaseIndication => {
                        if !self.established {
                            self.failed = true;
                        }
                        self.established = false;
                        self.eof = true;
                    }
                    Dl::Data(data) => self.incoming.push_back(data),
                    Dl::UnitData(data) => self.unit_data.push_back(data),
                    Dl::BufferFreed(_) => {}
                },
                ReturnEvent::MdlError(code) => {
                    warn!("MDL-ERROR {code}");
                    self.errors.push(code);
                }
                ReturnEvent::PhActivateRequest => {
                    work.extend(self.iface.ph_activate_indication(Instant::now()));
                }
                ReturnEvent::PhDeactivateRequest | ReturnEvent::TeiConflict(_) => {}
            }
        }
        Ok(())
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Drop for Client<T> {
    fn drop(&mut self) {
        if self.established {
            // Can't await here. The peer will notice on its T203.
            warn!("async client dropped while the link is established");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeNetwork;

    async fn network(mut net: tokio::io::DuplexStream) {
        let mut network = FakeNetwork::default();
        let mut decoder = hdlc::Decoder::default();
        let mut buf = [0; 1024];
        loop {
            let n = match net.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                for reply in network.respond(&frame) {
                    if net.write_all(&hdlc::escape(&reply)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn talk_to_network() -> Result<()> {
        let (port, net) = tokio::io::duplex(4096);
        tokio::spawn(network(net));

        let mut c = Client::connect(Config::default(), port).await?;
        assert_eq!(c.link()?.tei(), Some(FakeNetwork::TEI));

        c.write(b"hello").await?;
        assert_eq!(c.read().await?, b"olleh");
        c.write(b"ab").await?;
        assert_eq!(c.read().await?, b"ba");
        assert_eq!(c.link()?.vs(), 2);

        c.disconnect().await?;
        assert!(c.eof());
        assert_eq!(c.read().await?, Vec::<u8>::new());
        assert!(c.errors().is_empty());
        Ok(())
    }
}
