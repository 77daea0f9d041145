//! All links sharing one D channel.
use std::time::Instant;

use anyhow::{Error, Result};
use log::{debug, warn};

use crate::config::{Config, Variant};
use crate::state::{Link, ReturnEvent};
use crate::tei::{MessageType, TeiHolder, TeiMessage};
use crate::{Addr, GROUP_TEI, TEI_SAPI};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(usize);

/// Routes frames and physical layer events to links.
///
/// Links are kept, and served, in the order they were added.
#[derive(Default)]
pub struct Interface {
    links: Vec<Link>,
}

impl Interface {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, config: Config, now: Instant) -> Result<LinkId> {
        if config.variant == Variant::Lapb && !self.links.is_empty() {
            return Err(Error::msg("a LAPB link needs the interface to itself"));
        }
        if self
            .links
            .iter()
            .any(|l| l.config().variant == Variant::Lapb)
        {
            return Err(Error::msg("interface already carries a LAPB link"));
        }
        if let Some(tei) = config.fixed_tei {
            if self
                .links
                .iter()
                .any(|l| l.config().sapi == config.sapi && l.tei() == Some(tei))
            {
                return Err(Error::msg(format!(
                    "SAPI {} TEI {tei} already in use",
                    config.sapi
                )));
            }
        }
        self.links.push(Link::new(config, now)?);
        Ok(LinkId(self.links.len() - 1))
    }

    #[must_use]
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(id.0)
    }

    /// Run a request against one link.
    pub fn request<F>(
        &mut self,
        id: LinkId,
        now: Instant,
        f: F,
    ) -> Result<Vec<(LinkId, ReturnEvent)>>
    where
        F: FnOnce(&mut Link, Instant) -> Vec<ReturnEvent>,
    {
        let link = self
            .links
            .get_mut(id.0)
            .ok_or_else(|| Error::msg(format!("no such link {id:?}")))?;
        let events = f(link, now);
        let mut out = Vec::new();
        self.collect(id, events, &mut out, now);
        Ok(out)
    }

    /// PH-DATA.indication.
    pub fn frame_received(&mut self, frame: &[u8], now: Instant) -> Vec<(LinkId, ReturnEvent)> {
        let mut out = Vec::new();
        if let Some(lapb) = self
            .links
            .iter()
            .position(|l| l.config().variant == Variant::Lapb)
        {
            let events = self.links[lapb].frame_received(frame, now);
            self.collect(LinkId(lapb), events, &mut out, now);
            return out;
        }
        let (addr, _) = match Addr::parse(frame) {
            Ok(a) => a,
            Err(e) => {
                debug!("dropping frame {frame:02x?}: {e}");
                return out;
            }
        };
        if addr.sapi == TEI_SAPI && addr.tei == GROUP_TEI {
            match TeiMessage::parse(frame) {
                Ok(msg) => self.tei_message(msg, now, &mut out),
                Err(e) => debug!("dropping management frame: {e}"),
            }
            return out;
        }
        for i in 0..self.links.len() {
            let link = &self.links[i];
            if link.config().sapi != addr.sapi {
                continue;
            }
            if addr.tei != GROUP_TEI && link.tei() != Some(addr.tei) {
                continue;
            }
            let events = self.links[i].frame_received(frame, now);
            self.collect(LinkId(i), events, &mut out, now);
        }
        out
    }

    fn tei_message(&mut self, msg: TeiMessage, now: Instant, out: &mut Vec<(LinkId, ReturnEvent)>) {
        debug!("TEI management message {msg:?}");
        for i in 0..self.links.len() {
            // Links earlier in the list may have just taken the TEI.
            let holder = match msg.kind {
                MessageType::IdAssigned => self.holder(msg.ai, i),
                _ => TeiHolder::Free,
            };
            let events = self.links[i].tei_message(msg, holder, now);
            self.collect(LinkId(i), events, out, now);
        }
    }

    /// Which link holds `tei`, as seen from link `asking`. Another holder
    /// wins over `asking` itself.
    fn holder(&self, tei: u8, asking: usize) -> TeiHolder {
        let holders = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.tei() == Some(tei));
        holders
            .clone()
            .find(|(j, _)| *j != asking)
            .or_else(|| holders.clone().next())
            .map_or(TeiHolder::Free, |(_, l)| l.tei_holder())
    }

    /// Move events into `out`, resolving TEI conflicts on the way.
    fn collect(
        &mut self,
        id: LinkId,
        events: Vec<ReturnEvent>,
        out: &mut Vec<(LinkId, ReturnEvent)>,
        now: Instant,
    ) {
        let mut conflicts = Vec::new();
        for ev in events {
            match ev {
                ReturnEvent::TeiConflict(tei) => {
                    if !conflicts.contains(&tei) {
                        conflicts.push(tei);
                    }
                }
                ev => out.push((id, ev)),
            }
        }
        for tei in conflicts {
            if out
                .iter()
                .any(|(_, e)| matches!(e, ReturnEvent::TeiConflict(t) if *t == tei))
            {
                continue;
            }
            let Some(holder) = self.links.iter().position(|l| l.tei() == Some(tei)) else {
                continue;
            };
            warn!("TEI {tei} assigned twice, link {holder} verifies");
            // Marker so a second report in the same batch is not acted on.
            out.push((LinkId(holder), ReturnEvent::TeiConflict(tei)));
            let events = self.links[holder].tei_conflict(now);
            self.collect(LinkId(holder), events, out, now);
        }
    }

    fn each(
        &mut self,
        now: Instant,
        f: impl Fn(&mut Link, Instant) -> Vec<ReturnEvent>,
    ) -> Vec<(LinkId, ReturnEvent)> {
        let mut out = Vec::new();
        for i in 0..self.links.len() {
            let events = f(&mut self.links[i], now);
            self.collect(LinkId(i), events, &mut out, now);
        }
        out
    }

    pub fn poll_timers(&mut self, now: Instant) -> Vec<(LinkId, ReturnEvent)> {
        self.each(now, Link::poll_timers)
    }

    /// The frame last handed down for `id` is out.
    pub fn ph_pull_confirm(
        &mut self,
        id: LinkId,
        now: Instant,
    ) -> Result<Vec<(LinkId, ReturnEvent)>> {
        self.request(id, now, Link::ph_pull_confirm)
    }

    pub fn ph_activate_indication(&mut self, now: Instant) -> Vec<(LinkId, ReturnEvent)> {
        self.each(now, Link::ph_activate_indication)
    }

    pub fn ph_deactivate_indication(&mut self, now: Instant) -> Vec<(LinkId, ReturnEvent)> {
        self.each(now, Link::ph_deactivate_indication)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.links.iter().filter_map(Link::next_deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Dl, State};
    use crate::{Format, Packet, PacketType, Ua, Ui};

    fn request_ri(events: &[(LinkId, ReturnEvent)]) -> Option<u16> {
        events.iter().find_map(|(_, e)| match e {
            ReturnEvent::Frame(f) => TeiMessage::parse(f).ok().map(|m| m.ri),
            _ => None,
        })
    }

    fn assigned(ri: u16, tei: u8) -> Vec<u8> {
        TeiMessage {
            ri,
            kind: MessageType::IdAssigned,
            ai: tei,
        }
        .serialize(true)
    }

    #[test]
    fn routes_by_address() -> Result<()> {
        let now = Instant::now();
        let mut iface = Interface::new();
        let a = iface.add_link(Config::default().with_fixed_tei(1), now)?;
        let b = iface.add_link(Config::default().with_fixed_tei(2), now)?;
        assert!(iface.add_link(Config::default().with_fixed_tei(2), now).is_err());

        let ui = |tei| {
            Packet {
                addr: Addr { sapi: 0, tei },
                cr: true,
                packet_type: PacketType::Ui(Ui {
                    poll: false,
                    payload: vec![tei],
                }),
            }
            .serialize(Format::LAPD)
        };
        let ev = iface.frame_received(&ui(2), now);
        assert_eq!(ev, vec![(b, ReturnEvent::Dl(Dl::UnitData(vec![2])))]);
        let ev = iface.frame_received(&ui(GROUP_TEI), now);
        assert_eq!(
            ev,
            vec![
                (a, ReturnEvent::Dl(Dl::UnitData(vec![GROUP_TEI]))),
                (b, ReturnEvent::Dl(Dl::UnitData(vec![GROUP_TEI]))),
            ]
        );
        assert!(iface.frame_received(&ui(3), now).is_empty());
        // Bad EA bits.
        assert!(iface.frame_received(&[0x01, 0x03, 0x03], now).is_empty());
        Ok(())
    }

    #[test]
    fn tei_assignment_reaches_requester() -> Result<()> {
        let now = Instant::now();
        let mut iface = Interface::new();
        let a = iface.add_link(Config::default(), now)?;
        let b = iface.add_link(Config::default(), now)?;
        let ev = iface.request(a, now, Link::dl_establish_request)?;
        let ri_a = request_ri(&ev).unwrap();
        let ev = iface.request(b, now, Link::dl_establish_request)?;
        let ri_b = request_ri(&ev).unwrap();
        // Continue only if the two happened to pick different numbers.
        if ri_a == ri_b {
            return Ok(());
        }
        iface.frame_received(&assigned(ri_b, 80), now);
        assert_eq!(iface.link(a).unwrap().tei(), None);
        assert_eq!(iface.link(b).unwrap().tei(), Some(80));
        assert_eq!(iface.link(b).unwrap().state(), State::AwaitEstablish);
        Ok(())
    }

    #[test]
    fn duplicate_tei_verified_by_holder() -> Result<()> {
        let now = Instant::now();
        let mut iface = Interface::new();
        let a = iface.add_link(Config::default(), now)?;
        let b = iface.add_link(Config::default(), now)?;
        let ev = iface.request(a, now, Link::dl_establish_request)?;
        let ri_a = request_ri(&ev).unwrap();
        iface.frame_received(&assigned(ri_a, 90), now);
        assert_eq!(iface.link(a).unwrap().tei(), Some(90));

        let ev = iface.request(b, now, Link::dl_establish_request)?;
        let ri_b = request_ri(&ev).unwrap();
        if ri_a == ri_b {
            return Ok(());
        }
        // The network hands the same TEI out again.
        let ev = iface.frame_received(&assigned(ri_b, 90), now);
        assert_eq!(iface.link(b).unwrap().tei(), None);
        assert_eq!(iface.link(b).unwrap().state(), State::AwaitTei);
        let conflicts: Vec<_> = ev
            .iter()
            .filter(|(_, e)| matches!(e, ReturnEvent::TeiConflict(90)))
            .collect();
        assert_eq!(conflicts, vec![&(a, ReturnEvent::TeiConflict(90))]);
        // The holder asks the network to verify.
        let verify: Vec<TeiMessage> = ev
            .iter()
            .filter_map(|(_, e)| match e {
                ReturnEvent::Frame(f) => TeiMessage::parse(f).ok(),
                _ => None,
            })
            .collect();
        assert_eq!(verify.len(), 1);
        assert_eq!(verify[0].kind, MessageType::IdVerify);
        assert_eq!(verify[0].ai, 90);
        Ok(())
    }

    #[test]
    fn fixed_tei_not_handed_out_again() -> Result<()> {
        let now = Instant::now();
        let mut iface = Interface::new();
        let a = iface.add_link(Config::default().with_fixed_tei(90), now)?;
        let b = iface.add_link(Config::default(), now)?;
        let ev = iface.request(b, now, Link::dl_establish_request)?;
        let ri_b = request_ri(&ev).unwrap();

        let ev = iface.frame_received(&assigned(ri_b, 90), now);
        assert_eq!(iface.link(a).unwrap().tei(), Some(90));
        assert_eq!(iface.link(b).unwrap().tei(), None);
        assert_eq!(iface.link(b).unwrap().state(), State::AwaitTei);
        let conflicts: Vec<_> = ev
            .iter()
            .filter(|(_, e)| matches!(e, ReturnEvent::TeiConflict(_)))
            .collect();
        assert_eq!(conflicts, vec![&(a, ReturnEvent::TeiConflict(90))]);
        // Nothing to verify for a hand configured TEI.
        assert!(!ev
            .iter()
            .any(|(_, e)| matches!(e, ReturnEvent::Frame(_))));

        // B keeps asking.
        let ev = iface.poll_timers(now + Config::default().t202);
        assert!(request_ri(&ev).is_some());
        Ok(())
    }

    #[test]
    fn timers_and_deactivation_fan_out() -> Result<()> {
        let now = Instant::now();
        let mut iface = Interface::new();
        let a = iface.add_link(Config::default().with_fixed_tei(1), now)?;
        let b = iface.add_link(Config::default().with_fixed_tei(2), now)?;
        iface.request(a, now, Link::dl_establish_request)?;
        iface.ph_pull_confirm(a, now)?;
        iface.request(b, now, Link::dl_establish_request)?;
        iface.ph_pull_confirm(b, now)?;
        let ua = |tei| {
            Packet {
                addr: Addr { sapi: 0, tei },
                cr: false,
                packet_type: PacketType::Ua(Ua { poll: true }),
            }
            .serialize(Format::LAPD)
        };
        iface.frame_received(&ua(1), now);
        assert_eq!(iface.link(a).unwrap().state(), State::DataTransferReady);
        assert_eq!(iface.link(b).unwrap().state(), State::AwaitEstablish);
        let deadline = iface.next_deadline().unwrap();
        assert_eq!(deadline, now + Config::default().t200);

        let ev = iface.poll_timers(deadline);
        assert!(ev.iter().all(|(id, _)| *id == b));
        assert!(!ev.is_empty());

        let ev = iface.ph_deactivate_indication(deadline);
        assert!(ev.contains(&(a, ReturnEvent::Dl(Dl::ReleaseIndication))));
        assert!(ev.contains(&(b, ReturnEvent::Dl(Dl::ReleaseIndication))));
        assert_eq!(iface.next_deadline(), None);
        Ok(())
    }

    #[test]
    fn lapb_alone() {
        let now = Instant::now();
        let mut iface = Interface::new();
        assert!(iface.add_link(Config::lapb(), now).is_ok());
        assert!(iface.add_link(Config::default(), now).is_err());
    }
}
