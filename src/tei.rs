//! TEI management, terminal side.
//!
//! A link without a fixed TEI asks the network for one with a broadcast
//! identity request carrying a random reference number Ri, and takes the
//! TEI from the assignment that echoes its Ri. The network may later check,
//! remove or ask the terminal to verify the TEI.
//!
//! The manager never touches the link. It returns [`TeiAction`]s, and the
//! link applies them.
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{Config, Role};
use crate::fsm::{FsmDefinition, FsmInstance, Machine, Symbol, Timer};
use crate::{Addr, Format, Packet, PacketType, Ui, GROUP_TEI, TEI_SAPI};

/// Layer management entity identifier.
pub const MANAGEMENT_ENTITY: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    IdRequest = 1,
    IdAssigned = 2,
    IdDenied = 3,
    IdCheckRequest = 4,
    IdCheckResponse = 5,
    IdRemove = 6,
    IdVerify = 7,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::IdRequest,
            2 => Self::IdAssigned,
            3 => Self::IdDenied,
            4 => Self::IdCheckRequest,
            5 => Self::IdCheckResponse,
            6 => Self::IdRemove,
            7 => Self::IdVerify,
            _ => return None,
        })
    }
}

/// A TEI management message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeiMessage {
    pub ri: u16,
    pub kind: MessageType,
    /// Action indicator: the TEI the message is about.
    pub ai: u8,
}

impl TeiMessage {
    /// Parse a complete frame. Anything that is not a UI frame to SAPI 63,
    /// TEI 127 with a well formed management message is an error.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let packet = Packet::parse(frame, Format::LAPD)?;
        if packet.addr.sapi != TEI_SAPI || packet.addr.tei != GROUP_TEI {
            return Err(Error::msg(format!(
                "not a management address: {:?}",
                packet.addr
            )));
        }
        let PacketType::Ui(ui) = packet.packet_type else {
            return Err(Error::msg("management frame is not UI"));
        };
        let p = &ui.payload;
        if p.len() < 5 {
            return Err(Error::msg(format!("short management message {p:02x?}")));
        }
        if p[0] != MANAGEMENT_ENTITY {
            return Err(Error::msg(format!("unknown management entity {:02x}", p[0])));
        }
        let kind = MessageType::from_u8(p[3])
            .ok_or_else(|| Error::msg(format!("unknown TEI message type {}", p[3])))?;
        if p[4] & 1 == 0 {
            return Err(Error::msg("extension bit clear in action indicator"));
        }
        Ok(Self {
            ri: u16::from_be_bytes([p[1], p[2]]),
            kind,
            ai: p[4] >> 1,
        })
    }

    /// The complete UI frame. `network` selects the C/R bit of a command
    /// sent by the network side.
    #[must_use]
    pub fn serialize(&self, network: bool) -> Vec<u8> {
        let [hi, lo] = self.ri.to_be_bytes();
        Packet {
            addr: Addr {
                sapi: TEI_SAPI,
                tei: GROUP_TEI,
            },
            cr: network,
            packet_type: PacketType::Ui(Ui {
                poll: false,
                payload: vec![MANAGEMENT_ENTITY, hi, lo, self.kind as u8, (self.ai << 1) | 1],
            }),
        }
        .serialize(Format::LAPD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeiState {
    Idle,
    AwaitingAssignment,
    AwaitingVerification,
}

impl Symbol for TeiState {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeiEvent {
    RequestIdentity,
    Assigned,
    Denied,
    CheckRequested,
    RemoveRequested,
    VerifyRequested,
    RetryTimeout,
}

impl Symbol for TeiEvent {
    fn index(self) -> usize {
        self as usize
    }
}

/// Handlers of the TEI management table.
#[derive(Debug, Clone, Copy)]
pub enum Handler {
    Request,
    RequestTimeout,
    Assign,
    Deny,
    TestDuplicate,
    Check,
    Remove,
    Verify,
    VerifyTimeout,
}

#[derive(Debug)]
pub enum TeiArg {
    None,
    Message(TeiMessage),
    /// ID assigned, with whichever local link already holds that TEI.
    Assigned(TeiMessage, TeiHolder),
}

/// Local owner of the TEI in an ID assigned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeiHolder {
    /// No local link has it.
    Free,
    /// Obtained from the network under this Ri.
    Assigned(u16),
    /// Configured by hand on another link.
    Fixed,
}

/// What the link has to do on behalf of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeiAction {
    /// Management frame for the physical layer.
    Send(Vec<u8>),
    /// MDL-ASSIGN.
    Assign(u8),
    /// MDL-REMOVE.
    Remove,
    /// MDL-ERROR response: no TEI could be obtained.
    Failed,
    /// An assignment for a TEI some local link already holds.
    Duplicate(u8),
}

fn definition() -> &'static FsmDefinition<TeiState, TeiEvent, Handler> {
    static DEF: OnceLock<FsmDefinition<TeiState, TeiEvent, Handler>> = OnceLock::new();
    DEF.get_or_init(|| {
        use Handler as H;
        use TeiEvent as E;
        use TeiState as S;
        FsmDefinition::build(
            "tei",
            3,
            7,
            &[
                (S::Idle, E::RequestIdentity, H::Request),
                (S::Idle, E::Assigned, H::TestDuplicate),
                (S::Idle, E::VerifyRequested, H::Verify),
                (S::Idle, E::RemoveRequested, H::Remove),
                (S::Idle, E::CheckRequested, H::Check),
                (S::AwaitingAssignment, E::RetryTimeout, H::RequestTimeout),
                (S::AwaitingAssignment, E::Assigned, H::Assign),
                (S::AwaitingAssignment, E::Denied, H::Deny),
                (S::AwaitingVerification, E::RetryTimeout, H::VerifyTimeout),
                (S::AwaitingVerification, E::RemoveRequested, H::Remove),
                (S::AwaitingVerification, E::CheckRequested, H::Check),
                (S::AwaitingVerification, E::Assigned, H::TestDuplicate),
            ],
        )
    })
}

pub struct TeiManager {
    fsm: FsmInstance<TeiState>,
    ri: u16,
    nval: u8,
    timer: Timer<TeiEvent>,
    t202: Duration,
    n202: u8,
    n202_verify: u8,
    network: bool,
    rng: StdRng,

    // Context of the event being handled.
    link_tei: Option<u8>,
    now: Instant,
    actions: Vec<TeiAction>,
}

impl TeiManager {
    #[must_use]
    pub fn new(config: &Config, now: Instant) -> Self {
        let mut fsm = FsmInstance::new(format!("tei sapi {}", config.sapi), TeiState::Idle);
        fsm.set_debug(config.debug);
        Self {
            fsm,
            ri: 0,
            nval: 0,
            timer: Timer::new("T202"),
            t202: config.t202,
            n202: config.n202,
            n202_verify: config.n202_verify,
            network: config.role == Role::Network,
            rng: StdRng::from_entropy(),
            link_tei: None,
            now,
            actions: Vec::new(),
        }
    }

    /// Make reference numbers reproducible.
    pub fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    #[must_use]
    pub fn state(&self) -> TeiState {
        self.fsm.state()
    }

    /// Most recent reference number.
    #[must_use]
    pub fn ri(&self) -> u16 {
        self.ri
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Abandon any procedure in progress.
    pub fn reset(&mut self) {
        if self.timer.disarm() {
            debug!("TEI: T202 stopped");
        }
        if self.fsm.state() != TeiState::Idle {
            self.fsm.change_state(TeiState::Idle);
        }
    }

    /// Run one event. `link_tei` is the TEI the link currently holds.
    pub fn handle(
        &mut self,
        event: TeiEvent,
        arg: TeiArg,
        link_tei: Option<u8>,
        now: Instant,
    ) -> Vec<TeiAction> {
        self.link_tei = link_tei;
        self.now = now;
        definition().dispatch(self, event, arg);
        std::mem::take(&mut self.actions)
    }

    /// Fire T202 if it is due.
    pub fn poll_timer(&mut self, now: Instant, link_tei: Option<u8>) -> Vec<TeiAction> {
        match self.timer.fire(now) {
            Some(event) => self.handle(event, TeiArg::None, link_tei, now),
            None => Vec::new(),
        }
    }

    fn send(&mut self, kind: MessageType, ri: u16, ai: u8) {
        let msg = TeiMessage { ri, kind, ai };
        debug!("TEI: sending {msg:?}");
        self.actions.push(TeiAction::Send(msg.serialize(self.network)));
    }

    fn arm(&mut self, event: TeiEvent) {
        if let Err(e) = self.timer.arm(self.now, self.t202, event) {
            warn!("TEI: {e}");
        }
    }

    fn new_ri(&mut self) -> u16 {
        self.ri = self.rng.gen();
        self.ri
    }

    fn request(&mut self) {
        if let Some(tei) = self.link_tei {
            debug!("TEI: identity request with TEI {tei} already assigned");
            return;
        }
        let ri = self.new_ri();
        self.send(MessageType::IdRequest, ri, GROUP_TEI);
        self.nval = self.n202;
        self.arm(TeiEvent::RetryTimeout);
        self.fsm.change_state(TeiState::AwaitingAssignment);
    }

    fn request_timeout(&mut self) {
        self.nval -= 1;
        if self.nval > 0 {
            let ri = self.new_ri();
            debug!("TEI: assign request for Ri {ri} retry {}", self.nval);
            self.send(MessageType::IdRequest, ri, GROUP_TEI);
            self.arm(TeiEvent::RetryTimeout);
        } else {
            warn!("TEI: assign request failed");
            self.actions.push(TeiAction::Failed);
            self.fsm.change_state(TeiState::Idle);
        }
    }

    /// Returns true if the assignment is for a TEI another local link holds.
    fn duplicate(&mut self, msg: &TeiMessage, holder: TeiHolder) -> bool {
        match holder {
            TeiHolder::Assigned(ri) if ri != msg.ri => {
                warn!(
                    "TEI: duplicate assignment of TEI {} (Ri {} vs held by Ri {ri})",
                    msg.ai, msg.ri
                );
            }
            TeiHolder::Fixed => {
                warn!(
                    "TEI: duplicate assignment of fixed TEI {} (Ri {})",
                    msg.ai, msg.ri
                );
            }
            _ => return false,
        }
        self.actions.push(TeiAction::Duplicate(msg.ai));
        true
    }

    fn assign(&mut self, arg: TeiArg) {
        let TeiArg::Assigned(msg, holder) = arg else {
            return;
        };
        if self.duplicate(&msg, holder) {
            return;
        }
        if msg.ri != self.ri {
            return;
        }
        self.timer.disarm();
        self.fsm.change_state(TeiState::Idle);
        debug!("TEI: assigned TEI {} for Ri {}", msg.ai, msg.ri);
        self.actions.push(TeiAction::Assign(msg.ai));
    }

    fn test_duplicate(&mut self, arg: TeiArg) {
        if let TeiArg::Assigned(msg, holder) = arg {
            self.duplicate(&msg, holder);
        }
    }

    fn deny(&mut self, arg: TeiArg) {
        let TeiArg::Message(msg) = arg else {
            return;
        };
        if msg.ri != self.ri {
            return;
        }
        warn!("TEI: identity denied for Ri {}", msg.ri);
        self.timer.disarm();
        self.fsm.change_state(TeiState::Idle);
        self.actions.push(TeiAction::Failed);
    }

    /// Whether a message with this action indicator is about our TEI.
    fn addressed(&self, ai: u8) -> Option<u8> {
        self.link_tei.filter(|&tei| ai == GROUP_TEI || ai == tei)
    }

    fn check(&mut self, arg: TeiArg) {
        let TeiArg::Message(msg) = arg else {
            return;
        };
        let Some(tei) = self.addressed(msg.ai) else {
            return;
        };
        self.timer.disarm();
        self.fsm.change_state(TeiState::Idle);
        let ri = self.rng.gen();
        self.send(MessageType::IdCheckResponse, ri, tei);
    }

    fn remove(&mut self, arg: TeiArg) {
        let TeiArg::Message(msg) = arg else {
            return;
        };
        let Some(tei) = self.addressed(msg.ai) else {
            return;
        };
        warn!("TEI: removal of TEI {tei}");
        self.timer.disarm();
        self.fsm.change_state(TeiState::Idle);
        self.actions.push(TeiAction::Remove);
    }

    fn verify(&mut self) {
        let Some(tei) = self.link_tei else {
            return;
        };
        self.send(MessageType::IdVerify, 0, tei);
        self.nval = self.n202_verify;
        self.arm(TeiEvent::RetryTimeout);
        self.fsm.change_state(TeiState::AwaitingVerification);
    }

    fn verify_timeout(&mut self) {
        self.nval -= 1;
        match self.link_tei {
            Some(tei) if self.nval > 0 => {
                debug!("TEI: verify of TEI {tei} retry {}", self.nval);
                self.send(MessageType::IdVerify, 0, tei);
                self.arm(TeiEvent::RetryTimeout);
            }
            _ => {
                warn!("TEI: verify failed");
                self.fsm.change_state(TeiState::Idle);
                self.actions.push(TeiAction::Remove);
            }
        }
    }
}

impl Machine for TeiManager {
    type State = TeiState;
    type Event = TeiEvent;
    type Handler = Handler;
    type Arg = TeiArg;

    fn fsm(&self) -> &FsmInstance<TeiState> {
        &self.fsm
    }

    fn call(&mut self, handler: Handler, _event: TeiEvent, arg: TeiArg) {
        match handler {
            Handler::Request => self.request(),
            Handler::RequestTimeout => self.request_timeout(),
            Handler::Assign => self.assign(arg),
            Handler::Deny => self.deny(arg),
            Handler::TestDuplicate => self.test_duplicate(arg),
            Handler::Check => self.check(arg),
            Handler::Remove => self.remove(arg),
            Handler::Verify => self.verify(),
            Handler::VerifyTimeout => self.verify_timeout(),
        }
    }
}
