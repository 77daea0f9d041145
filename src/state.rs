//! The layer 2 link: Q.921 data link procedures for one SAPI/TEI.
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::Result;
use log::{debug, warn};

use crate::config::{Config, PollFailure, Role};
use crate::fsm::{FsmDefinition, FsmInstance, Machine, Symbol, Timer};
use crate::tei::{MessageType, TeiAction, TeiArg, TeiEvent, TeiHolder, TeiManager, TeiMessage};
use crate::window::{seq_dec, seq_inc, seq_sub, Info, Window};
use crate::{
    Addr, Disc, Dm, Format, FrameError, Iframe, Packet, PacketType, Rej, Rnr, Rr, Sabm, Sabme,
    Ua, Ui, GROUP_TEI,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unassigned,
    AssignPending,
    AwaitTei,
    Disconnected,
    AwaitEstablish,
    AwaitDisconnect,
    DataTransferReady,
    AwaitAck,
}

impl Symbol for State {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Ui,
    Sabme,
    Disc,
    Dm,
    Ua,
    Frmr,
    Supervisory,
    Iframe,
    DlData,
    AckPull,
    DlUnitData,
    DlEstablish,
    DlRelease,
    MdlAssign,
    MdlRemove,
    MdlError,
    PhDeactivate,
    T200,
    T203,
    SetOwnBusy,
    ClearOwnBusy,
    FrameError,
}

impl Symbol for Event {
    fn index(self) -> usize {
        self as usize
    }
}

const STATES: usize = 8;
const EVENTS: usize = 22;

/// Management error codes, as in Q.921 appendix II.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MdlError {
    /// Supervisory response with F=1 that nobody asked for.
    A,
    /// Unsolicited DM with F=1.
    B,
    /// Unsolicited UA with F=1.
    C,
    /// Unsolicited UA with F=0.
    D,
    /// DM with F=0 while established.
    E,
    /// Peer re-established the link.
    F,
    /// SABM(E) retries exhausted.
    G,
    /// DISC retries exhausted.
    H,
    /// Status enquiry retries exhausted.
    I,
    /// N(R) error.
    J,
    /// FRMR received.
    K,
    /// Unimplemented or misdirected control field.
    L,
    /// Information field not permitted.
    M,
    /// Wrong frame length.
    N,
    /// Information field longer than N201.
    O,
}

impl std::fmt::Display for MdlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Indications and confirmations for the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dl {
    EstablishIndication,
    EstablishConfirm,
    ReleaseIndication,
    ReleaseConfirm,
    Data(Vec<u8>),
    UnitData(Vec<u8>),
    /// An acknowledged I frame with this many octets left the window.
    BufferFreed(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnEvent {
    /// PH-DATA.request. The driver calls [`Link::ph_pull_confirm`] once the
    /// frame is out.
    Frame(Vec<u8>),
    Dl(Dl),
    MdlError(MdlError),
    PhActivateRequest,
    PhDeactivateRequest,
    /// An assignment was seen for a TEI a local link holds.
    TeiConflict(u8),
}

#[derive(Debug)]
pub enum Arg {
    None,
    Packet(Packet),
    Info(Info),
    Unit(Vec<u8>),
    Tei(u8),
    Error(MdlError),
}

/// Handlers of the layer 2 table, named after what they do.
#[derive(Debug, Clone, Copy)]
pub enum Handler {
    RequestTei,
    GoAwaitTei,
    QueueUiAssign,
    QueueUi,
    SendUi,
    GotUi,
    GotTei,
    TeiRemoveUnassigned,
    TeiRemoveAwaitTei,
    TeiRemoveAwaitEstablish,
    TeiRemoveAwaitDisconnect,
    TeiRemoveEstablished,
    Establish,
    DiscardISetL3,
    Reestablish,
    Release,
    PendRelease,
    Disconnect,
    FeedIfReestablish,
    FeedAndPull,
    Feed,
    StartMulti,
    RestartMulti,
    StopMulti,
    SendUa,
    SendDm,
    Connected,
    Released,
    ErrorUa,
    DmReestablish,
    DmReleaseAwaitEstablish,
    DmReleaseAwaitDisconnect,
    ErrorDm,
    ErrorDmRecovery,
    GotFrmr,
    SuperReady,
    SuperRecovery,
    GotIframe,
    PullIqueue,
    T200AwaitEstablish,
    T200AwaitDisconnect,
    T200Ready,
    T203Ready,
    T200Recovery,
    SetOwnBusy,
    ClearOwnBusy,
    FrameError,
    FrameErrorReestablish,
    DeactivateIdle,
    DeactivateAwaitEstablish,
    DeactivateAwaitDisconnect,
    DeactivateEstablished,
}

fn definition() -> &'static FsmDefinition<State, Event, Handler> {
    static DEF: OnceLock<FsmDefinition<State, Event, Handler>> = OnceLock::new();
    DEF.get_or_init(|| {
        use Event as E;
        use Handler as H;
        use State as S;
        let mut list = vec![
            (S::Unassigned, E::DlEstablish, H::RequestTei),
            (S::Unassigned, E::DlUnitData, H::QueueUiAssign),
            (S::Unassigned, E::MdlAssign, H::GotTei),
            (S::Unassigned, E::PhDeactivate, H::DeactivateIdle),
            (S::AssignPending, E::DlEstablish, H::GoAwaitTei),
            (S::AssignPending, E::DlUnitData, H::QueueUi),
            (S::AssignPending, E::MdlAssign, H::GotTei),
            (S::AssignPending, E::MdlError, H::TeiRemoveUnassigned),
            (S::AssignPending, E::MdlRemove, H::TeiRemoveUnassigned),
            (S::AssignPending, E::PhDeactivate, H::TeiRemoveUnassigned),
            (S::AwaitTei, E::DlUnitData, H::QueueUi),
            (S::AwaitTei, E::MdlAssign, H::GotTei),
            (S::AwaitTei, E::MdlError, H::TeiRemoveAwaitTei),
            (S::AwaitTei, E::MdlRemove, H::TeiRemoveAwaitTei),
            (S::AwaitTei, E::PhDeactivate, H::TeiRemoveAwaitTei),
            (S::Disconnected, E::DlEstablish, H::Establish),
            (S::Disconnected, E::DlRelease, H::Release),
            (S::Disconnected, E::MdlRemove, H::TeiRemoveUnassigned),
            (S::Disconnected, E::Sabme, H::StartMulti),
            (S::Disconnected, E::Disc, H::SendDm),
            (S::Disconnected, E::Dm, H::DmReestablish),
            (S::Disconnected, E::Ua, H::ErrorUa),
            (S::Disconnected, E::PhDeactivate, H::DeactivateIdle),
            (S::AwaitEstablish, E::DlEstablish, H::DiscardISetL3),
            (S::AwaitEstablish, E::DlRelease, H::PendRelease),
            (S::AwaitEstablish, E::DlData, H::FeedIfReestablish),
            (S::AwaitEstablish, E::MdlRemove, H::TeiRemoveAwaitEstablish),
            (S::AwaitEstablish, E::Sabme, H::SendUa),
            (S::AwaitEstablish, E::Disc, H::SendDm),
            (S::AwaitEstablish, E::Ua, H::Connected),
            (S::AwaitEstablish, E::Dm, H::DmReleaseAwaitEstablish),
            (S::AwaitEstablish, E::T200, H::T200AwaitEstablish),
            (S::AwaitEstablish, E::PhDeactivate, H::DeactivateAwaitEstablish),
            (S::AwaitDisconnect, E::MdlRemove, H::TeiRemoveAwaitDisconnect),
            (S::AwaitDisconnect, E::Sabme, H::SendDm),
            (S::AwaitDisconnect, E::Disc, H::SendUa),
            (S::AwaitDisconnect, E::Ua, H::Released),
            (S::AwaitDisconnect, E::Dm, H::DmReleaseAwaitDisconnect),
            (S::AwaitDisconnect, E::T200, H::T200AwaitDisconnect),
            (S::AwaitDisconnect, E::PhDeactivate, H::DeactivateAwaitDisconnect),
            (S::DataTransferReady, E::DlData, H::FeedAndPull),
            (S::DataTransferReady, E::Dm, H::ErrorDm),
            (S::DataTransferReady, E::Supervisory, H::SuperReady),
            (S::DataTransferReady, E::AckPull, H::PullIqueue),
            (S::DataTransferReady, E::T200, H::T200Ready),
            (S::DataTransferReady, E::T203, H::T203Ready),
            (S::AwaitAck, E::DlData, H::Feed),
            (S::AwaitAck, E::Dm, H::ErrorDmRecovery),
            (S::AwaitAck, E::Supervisory, H::SuperRecovery),
            (S::AwaitAck, E::T200, H::T200Recovery),
        ];
        // Shared by every state.
        for s in [
            S::Unassigned,
            S::AssignPending,
            S::AwaitTei,
            S::Disconnected,
            S::AwaitEstablish,
            S::AwaitDisconnect,
            S::DataTransferReady,
            S::AwaitAck,
        ] {
            list.push((s, E::Ui, H::GotUi));
        }
        for s in [S::Disconnected, S::AwaitEstablish, S::AwaitDisconnect] {
            list.push((s, E::DlUnitData, H::SendUi));
            list.push((s, E::FrameError, H::FrameError));
        }
        // Both established states.
        for s in [S::DataTransferReady, S::AwaitAck] {
            list.extend([
                (s, E::DlEstablish, H::Reestablish),
                (s, E::DlRelease, H::Disconnect),
                (s, E::DlUnitData, H::SendUi),
                (s, E::MdlRemove, H::TeiRemoveEstablished),
                (s, E::Sabme, H::RestartMulti),
                (s, E::Disc, H::StopMulti),
                (s, E::Ua, H::ErrorUa),
                (s, E::Frmr, H::GotFrmr),
                (s, E::Iframe, H::GotIframe),
                (s, E::SetOwnBusy, H::SetOwnBusy),
                (s, E::ClearOwnBusy, H::ClearOwnBusy),
                (s, E::FrameError, H::FrameErrorReestablish),
                (s, E::PhDeactivate, H::DeactivateEstablished),
            ]);
        }
        FsmDefinition::build("l2", STATES, EVENTS, &list)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Super {
    Rr,
    Rnr,
    Rej,
}

fn supervisory(packet: &Packet) -> Option<(Super, u8, bool)> {
    match &packet.packet_type {
        PacketType::Rr(s) => Some((Super::Rr, s.nr, s.poll)),
        PacketType::Rnr(s) => Some((Super::Rnr, s.nr, s.poll)),
        PacketType::Rej(s) => Some((Super::Rej, s.nr, s.poll)),
        _ => None,
    }
}

fn poll(packet: &Packet) -> bool {
    match &packet.packet_type {
        PacketType::Sabm(s) => s.poll,
        PacketType::Sabme(s) => s.poll,
        PacketType::Ua(s) => s.poll,
        PacketType::Dm(s) => s.poll,
        PacketType::Disc(s) => s.poll,
        PacketType::Frmr(s) => s.poll,
        PacketType::Ui(s) => s.poll,
        PacketType::Iframe(s) => s.poll,
        PacketType::Rr(s) => s.poll,
        PacketType::Rnr(s) => s.poll,
        PacketType::Rej(s) => s.poll,
    }
}

/// One data link connection endpoint.
///
/// All methods taking `now` run to completion and return what the link wants
/// done: frames to send, indications for layer 3, management errors.
pub struct Link {
    fsm: FsmInstance<State>,
    config: Config,
    format: Format,
    tei: Option<u8>,
    tm: Option<TeiManager>,

    vs: u8,
    va: u8,
    vr: u8,
    rc: u8,
    window: Window,
    i_queue: VecDeque<Info>,
    ui_queue: VecDeque<Vec<u8>>,
    down_queue: VecDeque<Vec<u8>>,
    t200: Timer<Event>,
    t203: Timer<Event>,

    peer_busy: bool,
    own_busy: bool,
    reject_exception: bool,
    ack_pending: bool,
    l3_initiated: bool,
    pending_release: bool,
    l1_active: bool,
    l1_busy: bool,
    establish_pending: bool,

    now: Instant,
    out: Vec<ReturnEvent>,
}

impl Link {
    pub fn new(config: Config, now: Instant) -> Result<Self> {
        config.validate()?;
        let tei = config.static_tei();
        let (initial, tm) = match tei {
            Some(_) => (State::Disconnected, None),
            None => (State::Unassigned, Some(TeiManager::new(&config, now))),
        };
        let mut fsm = FsmInstance::new(format!("l2 sapi {}", config.sapi), initial);
        fsm.set_debug(config.debug);
        Ok(Self {
            fsm,
            format: config.format(),
            tei,
            tm,
            vs: 0,
            va: 0,
            vr: 0,
            rc: 0,
            window: Window::new(config.window),
            i_queue: VecDeque::new(),
            ui_queue: VecDeque::new(),
            down_queue: VecDeque::new(),
            t200: Timer::new("T200"),
            t203: Timer::new("T203"),
            peer_busy: false,
            own_busy: false,
            reject_exception: false,
            ack_pending: false,
            l3_initiated: false,
            pending_release: false,
            // The physical layer is taken to be up until told otherwise.
            l1_active: true,
            l1_busy: false,
            establish_pending: false,
            now,
            out: Vec::new(),
            config,
        })
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.fsm.state()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn tei(&self) -> Option<u8> {
        self.tei
    }

    /// How this link came by its TEI, as seen by other links.
    #[must_use]
    pub fn tei_holder(&self) -> TeiHolder {
        match (self.tei, self.tm.as_ref()) {
            (None, _) => TeiHolder::Free,
            (Some(_), Some(tm)) => TeiHolder::Assigned(tm.ri()),
            (Some(_), None) => TeiHolder::Fixed,
        }
    }

    /// Seed the random source for TEI reference numbers.
    pub fn seed_tei(&mut self, seed: u64) {
        if let Some(tm) = self.tm.as_mut() {
            tm.seed(seed);
        }
    }

    #[must_use]
    pub fn vs(&self) -> u8 {
        self.vs
    }

    #[must_use]
    pub fn va(&self) -> u8 {
        self.va
    }

    #[must_use]
    pub fn vr(&self) -> u8 {
        self.vr
    }

    /// Sent but unacknowledged I frames.
    #[must_use]
    pub fn in_flight(&self) -> u8 {
        seq_sub(self.vs, self.va, self.format.modulus())
    }

    /// I frames waiting for the window to open.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.i_queue.len()
    }

    #[must_use]
    pub fn own_busy(&self) -> bool {
        self.own_busy
    }

    #[must_use]
    pub fn peer_busy(&self) -> bool {
        self.peer_busy
    }

    /// When [`Link::poll_timers`] next has something to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.t200.deadline(),
            self.t203.deadline(),
            self.tm.as_ref().and_then(TeiManager::deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn run(&mut self, now: Instant, f: impl FnOnce(&mut Self)) -> Vec<ReturnEvent> {
        self.now = now;
        f(self);
        std::mem::take(&mut self.out)
    }

    fn event(&mut self, event: Event, arg: Arg) -> bool {
        definition().dispatch(self, event, arg)
    }

    pub fn dl_establish_request(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            if l.l1_active {
                l.event(Event::DlEstablish, Arg::None);
            } else {
                l.establish_pending = true;
                l.out.push(ReturnEvent::PhActivateRequest);
            }
        })
    }

    pub fn dl_release_request(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            l.event(Event::DlRelease, Arg::None);
        })
    }

    pub fn dl_data_request(&mut self, info: Info, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            if info.payload.len() > l.config.n201 {
                warn!(
                    "DL-DATA of {} octets exceeds N201 {}, dropped",
                    info.payload.len(),
                    l.config.n201
                );
                return;
            }
            l.event(Event::DlData, Arg::Info(info));
        })
    }

    pub fn dl_unit_data_request(&mut self, payload: Vec<u8>, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            l.event(Event::DlUnitData, Arg::Unit(payload));
        })
    }

    /// Assign a TEI by hand.
    pub fn mdl_assign_request(&mut self, tei: u8, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            l.event(Event::MdlAssign, Arg::Tei(tei));
        })
    }

    pub fn mdl_remove_request(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            l.event(Event::MdlRemove, Arg::None);
        })
    }

    /// Local receiver busy condition.
    pub fn set_own_busy(&mut self, busy: bool, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            let event = if busy {
                Event::SetOwnBusy
            } else {
                Event::ClearOwnBusy
            };
            l.event(event, Arg::None);
        })
    }

    /// PH-DATA.indication.
    pub fn frame_received(&mut self, bytes: &[u8], now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| l.receive(bytes))
    }

    /// A TEI management message. `holder` is the local link that holds the
    /// TEI in an assignment, if any.
    pub fn tei_message(
        &mut self,
        msg: TeiMessage,
        holder: TeiHolder,
        now: Instant,
    ) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            let (event, arg) = match msg.kind {
                MessageType::IdAssigned => (TeiEvent::Assigned, TeiArg::Assigned(msg, holder)),
                MessageType::IdDenied => (TeiEvent::Denied, TeiArg::Message(msg)),
                MessageType::IdCheckRequest => (TeiEvent::CheckRequested, TeiArg::Message(msg)),
                MessageType::IdRemove => (TeiEvent::RemoveRequested, TeiArg::Message(msg)),
                _ => {
                    debug!("ignoring TEI message {msg:?}");
                    return;
                }
            };
            l.tei_event(event, arg);
        })
    }

    /// Another link was assigned the TEI we hold.
    pub fn tei_conflict(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            if l.tm.is_none() {
                warn!("fixed TEI {:?} assigned to another link", l.tei);
                return;
            }
            warn!("TEI {:?} claimed by another link, verifying", l.tei);
            l.tei_event(TeiEvent::VerifyRequested, TeiArg::None);
        })
    }

    /// Fire every timer that is due, earliest first.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, Self::fire_timers)
    }

    pub fn ph_activate_indication(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            l.l1_active = true;
            if l.establish_pending {
                l.establish_pending = false;
                l.event(Event::DlEstablish, Arg::None);
            }
        })
    }

    pub fn ph_deactivate_indication(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            l.l1_active = false;
            l.l1_busy = false;
            l.down_queue.clear();
            l.event(Event::PhDeactivate, Arg::None);
        })
    }

    /// The physical layer is ready for the next frame.
    pub fn ph_pull_confirm(&mut self, now: Instant) -> Vec<ReturnEvent> {
        self.run(now, |l| {
            if let Some(frame) = l.down_queue.pop_front() {
                l.out.push(ReturnEvent::Frame(frame));
                return;
            }
            l.l1_busy = false;
            if l.state() == State::DataTransferReady && !l.i_queue.is_empty() {
                l.event(Event::AckPull, Arg::None);
            }
        })
    }

    fn fire_timers(&mut self) {
        let now = self.now;
        while let Some(deadline) = self.next_deadline().filter(|d| *d <= now) {
            if self.t200.deadline() == Some(deadline) {
                if let Some(event) = self.t200.fire(now) {
                    self.event(event, Arg::None);
                }
            } else if self.t203.deadline() == Some(deadline) {
                if let Some(event) = self.t203.fire(now) {
                    self.event(event, Arg::None);
                }
            } else if let Some(tm) = self.tm.as_mut() {
                let actions = tm.poll_timer(now, self.tei);
                self.apply_tei(actions);
            }
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        let packet = match Packet::parse(bytes, self.format) {
            Ok(p) => p,
            Err(e) => {
                match e.downcast_ref::<FrameError>() {
                    Some(fe) => {
                        warn!("{fe}");
                        let code = fe.code;
                        self.event(Event::FrameError, Arg::Error(code));
                    }
                    None => debug!("dropping frame {bytes:02x?}: {e}"),
                }
                return;
            }
        };
        if !self.format.lapb {
            if packet.addr.sapi != self.config.sapi {
                debug!("frame for SAPI {} dropped", packet.addr.sapi);
                return;
            }
            if packet.addr.tei != GROUP_TEI && Some(packet.addr.tei) != self.tei {
                debug!("frame for TEI {} dropped", packet.addr.tei);
                return;
            }
        }
        match self.classify(&packet) {
            Ok(event) => {
                self.event(event, Arg::Packet(packet));
            }
            Err(code) => {
                warn!("frame error {code} in {:?}", packet.packet_type);
                self.event(Event::FrameError, Arg::Error(code));
            }
        }
    }

    fn classify(&self, packet: &Packet) -> std::result::Result<Event, MdlError> {
        let response = self.is_response(packet);
        let n201 = self.config.n201;
        let ext = self.format.ext;
        let frmr_min = if ext { 5 } else { 3 };
        match &packet.packet_type {
            PacketType::Iframe(_) if response => Err(MdlError::L),
            PacketType::Iframe(i) if i.payload.len() > n201 => Err(MdlError::O),
            PacketType::Iframe(_) => Ok(Event::Iframe),
            PacketType::Rr(_) | PacketType::Rnr(_) | PacketType::Rej(_) => Ok(Event::Supervisory),
            PacketType::Ui(_) if response => Err(MdlError::L),
            PacketType::Ui(u) if u.payload.len() > n201 => Err(MdlError::O),
            PacketType::Ui(_) => Ok(Event::Ui),
            PacketType::Sabm(_) if ext => Err(MdlError::L),
            PacketType::Sabme(_) if !ext => Err(MdlError::L),
            PacketType::Sabm(_) | PacketType::Sabme(_) | PacketType::Disc(_) if response => {
                Err(MdlError::L)
            }
            PacketType::Sabm(_) | PacketType::Sabme(_) => Ok(Event::Sabme),
            PacketType::Disc(_) => Ok(Event::Disc),
            PacketType::Ua(_) | PacketType::Dm(_) | PacketType::Frmr(_) if !response => {
                Err(MdlError::L)
            }
            PacketType::Ua(_) => Ok(Event::Ua),
            PacketType::Dm(_) => Ok(Event::Dm),
            PacketType::Frmr(f) if f.info.len() < frmr_min => Err(MdlError::N),
            PacketType::Frmr(_) => Ok(Event::Frmr),
        }
    }

    /// C/R as received, turned into command/response.
    fn is_response(&self, packet: &Packet) -> bool {
        packet.cr ^ (self.config.role == Role::User)
    }

    /// C/R bit to send for a command or response.
    fn wire_cr(&self, response: bool) -> bool {
        response ^ (self.config.role == Role::Network)
    }

    fn modulus(&self) -> u8 {
        self.format.modulus()
    }

    fn up(&mut self, dl: Dl) {
        self.out.push(ReturnEvent::Dl(dl));
    }

    /// Queue a frame for the physical layer. Only one frame is handed down
    /// until the pull is confirmed.
    fn down(&mut self, frame: Vec<u8>) {
        if self.l1_busy {
            self.down_queue.push_back(frame);
        } else {
            self.l1_busy = true;
            self.out.push(ReturnEvent::Frame(frame));
        }
    }

    fn send(&mut self, response: bool, packet_type: PacketType) {
        let packet = Packet {
            addr: Addr {
                sapi: self.config.sapi,
                tei: self.tei.unwrap_or(GROUP_TEI),
            },
            cr: self.wire_cr(response),
            packet_type,
        };
        debug!("sending {packet:?}");
        let frame = packet.serialize(self.format);
        self.down(frame);
    }

    fn send_sabm(&mut self) {
        let packet_type = if self.format.ext {
            PacketType::Sabme(Sabme { poll: true })
        } else {
            PacketType::Sabm(Sabm { poll: true })
        };
        self.send(false, packet_type);
    }

    fn send_supervisory(&mut self, kind: Super, response: bool, poll: bool) {
        let nr = self.vr;
        let packet_type = match kind {
            Super::Rr => PacketType::Rr(Rr { nr, poll }),
            Super::Rnr => PacketType::Rnr(Rnr { nr, poll }),
            Super::Rej => PacketType::Rej(Rej { nr, poll }),
        };
        self.send(response, packet_type);
    }

    fn receiver_status(&self) -> Super {
        if self.own_busy {
            Super::Rnr
        } else {
            Super::Rr
        }
    }

    fn enquiry_response(&mut self) {
        self.send_supervisory(self.receiver_status(), true, true);
        self.ack_pending = false;
    }

    fn transmit_enquiry(&mut self) {
        self.send_supervisory(self.receiver_status(), false, true);
        self.ack_pending = false;
        self.restart_t200();
    }

    fn restart_t200(&mut self) {
        self.t200.restart(self.now, self.config.t200, Event::T200);
    }

    fn stop_t200(&mut self) {
        self.t200.disarm();
    }

    fn restart_t203(&mut self) {
        self.t203.restart(self.now, self.config.t203, Event::T203);
    }

    fn stop_t203(&mut self) {
        self.t203.disarm();
    }

    fn clear_exception(&mut self) {
        self.peer_busy = false;
        self.own_busy = false;
        self.reject_exception = false;
        self.ack_pending = false;
    }

    fn free_window(&mut self) {
        let n = self.window.clear();
        if n > 0 {
            debug!("dropped {n} unacknowledged frames");
        }
    }

    fn reset_variables(&mut self) {
        self.vs = 0;
        self.va = 0;
        self.vr = 0;
    }

    fn establish_link(&mut self) {
        self.clear_exception();
        self.rc = 0;
        self.send_sabm();
        self.stop_t203();
        self.restart_t200();
        self.pending_release = false;
        self.free_window();
        self.fsm.change_state(State::AwaitEstablish);
    }

    fn can_send(&self) -> bool {
        self.in_flight() < self.config.window && !self.peer_busy
    }

    /// N(R) within [V(A), V(S)].
    fn legal_nr(&self, nr: u8) -> bool {
        let m = self.modulus();
        seq_sub(nr, self.va, m) <= seq_sub(self.vs, self.va, m)
    }

    /// Acknowledge everything up to, not including, `nr`.
    fn advance_ack(&mut self, nr: u8) {
        let m = self.modulus();
        while self.va != nr {
            self.va = seq_inc(self.va, m);
            match self.window.release_oldest() {
                Some(info) if info.notify => self.up(Dl::BufferFreed(info.payload.len())),
                Some(_) => {}
                None => warn!("acknowledged frame missing from window"),
            }
        }
    }

    /// Go back to `nr`: everything sent from there on goes back in front of
    /// the I queue.
    fn invoke_retransmission(&mut self, nr: u8) {
        let m = self.modulus();
        if self.vs == nr {
            return;
        }
        while self.vs != nr {
            self.vs = seq_dec(self.vs, m);
            let offset = self.in_flight();
            match self.window.take(offset) {
                Some(info) => self.i_queue.push_front(info),
                None => warn!("window slot {offset} empty on retransmission"),
            }
        }
        self.event(Event::AckPull, Arg::None);
    }

    fn nr_error_recovery(&mut self) {
        self.mdl_error(MdlError::J);
        self.establish_link();
        self.l3_initiated = false;
    }

    fn mdl_error(&mut self, code: MdlError) {
        warn!("MDL-ERROR {code} in {:?}", self.state());
        self.out.push(ReturnEvent::MdlError(code));
        if matches!(code, MdlError::C | MdlError::D | MdlError::G | MdlError::H)
            && self.config.role == Role::User
            && self.tm.is_some()
        {
            self.tei_event(TeiEvent::VerifyRequested, TeiArg::None);
        }
    }

    fn tei_event(&mut self, event: TeiEvent, arg: TeiArg) {
        let Some(tm) = self.tm.as_mut() else {
            if event == TeiEvent::RequestIdentity {
                if let Some(tei) = self.config.static_tei() {
                    self.event(Event::MdlAssign, Arg::Tei(tei));
                }
            }
            return;
        };
        let actions = tm.handle(event, arg, self.tei, self.now);
        self.apply_tei(actions);
    }

    fn apply_tei(&mut self, actions: Vec<TeiAction>) {
        for action in actions {
            match action {
                // Management frames bypass the down queue.
                TeiAction::Send(frame) => self.out.push(ReturnEvent::Frame(frame)),
                TeiAction::Assign(tei) => {
                    self.event(Event::MdlAssign, Arg::Tei(tei));
                }
                TeiAction::Remove => {
                    self.event(Event::MdlRemove, Arg::None);
                }
                TeiAction::Failed => {
                    self.event(Event::MdlError, Arg::None);
                }
                TeiAction::Duplicate(tei) => self.out.push(ReturnEvent::TeiConflict(tei)),
            }
        }
    }

    fn send_ui(&mut self) {
        while let Some(payload) = self.ui_queue.pop_front() {
            self.send(false, PacketType::Ui(Ui { poll: false, payload }));
        }
    }

    fn release_await_establish(&mut self) {
        if std::mem::take(&mut self.pending_release) {
            self.up(Dl::ReleaseConfirm);
        } else {
            self.up(Dl::ReleaseIndication);
        }
    }

    fn drop_tei(&mut self) {
        debug!("TEI {:?} removed", self.tei);
        self.tei = None;
        self.reset_tei();
    }

    fn reset_tei(&mut self) {
        if let Some(tm) = self.tm.as_mut() {
            tm.reset();
        }
    }

    // Handlers.

    fn got_tei(&mut self, tei: u8) {
        self.tei = Some(tei);
        debug!("got TEI {tei}");
        if self.state() == State::AwaitTei {
            self.establish_link();
            self.l3_initiated = true;
        } else {
            self.fsm.change_state(State::Disconnected);
        }
        if !self.ui_queue.is_empty() {
            self.send_ui();
        }
    }

    fn establish(&mut self) {
        self.establish_link();
        self.l3_initiated = true;
    }

    fn start_multi(&mut self, packet: &Packet) {
        self.send(true, PacketType::Ua(Ua { poll: poll(packet) }));
        self.clear_exception();
        self.reset_variables();
        self.fsm.change_state(State::DataTransferReady);
        self.restart_t203();
        self.up(Dl::EstablishIndication);
    }

    fn restart_multi(&mut self, packet: &Packet) {
        self.send(true, PacketType::Ua(Ua { poll: poll(packet) }));
        self.mdl_error(MdlError::F);
        let outstanding = self.vs != self.va;
        if outstanding {
            self.i_queue.clear();
        }
        self.clear_exception();
        self.reset_variables();
        self.free_window();
        self.fsm.change_state(State::DataTransferReady);
        self.stop_t200();
        self.restart_t203();
        if outstanding {
            self.up(Dl::EstablishIndication);
        }
        if !self.i_queue.is_empty() && self.can_send() {
            self.event(Event::AckPull, Arg::None);
        }
    }

    fn stop_multi(&mut self, packet: &Packet) {
        self.fsm.change_state(State::Disconnected);
        self.stop_t203();
        self.stop_t200();
        self.send(true, PacketType::Ua(Ua { poll: poll(packet) }));
        self.i_queue.clear();
        self.free_window();
        self.up(Dl::ReleaseIndication);
    }

    fn connected(&mut self, packet: &Packet) {
        if !poll(packet) {
            self.error_ua(packet);
            return;
        }
        let indication = if std::mem::take(&mut self.l3_initiated) {
            Some(Dl::EstablishConfirm)
        } else if self.vs != self.va {
            self.i_queue.clear();
            Some(Dl::EstablishIndication)
        } else {
            None
        };
        self.stop_t200();
        self.reset_variables();
        self.fsm.change_state(State::DataTransferReady);
        self.restart_t203();
        if let Some(dl) = indication {
            self.up(dl);
        }
        if std::mem::take(&mut self.pending_release) {
            self.disconnect();
            return;
        }
        if !self.i_queue.is_empty() && self.can_send() {
            self.event(Event::AckPull, Arg::None);
        }
    }

    fn released(&mut self, packet: &Packet) {
        if !poll(packet) {
            self.error_ua(packet);
            return;
        }
        self.stop_t200();
        self.up(Dl::ReleaseConfirm);
        self.fsm.change_state(State::Disconnected);
    }

    fn error_ua(&mut self, packet: &Packet) {
        self.mdl_error(if poll(packet) { MdlError::C } else { MdlError::D });
    }

    fn disconnect(&mut self) {
        self.i_queue.clear();
        self.free_window();
        self.fsm.change_state(State::AwaitDisconnect);
        self.rc = 0;
        self.send(false, PacketType::Disc(Disc { poll: true }));
        self.stop_t203();
        self.restart_t200();
    }

    fn dm_release_await_establish(&mut self, packet: &Packet) {
        if !poll(packet) {
            return;
        }
        self.stop_t200();
        if !self.pending_release {
            self.i_queue.clear();
        }
        self.release_await_establish();
        self.fsm.change_state(State::Disconnected);
        if self.format.lapb {
            self.out.push(ReturnEvent::PhDeactivateRequest);
        }
    }

    fn dm_release_await_disconnect(&mut self, packet: &Packet) {
        if !poll(packet) {
            return;
        }
        self.stop_t200();
        self.up(Dl::ReleaseConfirm);
        self.fsm.change_state(State::Disconnected);
    }

    fn super_ready(&mut self, packet: &Packet) {
        let Some((kind, nr, poll)) = supervisory(packet) else {
            return;
        };
        let response = self.is_response(packet);
        self.peer_busy = kind == Super::Rnr;
        if poll {
            if response {
                self.mdl_error(MdlError::A);
            } else {
                self.enquiry_response();
            }
        }
        if !self.legal_nr(nr) {
            self.nr_error_recovery();
            return;
        }
        match kind {
            Super::Rej => {
                self.advance_ack(nr);
                self.stop_t200();
                self.restart_t203();
                self.invoke_retransmission(nr);
            }
            Super::Rr if nr == self.vs => {
                self.advance_ack(nr);
                self.stop_t200();
                self.restart_t203();
            }
            _ if nr != self.va || kind == Super::Rnr => {
                self.advance_ack(nr);
                if kind == Super::Rnr {
                    self.stop_t203();
                }
                self.restart_t200();
            }
            _ => {}
        }
        if kind == Super::Rr && !self.i_queue.is_empty() {
            self.event(Event::AckPull, Arg::None);
        }
    }

    fn super_recovery(&mut self, packet: &Packet) {
        let Some((kind, nr, poll)) = supervisory(packet) else {
            return;
        };
        let response = self.is_response(packet);
        self.peer_busy = kind == Super::Rnr;
        if response && poll {
            if !self.legal_nr(nr) {
                self.nr_error_recovery();
                return;
            }
            if kind == Super::Rnr {
                self.restart_t200();
            } else {
                self.stop_t200();
                self.restart_t203();
            }
            self.advance_ack(nr);
            self.fsm.change_state(State::DataTransferReady);
            self.invoke_retransmission(nr);
            if !self.i_queue.is_empty() && self.can_send() {
                self.event(Event::AckPull, Arg::None);
            }
            return;
        }
        if !response && poll {
            self.enquiry_response();
        }
        if self.legal_nr(nr) {
            self.advance_ack(nr);
        } else {
            self.nr_error_recovery();
        }
    }

    fn got_iframe(&mut self, iframe: Iframe) {
        let Iframe {
            ns,
            nr,
            poll,
            payload,
        } = iframe;
        if self.own_busy {
            debug!("own receiver busy, discarding I frame {ns}");
            if poll {
                self.enquiry_response();
            }
        } else if ns == self.vr {
            self.vr = seq_inc(self.vr, self.modulus());
            self.reject_exception = false;
            if poll {
                self.enquiry_response();
            } else {
                self.ack_pending = true;
            }
            self.up(Dl::Data(payload));
        } else if self.reject_exception {
            if poll {
                self.enquiry_response();
            }
        } else {
            debug!("N(S) {ns} while expecting {}, rejecting", self.vr);
            self.reject_exception = true;
            self.send_supervisory(Super::Rej, true, poll);
            self.ack_pending = false;
        }

        if !self.legal_nr(nr) {
            self.nr_error_recovery();
            return;
        }
        if !self.peer_busy && self.state() == State::DataTransferReady {
            if nr == self.vs {
                self.stop_t200();
                self.restart_t203();
            } else if nr != self.va {
                self.restart_t200();
            }
        }
        self.advance_ack(nr);

        if !self.i_queue.is_empty() && self.state() == State::DataTransferReady {
            self.event(Event::AckPull, Arg::None);
        }
        if std::mem::take(&mut self.ack_pending) {
            self.send_supervisory(Super::Rr, true, false);
        }
    }

    fn pull_iqueue(&mut self) {
        if !self.can_send() {
            return;
        }
        let Some(info) = self.i_queue.pop_front() else {
            return;
        };
        let packet_type = PacketType::Iframe(Iframe {
            ns: self.vs,
            nr: self.vr,
            poll: false,
            payload: info.payload.clone(),
        });
        let offset = self.in_flight();
        if self.window.put(offset, info).is_some() {
            warn!("window slot for N(S) {} was still in use", self.vs);
        }
        self.vs = seq_inc(self.vs, self.modulus());
        self.ack_pending = false;
        self.send(false, packet_type);
        if !self.t200.is_armed() {
            self.stop_t203();
            self.restart_t200();
        }
    }

    fn t200_await_establish(&mut self) {
        if self.rc == self.config.n200 {
            self.i_queue.clear();
            self.mdl_error(MdlError::G);
            if self.format.lapb {
                self.out.push(ReturnEvent::PhDeactivateRequest);
            }
            self.release_await_establish();
            self.fsm.change_state(State::Disconnected);
        } else {
            self.rc += 1;
            self.restart_t200();
            self.send_sabm();
        }
    }

    fn t200_await_disconnect(&mut self) {
        if self.rc == self.config.n200 {
            self.mdl_error(MdlError::H);
            self.up(Dl::ReleaseConfirm);
            self.fsm.change_state(State::Disconnected);
        } else {
            self.rc += 1;
            self.restart_t200();
            self.send(false, PacketType::Disc(Disc { poll: true }));
        }
    }

    fn t200_ready(&mut self) {
        self.rc = 0;
        self.fsm.change_state(State::AwaitAck);
        self.transmit_enquiry();
        self.rc += 1;
    }

    fn t203_ready(&mut self) {
        self.fsm.change_state(State::AwaitAck);
        self.transmit_enquiry();
        self.rc = 0;
    }

    fn t200_recovery(&mut self) {
        if self.rc < self.config.n200 {
            self.transmit_enquiry();
            self.rc += 1;
            return;
        }
        self.mdl_error(MdlError::I);
        match self.config.poll_failure {
            PollFailure::Reestablish => {
                self.establish_link();
                self.l3_initiated = false;
            }
            PollFailure::Release => {
                self.i_queue.clear();
                self.free_window();
                self.stop_t203();
                self.stop_t200();
                self.fsm.change_state(State::Disconnected);
                self.up(Dl::ReleaseIndication);
            }
        }
    }

    fn deactivate(&mut self, state: State) {
        self.i_queue.clear();
        self.ui_queue.clear();
        self.free_window();
        self.stop_t200();
        self.stop_t203();
        self.reset_tei();
        self.fsm.change_state(state);
    }
}

impl Machine for Link {
    type State = State;
    type Event = Event;
    type Handler = Handler;
    type Arg = Arg;

    fn fsm(&self) -> &FsmInstance<State> {
        &self.fsm
    }

    fn call(&mut self, handler: Handler, _event: Event, arg: Arg) {
        match (handler, arg) {
            (Handler::RequestTei, _) => {
                self.fsm.change_state(State::AwaitTei);
                self.tei_event(TeiEvent::RequestIdentity, TeiArg::None);
            }
            (Handler::GoAwaitTei, _) => self.fsm.change_state(State::AwaitTei),
            (Handler::QueueUiAssign, Arg::Unit(payload)) => {
                self.ui_queue.push_back(payload);
                self.fsm.change_state(State::AssignPending);
                self.tei_event(TeiEvent::RequestIdentity, TeiArg::None);
            }
            (Handler::QueueUi, Arg::Unit(payload)) => self.ui_queue.push_back(payload),
            (Handler::SendUi, Arg::Unit(payload)) => {
                self.ui_queue.push_back(payload);
                self.send_ui();
            }
            (Handler::GotUi, Arg::Packet(p)) => {
                if let PacketType::Ui(ui) = p.packet_type {
                    self.up(Dl::UnitData(ui.payload));
                }
            }
            (Handler::GotTei, Arg::Tei(tei)) => self.got_tei(tei),
            (Handler::TeiRemoveUnassigned, _) => {
                self.ui_queue.clear();
                self.drop_tei();
                self.fsm.change_state(State::Unassigned);
            }
            (Handler::TeiRemoveAwaitTei, _) => {
                self.ui_queue.clear();
                self.drop_tei();
                self.up(Dl::ReleaseIndication);
                self.fsm.change_state(State::Unassigned);
            }
            (Handler::TeiRemoveAwaitEstablish, _) => {
                self.i_queue.clear();
                self.free_window();
                self.drop_tei();
                self.stop_t200();
                self.release_await_establish();
                self.fsm.change_state(State::Unassigned);
            }
            (Handler::TeiRemoveAwaitDisconnect, _) => {
                self.ui_queue.clear();
                self.drop_tei();
                self.stop_t200();
                self.up(Dl::ReleaseConfirm);
                self.fsm.change_state(State::Unassigned);
            }
            (Handler::TeiRemoveEstablished, _) => {
                self.i_queue.clear();
                self.free_window();
                self.drop_tei();
                self.stop_t200();
                self.stop_t203();
                self.up(Dl::ReleaseIndication);
                self.fsm.change_state(State::Unassigned);
            }
            (Handler::Establish, _) => self.establish(),
            (Handler::DiscardISetL3, _) => {
                self.i_queue.clear();
                self.l3_initiated = true;
                self.pending_release = false;
            }
            (Handler::Reestablish, _) => {
                self.i_queue.clear();
                self.establish();
            }
            (Handler::Release, _) => self.up(Dl::ReleaseConfirm),
            (Handler::PendRelease, _) => self.pending_release = true,
            (Handler::Disconnect, _) => self.disconnect(),
            (Handler::FeedIfReestablish, Arg::Info(info)) => {
                if self.l3_initiated {
                    debug!("DL-DATA while establishing on request, dropped");
                } else {
                    self.i_queue.push_back(info);
                }
            }
            (Handler::FeedAndPull, Arg::Info(info)) => {
                self.i_queue.push_back(info);
                self.event(Event::AckPull, Arg::None);
            }
            (Handler::Feed, Arg::Info(info)) => self.i_queue.push_back(info),
            (Handler::StartMulti, Arg::Packet(p)) => self.start_multi(&p),
            (Handler::RestartMulti, Arg::Packet(p)) => self.restart_multi(&p),
            (Handler::StopMulti, Arg::Packet(p)) => self.stop_multi(&p),
            (Handler::SendUa, Arg::Packet(p)) => {
                self.send(true, PacketType::Ua(Ua { poll: poll(&p) }));
            }
            (Handler::SendDm, Arg::Packet(p)) => {
                self.send(true, PacketType::Dm(Dm { poll: poll(&p) }));
            }
            (Handler::Connected, Arg::Packet(p)) => self.connected(&p),
            (Handler::Released, Arg::Packet(p)) => self.released(&p),
            (Handler::ErrorUa, Arg::Packet(p)) => self.error_ua(&p),
            (Handler::DmReestablish, Arg::Packet(p)) => {
                if !poll(&p) {
                    self.establish();
                }
            }
            (Handler::DmReleaseAwaitEstablish, Arg::Packet(p)) => {
                self.dm_release_await_establish(&p);
            }
            (Handler::DmReleaseAwaitDisconnect, Arg::Packet(p)) => {
                self.dm_release_await_disconnect(&p);
            }
            (Handler::ErrorDm, Arg::Packet(p)) => {
                if poll(&p) {
                    self.mdl_error(MdlError::B);
                } else {
                    self.mdl_error(MdlError::E);
                    self.establish_link();
                    self.l3_initiated = false;
                }
            }
            (Handler::ErrorDmRecovery, Arg::Packet(p)) => {
                self.mdl_error(if poll(&p) { MdlError::B } else { MdlError::E });
                self.establish_link();
                self.l3_initiated = false;
            }
            (Handler::GotFrmr, _) => {
                self.mdl_error(MdlError::K);
                self.establish_link();
                self.l3_initiated = false;
            }
            (Handler::SuperReady, Arg::Packet(p)) => self.super_ready(&p),
            (Handler::SuperRecovery, Arg::Packet(p)) => self.super_recovery(&p),
            (Handler::GotIframe, Arg::Packet(p)) => {
                if let PacketType::Iframe(iframe) = p.packet_type {
                    self.got_iframe(iframe);
                }
            }
            (Handler::PullIqueue, _) => self.pull_iqueue(),
            (Handler::T200AwaitEstablish, _) => self.t200_await_establish(),
            (Handler::T200AwaitDisconnect, _) => self.t200_await_disconnect(),
            (Handler::T200Ready, _) => self.t200_ready(),
            (Handler::T203Ready, _) => self.t203_ready(),
            (Handler::T200Recovery, _) => self.t200_recovery(),
            (Handler::SetOwnBusy, _) => {
                if !self.own_busy {
                    self.own_busy = true;
                    self.send_supervisory(Super::Rnr, true, false);
                    self.ack_pending = false;
                }
            }
            (Handler::ClearOwnBusy, _) => {
                if self.own_busy {
                    self.own_busy = false;
                    self.send_supervisory(Super::Rr, true, false);
                    self.ack_pending = false;
                }
            }
            (Handler::FrameError, Arg::Error(code)) => self.mdl_error(code),
            (Handler::FrameErrorReestablish, Arg::Error(code)) => {
                self.mdl_error(code);
                self.establish_link();
                self.l3_initiated = false;
            }
            (Handler::DeactivateIdle, _) => {
                self.i_queue.clear();
                self.ui_queue.clear();
                self.reset_tei();
                if std::mem::take(&mut self.establish_pending) {
                    self.up(Dl::ReleaseIndication);
                }
            }
            (Handler::DeactivateAwaitEstablish, _) => {
                self.deactivate(State::Disconnected);
                self.release_await_establish();
            }
            (Handler::DeactivateAwaitDisconnect, _) => {
                self.deactivate(State::Disconnected);
                self.up(Dl::ReleaseConfirm);
            }
            (Handler::DeactivateEstablished, _) => {
                self.deactivate(State::Disconnected);
                self.up(Dl::ReleaseIndication);
            }
            (handler, arg) => warn!("{handler:?} called with unexpected {arg:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A link plus the network end of the wire.
    struct Harness {
        link: Link,
        now: Instant,
        sent: Vec<Packet>,
        mgmt: Vec<TeiMessage>,
        up: Vec<ReturnEvent>,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let now = Instant::now();
            let mut link = Link::new(config, now).unwrap();
            link.seed_tei(7);
            Self {
                link,
                now,
                sent: Vec::new(),
                mgmt: Vec::new(),
                up: Vec::new(),
            }
        }

        /// LAPD user link with TEI 64 already assigned.
        fn fixed(window: u8) -> Self {
            Self::new(Config::default().with_fixed_tei(64).with_window(window))
        }

        /// Record output, confirming every frame the way a driver would.
        fn apply(&mut self, events: Vec<ReturnEvent>) {
            let mut work: VecDeque<ReturnEvent> = events.into();
            while let Some(ev) = work.pop_front() {
                match ev {
                    ReturnEvent::Frame(f) => {
                        if let Ok(msg) = TeiMessage::parse(&f) {
                            self.mgmt.push(msg);
                        } else {
                            self.sent
                                .push(Packet::parse(&f, self.link.format).unwrap());
                        }
                        work.extend(self.link.ph_pull_confirm(self.now));
                    }
                    other => self.up.push(other),
                }
            }
            let k = self.link.config.window;
            assert!(self.link.in_flight() <= k, "window overrun");
        }

        fn receive(&mut self, cr: bool, packet_type: PacketType) {
            let frame = Packet {
                addr: Addr {
                    sapi: 0,
                    tei: self.link.tei().unwrap_or(GROUP_TEI),
                },
                cr,
                packet_type,
            }
            .serialize(self.link.format);
            let ev = self.link.frame_received(&frame, self.now);
            self.apply(ev);
        }

        /// From the network: commands carry C/R 1.
        fn command(&mut self, packet_type: PacketType) {
            self.receive(true, packet_type);
        }

        fn response(&mut self, packet_type: PacketType) {
            self.receive(false, packet_type);
        }

        fn advance(&mut self, d: Duration) {
            self.now += d;
            let ev = self.link.poll_timers(self.now);
            self.apply(ev);
        }

        fn establish(&mut self) {
            let ev = self.link.dl_establish_request(self.now);
            self.apply(ev);
            self.response(PacketType::Ua(Ua { poll: true }));
            assert_eq!(self.link.state(), State::DataTransferReady);
            self.take_sent();
            self.take_up();
        }

        fn data(&mut self, payload: &[u8]) {
            let ev = self.link.dl_data_request(Info::new(payload.to_vec()), self.now);
            self.apply(ev);
        }

        fn take_sent(&mut self) -> Vec<PacketType> {
            self.sent.drain(..).map(|p| p.packet_type).collect()
        }

        fn take_up(&mut self) -> Vec<ReturnEvent> {
            std::mem::take(&mut self.up)
        }

        fn errors(&self) -> Vec<MdlError> {
            self.up
                .iter()
                .filter_map(|e| match e {
                    ReturnEvent::MdlError(c) => Some(*c),
                    _ => None,
                })
                .collect()
        }
    }

    fn iframe(ns: u8, nr: u8, payload: &[u8]) -> PacketType {
        PacketType::Iframe(Iframe {
            ns,
            nr,
            poll: false,
            payload: payload.to_vec(),
        })
    }

    fn rr(nr: u8, poll: bool) -> PacketType {
        PacketType::Rr(Rr { nr, poll })
    }

    #[test]
    fn table_is_complete() {
        assert_eq!(definition().rejected(), 0);
    }

    #[test]
    fn establish_with_tei_assignment() -> Result<()> {
        let mut h = Harness::new(Config::default());
        assert_eq!(h.link.state(), State::Unassigned);
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::AwaitTei);
        assert_eq!(h.mgmt.len(), 1);
        let req = h.mgmt[0];
        assert_eq!(req.kind, MessageType::IdRequest);

        let assigned = TeiMessage {
            ri: req.ri,
            kind: MessageType::IdAssigned,
            ai: 64,
        };
        let ev = h.link.tei_message(assigned, TeiHolder::Free, h.now);
        h.apply(ev);
        assert_eq!(h.link.tei(), Some(64));
        assert_eq!(h.link.state(), State::AwaitEstablish);
        // Commands from the user side carry C/R 0.
        assert!(!h.sent[0].cr);
        assert_eq!(h.take_sent(), vec![PacketType::Sabme(Sabme { poll: true })]);

        h.response(PacketType::Ua(Ua { poll: true }));
        assert_eq!(h.link.state(), State::DataTransferReady);
        assert_eq!((h.link.vs(), h.link.va(), h.link.vr()), (0, 0, 0));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::EstablishConfirm)]);
        Ok(())
    }

    #[test]
    fn window_of_one_queues() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.data(b"one");
        h.data(b"two");
        h.data(b"three");
        assert_eq!(h.take_sent(), vec![iframe(0, 0, b"one")]);
        assert_eq!(h.link.queued(), 2);
        assert_eq!(h.link.in_flight(), 1);

        h.response(rr(1, false));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::BufferFreed(3))]);
        assert_eq!(h.take_sent(), vec![iframe(1, 0, b"two")]);
        assert_eq!(h.link.queued(), 1);

        // Same acknowledgement again frees nothing.
        h.response(rr(1, false));
        assert!(h.take_up().is_empty());
        assert!(h.take_sent().is_empty());

        h.response(rr(2, false));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::BufferFreed(3))]);
        assert_eq!(h.take_sent(), vec![iframe(2, 0, b"three")]);
        assert_eq!(h.link.queued(), 0);
    }

    #[test]
    fn unconfirmed_data_not_reported() {
        let mut h = Harness::fixed(2);
        h.establish();
        let ev = h.link.dl_data_request(Info::unconfirmed(b"x".to_vec()), h.now);
        h.apply(ev);
        h.response(rr(1, false));
        assert!(h.take_up().is_empty());
        assert_eq!(h.link.va(), 1);
    }

    #[test]
    fn establishment_gives_up() {
        let mut h = Harness::fixed(1);
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        let t200 = h.link.config.t200;
        let n200 = h.link.config.n200;
        for _ in 0..n200 {
            h.advance(t200);
            assert_eq!(h.link.state(), State::AwaitEstablish);
        }
        assert_eq!(h.take_sent().len(), usize::from(n200) + 1);
        h.advance(t200);
        assert_eq!(h.link.state(), State::Disconnected);
        assert_eq!(h.errors(), vec![MdlError::G]);
        assert!(h.up.contains(&ReturnEvent::Dl(Dl::ReleaseIndication)));
        assert_eq!(h.link.next_deadline(), None);
    }

    #[test]
    fn establishment_gives_up_and_verifies_tei() {
        let mut h = Harness::new(Config::default());
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        let assigned = TeiMessage {
            ri: h.mgmt[0].ri,
            kind: MessageType::IdAssigned,
            ai: 70,
        };
        let ev = h.link.tei_message(assigned, TeiHolder::Free, h.now);
        h.apply(ev);
        for _ in 0..=h.link.config.n200 {
            h.advance(h.link.config.t200);
        }
        assert_eq!(h.errors(), vec![MdlError::G]);
        let last = h.mgmt.last().copied();
        assert_eq!(last.map(|m| (m.kind, m.ai)), Some((MessageType::IdVerify, 70)));
    }

    #[test]
    fn out_of_sequence_rejects_once() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.command(iframe(0, 0, b"a"));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::Data(b"a".to_vec()))]);
        assert_eq!(h.take_sent(), vec![rr(1, false)]);

        // Frame 1 lost.
        h.command(iframe(2, 0, b"c"));
        assert_eq!(
            h.take_sent(),
            vec![PacketType::Rej(Rej { nr: 1, poll: false })]
        );
        h.command(iframe(3, 0, b"d"));
        assert!(h.take_sent().is_empty());
        assert!(h.take_up().is_empty());

        // Recovery clears the exception.
        h.command(iframe(1, 0, b"b"));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::Data(b"b".to_vec()))]);
        assert_eq!(h.link.vr(), 2);
        h.command(iframe(3, 0, b"d"));
        assert_eq!(
            h.take_sent(),
            vec![rr(2, false), PacketType::Rej(Rej { nr: 2, poll: false })]
        );
    }

    #[test]
    fn reject_goes_back() {
        let mut h = Harness::fixed(3);
        h.establish();
        h.data(b"0");
        h.data(b"1");
        h.data(b"2");
        assert_eq!(h.take_sent().len(), 3);
        assert_eq!(h.link.vs(), 3);

        h.response(PacketType::Rej(Rej { nr: 1, poll: false }));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::BufferFreed(1))]);
        assert_eq!(h.take_sent(), vec![iframe(1, 0, b"1"), iframe(2, 0, b"2")]);
        assert_eq!((h.link.va(), h.link.vs()), (1, 3));

        h.response(rr(3, false));
        assert_eq!(h.take_up().len(), 2);
        assert_eq!(h.link.in_flight(), 0);
    }

    #[test]
    fn sequence_wraps_modulo_8() {
        let mut h = Harness::new(
            Config::default()
                .with_fixed_tei(64)
                .with_ext(false)
                .with_window(7),
        );
        h.establish();
        let payload = |n: u8| [b'0' + n];
        for n in 0..10 {
            h.data(&payload(n));
        }
        let sent = h.take_sent();
        assert_eq!(sent.len(), 7);
        assert_eq!(sent[6], iframe(6, 0, &payload(6)));
        assert_eq!(h.link.queued(), 3);
        assert_eq!(h.link.in_flight(), 7);

        // Partial ack opens the window across the wrap.
        h.response(rr(4, false));
        assert_eq!(h.take_up().len(), 4);
        assert_eq!(
            h.take_sent(),
            vec![
                iframe(7, 0, &payload(7)),
                iframe(0, 0, &payload(8)),
                iframe(1, 0, &payload(9)),
            ]
        );
        assert_eq!((h.link.va(), h.link.vs()), (4, 2));
        assert_eq!(h.link.in_flight(), 6);

        // Reject from before the wrap: go back over it.
        h.response(PacketType::Rej(Rej { nr: 6, poll: false }));
        assert_eq!(h.take_up().len(), 2);
        assert_eq!(
            h.take_sent(),
            vec![
                iframe(6, 0, &payload(6)),
                iframe(7, 0, &payload(7)),
                iframe(0, 0, &payload(8)),
                iframe(1, 0, &payload(9)),
            ]
        );
        assert_eq!((h.link.va(), h.link.vs()), (6, 2));

        h.response(rr(2, false));
        assert_eq!(h.take_up().len(), 4);
        assert_eq!(h.link.in_flight(), 0);
        assert_eq!(h.link.queued(), 0);
        assert!(h.errors().is_empty());
    }

    #[test]
    fn network_side_command_bit() {
        for config in [Config::default().with_fixed_tei(64), Config::lapb()] {
            let mut h = Harness::new(config.with_role(Role::Network));
            let ev = h.link.dl_establish_request(h.now);
            h.apply(ev);
            assert_eq!(h.sent.len(), 1);
            assert!(h.sent[0].cr);
            // Responses from the user side carry C/R 1 too.
            h.receive(true, PacketType::Ua(Ua { poll: true }));
            assert_eq!(h.link.state(), State::DataTransferReady);
            assert!(h.errors().is_empty());
        }
    }

    #[test]
    fn bad_nr_reestablishes() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.response(rr(5, false));
        assert_eq!(h.errors(), vec![MdlError::J]);
        assert_eq!(h.link.state(), State::AwaitEstablish);
        assert_eq!(h.take_sent(), vec![PacketType::Sabme(Sabme { poll: true })]);
    }

    #[test]
    fn poll_on_idle_link() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.data(b"x");
        h.take_sent();
        // No acknowledgement: T200 puts us in timer recovery.
        h.advance(h.link.config.t200);
        assert_eq!(h.link.state(), State::AwaitAck);
        assert_eq!(h.take_sent(), vec![rr(0, true)]);

        // Peer answers, but lost the frame: retransmit.
        h.response(rr(0, true));
        assert_eq!(h.link.state(), State::DataTransferReady);
        assert_eq!(h.take_sent(), vec![iframe(0, 0, b"x")]);

        h.response(rr(1, false));
        assert_eq!(h.link.in_flight(), 0);

        // Idle: T203 enquires.
        h.advance(h.link.config.t203);
        assert_eq!(h.link.state(), State::AwaitAck);
        assert_eq!(h.take_sent(), vec![rr(0, true)]);
    }

    #[test]
    fn poll_failure_release() {
        let config = Config::default()
            .with_fixed_tei(64)
            .with_poll_failure(PollFailure::Release);
        let mut h = Harness::new(config);
        h.establish();
        let t203 = h.link.config.t203;
        let t200 = h.link.config.t200;
        h.advance(t203);
        for _ in 0..=h.link.config.n200 {
            h.advance(t200);
        }
        assert_eq!(h.errors(), vec![MdlError::I]);
        assert_eq!(h.link.state(), State::Disconnected);
        assert!(h.up.contains(&ReturnEvent::Dl(Dl::ReleaseIndication)));
    }

    #[test]
    fn unsolicited_final_response() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.response(rr(0, true));
        assert_eq!(h.errors(), vec![MdlError::A]);
        assert_eq!(h.link.state(), State::DataTransferReady);
    }

    #[test]
    fn enquiry_answered() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.command(rr(0, true));
        let sent = h.sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, rr(0, true));
        // Responses from the user side carry C/R 1.
        assert!(sent[0].cr);
    }

    #[test]
    fn disconnect() {
        let mut h = Harness::fixed(1);
        h.establish();
        let ev = h.link.dl_release_request(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::AwaitDisconnect);
        assert_eq!(h.take_sent(), vec![PacketType::Disc(Disc { poll: true })]);
        h.response(PacketType::Ua(Ua { poll: true }));
        assert_eq!(h.link.state(), State::Disconnected);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseConfirm)]);
        assert_eq!(h.link.next_deadline(), None);
    }

    #[test]
    fn peer_disconnects() {
        let mut h = Harness::fixed(2);
        h.establish();
        h.data(b"lost");
        h.take_sent();
        h.command(PacketType::Disc(Disc { poll: true }));
        assert_eq!(h.link.state(), State::Disconnected);
        assert_eq!(h.take_sent(), vec![PacketType::Ua(Ua { poll: true })]);
        // No buffer-freed for the discarded frame.
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseIndication)]);
    }

    #[test]
    fn peer_establishes() {
        let mut h = Harness::fixed(1);
        h.command(PacketType::Sabme(Sabme { poll: true }));
        assert_eq!(h.link.state(), State::DataTransferReady);
        assert_eq!(h.take_sent(), vec![PacketType::Ua(Ua { poll: true })]);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::EstablishIndication)]);

        // Again while established.
        h.command(PacketType::Sabme(Sabme { poll: true }));
        assert_eq!(h.errors(), vec![MdlError::F]);
        assert_eq!(h.link.state(), State::DataTransferReady);
    }

    #[test]
    fn frmr_reestablishes() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.response(PacketType::Frmr(crate::Frmr {
            poll: false,
            info: vec![0; 5],
        }));
        assert_eq!(h.errors(), vec![MdlError::K]);
        assert_eq!(h.link.state(), State::AwaitEstablish);
    }

    #[test]
    fn validation_errors() {
        let mut h = Harness::fixed(1);
        h.establish();
        // I frame sent as a response.
        h.response(iframe(0, 0, b"x"));
        assert_eq!(h.errors(), vec![MdlError::L]);
        assert_eq!(h.link.state(), State::AwaitEstablish);

        let mut h = Harness::fixed(1);
        h.establish();
        h.command(iframe(0, 0, &[0; 261]));
        assert_eq!(h.errors(), vec![MdlError::O]);

        // SABM on a modulo 128 link.
        let mut h = Harness::fixed(1);
        h.command(PacketType::Sabm(Sabm { poll: true }));
        assert_eq!(h.errors(), vec![MdlError::L]);
        assert_eq!(h.link.state(), State::Disconnected);
    }

    #[test]
    fn dm_while_established() {
        let mut h = Harness::fixed(1);
        h.establish();
        h.response(PacketType::Dm(Dm { poll: true }));
        assert_eq!(h.errors(), vec![MdlError::B]);
        assert_eq!(h.link.state(), State::DataTransferReady);
        h.take_up();
        h.response(PacketType::Dm(Dm { poll: false }));
        assert_eq!(h.errors(), vec![MdlError::E]);
        assert_eq!(h.link.state(), State::AwaitEstablish);
    }

    #[test]
    fn own_busy() {
        let mut h = Harness::fixed(1);
        h.establish();
        let ev = h.link.set_own_busy(true, h.now);
        h.apply(ev);
        assert_eq!(
            h.take_sent(),
            vec![PacketType::Rnr(Rnr { nr: 0, poll: false })]
        );
        h.command(iframe(0, 0, b"x"));
        assert!(h.take_up().is_empty());
        assert_eq!(h.link.vr(), 0);

        let ev = h.link.set_own_busy(false, h.now);
        h.apply(ev);
        assert_eq!(h.take_sent(), vec![rr(0, false)]);
        assert!(!h.link.own_busy());
    }

    #[test]
    fn peer_busy_holds_frames() {
        let mut h = Harness::fixed(2);
        h.establish();
        h.response(PacketType::Rnr(Rnr { nr: 0, poll: false }));
        assert!(h.link.peer_busy());
        h.data(b"x");
        assert!(h.take_sent().is_empty());
        h.response(rr(0, false));
        assert!(!h.link.peer_busy());
        assert_eq!(h.take_sent(), vec![iframe(0, 0, b"x")]);
    }

    #[test]
    fn unit_data() {
        let mut h = Harness::fixed(1);
        h.command(PacketType::Ui(Ui {
            poll: false,
            payload: b"hi".to_vec(),
        }));
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::UnitData(b"hi".to_vec()))]);
        let ev = h.link.dl_unit_data_request(b"yo".to_vec(), h.now);
        h.apply(ev);
        assert_eq!(
            h.take_sent(),
            vec![PacketType::Ui(Ui {
                poll: false,
                payload: b"yo".to_vec(),
            })]
        );
    }

    #[test]
    fn unit_data_waits_for_tei() {
        let mut h = Harness::new(Config::default());
        let ev = h.link.dl_unit_data_request(b"early".to_vec(), h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::AssignPending);
        assert!(h.take_sent().is_empty());
        let assigned = TeiMessage {
            ri: h.mgmt[0].ri,
            kind: MessageType::IdAssigned,
            ai: 65,
        };
        let ev = h.link.tei_message(assigned, TeiHolder::Free, h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::Disconnected);
        assert_eq!(h.sent.len(), 1);
        assert_eq!(h.sent[0].addr.tei, 65);
    }

    #[test]
    fn tei_removed_while_established() {
        let mut h = Harness::new(Config::default());
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        let ri = h.mgmt[0].ri;
        let assign = TeiMessage {
            ri,
            kind: MessageType::IdAssigned,
            ai: 64,
        };
        let ev = h.link.tei_message(assign, TeiHolder::Free, h.now);
        h.apply(ev);
        h.response(PacketType::Ua(Ua { poll: true }));
        h.take_up();
        let remove = TeiMessage {
            ri: 0,
            kind: MessageType::IdRemove,
            ai: 64,
        };
        let ev = h.link.tei_message(remove, TeiHolder::Free, h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::Unassigned);
        assert_eq!(h.link.tei(), None);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseIndication)]);
        assert_eq!(h.link.next_deadline(), None);
    }

    #[test]
    fn tei_request_fails() {
        let mut h = Harness::new(Config::default());
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        let t202 = h.link.config.t202;
        for _ in 0..3 {
            h.advance(t202);
        }
        assert_eq!(h.mgmt.len(), 3);
        assert_eq!(h.link.state(), State::Unassigned);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseIndication)]);
    }

    #[test]
    fn physical_deactivation() {
        let mut h = Harness::fixed(2);
        h.establish();
        h.data(b"x");
        let ev = h.link.ph_deactivate_indication(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::Disconnected);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseIndication)]);
        assert_eq!(h.link.next_deadline(), None);

        // Establishing now needs layer 1 first.
        let ev = h.link.dl_establish_request(h.now);
        assert_eq!(ev, vec![ReturnEvent::PhActivateRequest]);
        h.take_sent();
        let ev = h.link.ph_activate_indication(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::AwaitEstablish);
        assert_eq!(h.take_sent(), vec![PacketType::Sabme(Sabme { poll: true })]);
    }

    #[test]
    fn deactivated_while_awaiting_tei() {
        let mut h = Harness::new(Config::default());
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::AwaitTei);
        let req = h.mgmt[0];

        let ev = h.link.ph_deactivate_indication(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::Unassigned);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseIndication)]);
        assert_eq!(h.link.next_deadline(), None);

        // No identity requests go out with layer 1 down.
        h.mgmt.clear();
        h.advance(h.link.config.t202 * 4);
        assert!(h.mgmt.is_empty());
        assert!(h.sent.is_empty());

        // A late assignment for the abandoned request is ignored.
        let assigned = TeiMessage {
            ri: req.ri,
            kind: MessageType::IdAssigned,
            ai: 64,
        };
        let ev = h.link.tei_message(assigned, TeiHolder::Free, h.now);
        h.apply(ev);
        assert_eq!(h.link.tei(), None);
        assert_eq!(h.link.state(), State::Unassigned);
        assert!(h.take_up().is_empty());
    }

    #[test]
    fn removed_while_awaiting_tei() {
        let mut h = Harness::new(Config::default());
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        let ev = h.link.mdl_remove_request(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::Unassigned);
        assert_eq!(h.take_up(), vec![ReturnEvent::Dl(Dl::ReleaseIndication)]);
        assert_eq!(h.link.next_deadline(), None);

        // A fresh request starts over.
        h.mgmt.clear();
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::AwaitTei);
        assert_eq!(h.mgmt.len(), 1);
        assert_eq!(h.mgmt[0].kind, MessageType::IdRequest);
    }

    #[test]
    fn one_frame_at_a_time() {
        let now = Instant::now();
        let mut link = Link::new(Config::default().with_fixed_tei(64).with_window(3), now).unwrap();
        let ev = link.dl_establish_request(now);
        assert_eq!(ev.len(), 1);
        let ev = link.ph_pull_confirm(now);
        assert!(ev.is_empty());
        let ua = Packet {
            addr: Addr { sapi: 0, tei: 64 },
            cr: false,
            packet_type: PacketType::Ua(Ua { poll: true }),
        }
        .serialize(Format::LAPD);
        link.frame_received(&ua, now);
        let ev = link.dl_data_request(Info::new(vec![1]), now);
        assert_eq!(ev.len(), 1);
        // Not confirmed: the next frame waits.
        let ev = link.dl_data_request(Info::new(vec![2]), now);
        assert!(ev.is_empty());
        assert_eq!(link.in_flight(), 2);
        let ev = link.ph_pull_confirm(now);
        assert!(matches!(ev.as_slice(), [ReturnEvent::Frame(_)]));
        assert!(link.ph_pull_confirm(now).is_empty());
    }

    #[test]
    fn lapb_link() {
        let mut h = Harness::new(Config::lapb());
        assert_eq!(h.link.state(), State::Disconnected);
        let ev = h.link.dl_establish_request(h.now);
        h.apply(ev);
        assert_eq!(h.sent[0].packet_type, PacketType::Sabm(Sabm { poll: true }));
        // DTE commands go to address B.
        assert!(!h.sent[0].cr);
        let ev = h.link.frame_received(&[0x03, 0x73], h.now);
        h.apply(ev);
        // Address A from the DCE is a command.
        assert_eq!(h.errors(), vec![MdlError::L]);
        let ev = h.link.frame_received(&[0x01, 0x73], h.now);
        h.apply(ev);
        assert_eq!(h.link.state(), State::DataTransferReady);
    }
}
