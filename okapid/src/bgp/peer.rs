use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use bgp_wire::{
    keepalive_packet, notify_pair_valid, peek_bgp_length, Afi, AfiSafis, BgpCap, BgpPacket,
    BgpType, CapAs4, CapMultiProtocol, CapRefresh, CeaseSubcode, FsmSubcode, NotificationPacket,
    NotifyCode, OpenPacket, OpenSubcode, Safi, UpdatePacket, BGP_PACKET_LEN, BGP_PORT,
};

use crate::bgp::route::{PeerId, PeerKind};
use crate::bgp::timer;
use crate::context::{Task, Timer};

use super::inst::Message;

/// Transmit-queue watermarks toward one peer (messages in flight).
pub const OUTPUT_HIGH_WATERMARK: usize = 100;
pub const OUTPUT_LOW_WATERMARK: usize = 10;

/// Oscillation damping: this many restarts inside the window applies the
/// damped idle-hold time before the next start.
const OSCILLATION_RESTARTS: usize = 10;
const OSCILLATION_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    /// Waiting for an in-flight NOTIFICATION to drain.
    Stopped,
}

impl State {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connect => "Connect",
            Self::Active => "Active",
            Self::OpenSent => "OpenSent",
            Self::OpenConfirm => "OpenConfirm",
            Self::Established => "Established",
            Self::Stopped => "Stopped",
        }
    }

    pub fn is_established(&self) -> bool {
        *self == State::Established
    }
}

#[derive(Debug)]
pub enum Event {
    Start,
    Stop,
    ConnRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    IdleHoldTimerExpires,
    DelayOpenTimerExpires,
    DrainTimerExpires,
    Connected(TcpStream),
    ConnFail,
    BGPOpen(OpenPacket),
    NotifMsg(NotificationPacket),
    KeepAliveMsg,
    UpdateMsg(Box<UpdatePacket>),
    /// Accepted-socket collision arbitration finished reading its OPEN.
    CollisionOpen(TcpStream, OpenPacket),
    /// A decode error that must be answered with a NOTIFICATION.
    ProtocolError(NotifyCode, u8, Vec<u8>),
}

pub enum FsmEffect {
    None,
    RouteUpdate(Box<UpdatePacket>),
}

#[derive(Debug, Default)]
pub struct PeerTask {
    pub connect: Option<Task<()>>,
    pub reader: Option<Task<()>>,
    pub writer: Option<Task<()>>,
    pub accept: Option<Task<()>>,
}

#[derive(Debug, Default)]
pub struct PeerTimer {
    pub idle_hold_timer: Option<Timer>,
    pub connect_retry: Option<Timer>,
    pub hold_timer: Option<Timer>,
    pub keepalive: Option<Timer>,
    pub delay_open: Option<Timer>,
    pub drain: Option<Timer>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PeerCounter {
    pub sent: u64,
    pub rcvd: u64,
}

#[derive(Debug, Default, Clone)]
pub struct PeerTransportConfig {
    pub passive: bool,
    pub md5_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub transport: PeerTransportConfig,
    pub four_octet: bool,
    pub mp: AfiSafis<bool>,
    pub route_refresh: bool,
    pub timer: timer::Config,
    pub prefix_limit: Option<u32>,
    pub reflector_client: bool,
    pub confederation: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            transport: Default::default(),
            four_octet: true,
            mp: AfiSafis::new(),
            route_refresh: true,
            timer: Default::default(),
            prefix_limit: None,
            reflector_client: false,
            confederation: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PeerParam {
    pub hold_time: u16,
    pub keepalive: u16,
    pub local_addr: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct Peer {
    pub ident: IpAddr,
    pub id: PeerId,
    pub address: IpAddr,
    pub router_id: Ipv4Addr,
    pub remote_id: Ipv4Addr,
    pub local_as: u32,
    pub peer_as: u32,
    pub enabled: bool,
    pub state: State,
    pub task: PeerTask,
    pub timer: PeerTimer,
    pub counter: [PeerCounter; BgpType::Max as usize],
    /// Both sides advertised the 4-byte-ASN capability. The shared flag
    /// lets the already-running reader switch AS_PATH width when the
    /// negotiation completes.
    pub as4: Arc<AtomicBool>,
    pub param: PeerParam,
    pub param_tx: PeerParam,
    pub param_rx: PeerParam,
    pub packet_tx: Option<UnboundedSender<BytesMut>>,
    pub out_queue: Arc<AtomicUsize>,
    pub tx: mpsc::Sender<Message>,
    pub config: PeerConfig,
    pub cap_send: BgpCap,
    pub cap_recv: BgpCap,
    /// Set after UnsupportedOptionalParameter: the next OPEN omits the
    /// Capabilities parameter entirely (RFC 5492 fallback).
    pub open_without_caps: bool,
    pub restarts: VecDeque<Instant>,
    pub established_transitions: u64,
    pub instant: Option<Instant>,
}

impl Peer {
    pub fn new(
        ident: IpAddr,
        id: PeerId,
        local_as: u32,
        router_id: Ipv4Addr,
        peer_as: u32,
        address: IpAddr,
        tx: mpsc::Sender<Message>,
    ) -> Self {
        let mut peer = Self {
            ident,
            id,
            router_id,
            local_as,
            peer_as,
            address,
            enabled: false,
            state: State::Idle,
            task: PeerTask::default(),
            timer: PeerTimer::default(),
            counter: [PeerCounter::default(); BgpType::Max as usize],
            tx,
            remote_id: Ipv4Addr::UNSPECIFIED,
            config: PeerConfig::default(),
            as4: Arc::new(AtomicBool::new(false)),
            param: PeerParam::default(),
            param_tx: PeerParam::default(),
            param_rx: PeerParam::default(),
            packet_tx: None,
            out_queue: Arc::new(AtomicUsize::new(0)),
            cap_send: BgpCap::default(),
            cap_recv: BgpCap::default(),
            open_without_caps: false,
            restarts: VecDeque::new(),
            established_transitions: 0,
            instant: None,
        };
        let afi_safi = match address {
            IpAddr::V4(_) => bgp_wire::AfiSafi::new(Afi::Ip, Safi::Unicast),
            IpAddr::V6(_) => bgp_wire::AfiSafi::new(Afi::Ip6, Safi::Unicast),
        };
        peer.config.mp.insert(afi_safi, true);
        peer
    }

    pub fn peer_kind(&self) -> PeerKind {
        if self.local_as == self.peer_as {
            PeerKind::Ibgp
        } else if self.config.confederation {
            PeerKind::Confed
        } else {
            PeerKind::Ebgp
        }
    }

    pub fn is_passive(&self) -> bool {
        self.config.transport.passive
    }

    pub fn start(&mut self) {
        if self.peer_as != 0 && !self.address.is_unspecified() && !self.enabled {
            self.enabled = true;
            timer::update_timers(self);
        }
    }

    pub fn count_clear(&mut self) {
        for count in self.counter.iter_mut() {
            count.sent = 0;
            count.rcvd = 0;
        }
    }

    pub fn is_ebgp(&self) -> bool {
        self.peer_kind().is_ebgp()
    }

    pub fn is_ibgp(&self) -> bool {
        self.peer_kind().is_ibgp()
    }

    /// Record a session restart; true when the oscillation threshold is
    /// now exceeded and the next start must be damped.
    pub fn record_restart(&mut self) -> bool {
        let now = Instant::now();
        self.restarts.push_back(now);
        while let Some(first) = self.restarts.front() {
            if now.duration_since(*first) > OSCILLATION_WINDOW {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.oscillation_damped()
    }

    pub fn oscillation_damped(&self) -> bool {
        self.restarts.len() >= OSCILLATION_RESTARTS
    }

    pub fn output_queue_busy(&self) -> bool {
        self.out_queue.load(Ordering::Relaxed) >= OUTPUT_HIGH_WATERMARK
    }
}

/// Compute the next state for an event. Pure apart from packet sends.
pub fn fsm_next_state(peer: &mut Peer, event: Event) -> (State, FsmEffect) {
    match event {
        Event::Start => (fsm_start(peer), FsmEffect::None),
        Event::Stop => (fsm_stop(peer), FsmEffect::None),
        Event::ConnRetryTimerExpires => (fsm_conn_retry_expires(peer), FsmEffect::None),
        Event::HoldTimerExpires => (fsm_holdtimer_expires(peer), FsmEffect::None),
        Event::KeepaliveTimerExpires => (fsm_keepalive_expires(peer), FsmEffect::None),
        Event::IdleHoldTimerExpires => (fsm_idle_hold_timer_expires(peer), FsmEffect::None),
        Event::DelayOpenTimerExpires => (fsm_delay_open_expires(peer), FsmEffect::None),
        Event::DrainTimerExpires => (fsm_drained(peer), FsmEffect::None),
        Event::Connected(stream) => (fsm_connected(peer, stream), FsmEffect::None),
        Event::ConnFail => (fsm_conn_fail(peer), FsmEffect::None),
        Event::BGPOpen(packet) => (fsm_bgp_open(peer, packet), FsmEffect::None),
        Event::NotifMsg(packet) => (fsm_bgp_notification(peer, packet), FsmEffect::None),
        Event::KeepAliveMsg => (fsm_bgp_keepalive(peer), FsmEffect::None),
        Event::UpdateMsg(packet) => fsm_bgp_update(peer, packet),
        Event::CollisionOpen(stream, packet) => (fsm_collision(peer, stream, packet), FsmEffect::None),
        Event::ProtocolError(code, sub_code, data) => {
            peer_send_notification(peer, code, sub_code, data);
            (State::Stopped, FsmEffect::None)
        }
    }
}

pub fn fsm_start(peer: &mut Peer) -> State {
    match peer.state {
        State::Idle => {
            peer.task.connect = Some(peer_start_connection(peer));
            peer.timer.connect_retry = Some(timer::start_connect_retry_timer(peer));
            State::Connect
        }
        state => state,
    }
}

pub fn fsm_stop(peer: &mut Peer) -> State {
    match peer.state {
        State::Stopped => {
            // A second stop skips the drain.
            peer_close_transport(peer);
            State::Idle
        }
        State::Idle => State::Idle,
        _ => {
            if peer.packet_tx.is_some() {
                peer_send_notification(
                    peer,
                    NotifyCode::Cease,
                    CeaseSubcode::AdministrativeShutdown as u8,
                    Vec::new(),
                );
                State::Stopped
            } else {
                State::Idle
            }
        }
    }
}

pub fn fsm_drained(peer: &mut Peer) -> State {
    peer.timer.drain = None;
    peer_close_transport(peer);
    State::Idle
}

pub fn fsm_conn_retry_expires(peer: &mut Peer) -> State {
    match peer.state {
        State::Connect | State::Active => {
            peer.task.connect = Some(peer_start_connection(peer));
            peer.timer.connect_retry = Some(timer::start_connect_retry_timer(peer));
            State::Connect
        }
        state => state,
    }
}

pub fn fsm_holdtimer_expires(peer: &mut Peer) -> State {
    peer_send_notification(peer, NotifyCode::HoldTimerExpired, 0, Vec::new());
    State::Stopped
}

pub fn fsm_idle_hold_timer_expires(peer: &mut Peer) -> State {
    peer.timer.idle_hold_timer = None;
    if !peer.enabled {
        return State::Idle;
    }
    peer.task.connect = Some(peer_start_connection(peer));
    peer.timer.connect_retry = Some(timer::start_connect_retry_timer(peer));
    State::Connect
}

pub fn fsm_delay_open_expires(peer: &mut Peer) -> State {
    peer.timer.delay_open = None;
    if peer.state != State::Connect {
        return peer.state;
    }
    peer_send_open(peer);
    State::OpenSent
}

pub fn fsm_keepalive_expires(peer: &mut Peer) -> State {
    peer_send_keepalive(peer);
    peer.state
}

pub fn fsm_connected(peer: &mut Peer, stream: TcpStream) -> State {
    if let Ok(local_addr) = stream.local_addr() {
        peer.param.local_addr = Some(local_addr);
    }
    peer.task.connect = None;
    peer_attach_stream(peer, stream);

    // DelayOpen: sit in Connect with the reader live and wait either for
    // the timer or for the peer's OPEN.
    if let Some(delay) = peer.config.timer.delay_open_time() {
        peer.timer.delay_open = Some(timer::start_delay_open_timer(peer, delay));
        return State::Connect;
    }
    peer_send_open(peer);
    // Long hold while waiting for the peer's OPEN.
    peer.timer.hold_timer = Some(timer::start_open_hold_timer(peer));
    State::OpenSent
}

pub fn fsm_conn_fail(peer: &mut Peer) -> State {
    match peer.state {
        State::Established | State::OpenSent | State::OpenConfirm => {
            peer_close_transport(peer);
            peer.timer.connect_retry = Some(timer::start_connect_retry_timer(peer));
            State::Active
        }
        State::Connect => {
            peer_close_transport(peer);
            peer.timer.connect_retry = Some(timer::start_connect_retry_timer(peer));
            State::Active
        }
        state => state,
    }
}

/// OPEN validation (RFC 4271 section 6.2): peer AS, BGP identifier,
/// hold time, optional parameters. A failure sends the mapped
/// NOTIFICATION and stops.
fn validate_open(peer: &mut Peer, packet: &OpenPacket) -> Result<(), ()> {
    // Unrecognized optional parameter: refuse, and re-open without the
    // Capabilities parameter next time.
    if let Some(code) = packet.unknown_opt_param {
        peer_send_notification(
            peer,
            NotifyCode::OpenMessageError,
            OpenSubcode::UnsupportedOptionalParameter as u8,
            vec![code],
        );
        peer.open_without_caps = true;
        return Err(());
    }

    let asn = open_asn(packet);
    if peer.peer_as != asn {
        peer_send_notification(
            peer,
            NotifyCode::OpenMessageError,
            OpenSubcode::BadPeerAs as u8,
            Vec::new(),
        );
        return Err(());
    }

    let bgp_id = packet.bgp_id_addr();
    if bgp_id.is_unspecified() || bgp_id.is_multicast() || bgp_id.is_broadcast() {
        peer_send_notification(
            peer,
            NotifyCode::OpenMessageError,
            OpenSubcode::BadBgpIdentifier as u8,
            packet.bgp_id.to_vec(),
        );
        return Err(());
    }

    if packet.hold_time > 0 && packet.hold_time < 3 {
        peer_send_notification(
            peer,
            NotifyCode::OpenMessageError,
            OpenSubcode::UnacceptableHoldTime as u8,
            packet.hold_time.to_be_bytes().to_vec(),
        );
        return Err(());
    }

    Ok(())
}

pub fn open_asn(packet: &OpenPacket) -> u32 {
    if let Some(as4) = &packet.caps.as4 {
        as4.asn
    } else {
        packet.asn as u32
    }
}

pub fn fsm_bgp_open(peer: &mut Peer, packet: OpenPacket) -> State {
    peer.counter[BgpType::Open as usize].rcvd += 1;

    match peer.state {
        State::OpenSent => {}
        State::Connect if peer.timer.delay_open.is_some() => {
            // OPEN while delay-open is running: answer with ours now.
            peer.timer.delay_open = None;
            peer_send_open(peer);
        }
        State::OpenConfirm | State::Established => {
            peer_send_notification(
                peer,
                NotifyCode::FsmError,
                fsm_violation_subcode(peer.state),
                Vec::new(),
            );
            return State::Stopped;
        }
        _ => return peer.state,
    }

    if validate_open(peer, &packet).is_err() {
        return State::Stopped;
    }

    peer.remote_id = packet.bgp_id_addr();
    peer.as4.store(
        peer.config.four_octet && packet.caps.as4.is_some(),
        Ordering::Relaxed,
    );
    timer::update_open_timers(peer, &packet);
    peer.cap_recv = packet.caps;

    peer_send_keepalive(peer);
    State::OpenConfirm
}

fn fsm_violation_subcode(state: State) -> u8 {
    match state {
        State::OpenSent => FsmSubcode::UnexpectedMessageInOpenSent as u8,
        State::OpenConfirm => FsmSubcode::UnexpectedMessageInOpenConfirm as u8,
        _ => FsmSubcode::UnexpectedMessageInEstablished as u8,
    }
}

pub fn fsm_bgp_notification(peer: &mut Peer, packet: NotificationPacket) -> State {
    peer.counter[BgpType::Notification as usize].rcvd += 1;
    tracing::info!("peer {}: NOTIFICATION {}", peer.ident, packet);
    peer_close_transport(peer);
    State::Idle
}

pub fn fsm_bgp_keepalive(peer: &mut Peer) -> State {
    peer.counter[BgpType::Keepalive as usize].rcvd += 1;
    match peer.state {
        State::OpenConfirm => {
            timer::refresh_hold_timer(peer);
            State::Established
        }
        State::Established => {
            timer::refresh_hold_timer(peer);
            State::Established
        }
        State::OpenSent => {
            peer_send_notification(
                peer,
                NotifyCode::FsmError,
                fsm_violation_subcode(peer.state),
                Vec::new(),
            );
            State::Stopped
        }
        state => state,
    }
}

pub fn fsm_bgp_update(peer: &mut Peer, packet: Box<UpdatePacket>) -> (State, FsmEffect) {
    peer.counter[BgpType::Update as usize].rcvd += 1;
    match peer.state {
        State::Established => {
            timer::refresh_hold_timer(peer);
            (State::Established, FsmEffect::RouteUpdate(packet))
        }
        State::OpenSent | State::OpenConfirm => {
            peer_send_notification(
                peer,
                NotifyCode::FsmError,
                fsm_violation_subcode(peer.state),
                Vec::new(),
            );
            (State::Stopped, FsmEffect::None)
        }
        state => (state, FsmEffect::None),
    }
}

/// Connection collision (RFC 4271 section 6.8): an inbound session
/// carried an OPEN while our outbound handshake is in flight. The side
/// with the numerically larger BGP-ID keeps its initiated connection.
pub fn fsm_collision(peer: &mut Peer, stream: TcpStream, packet: OpenPacket) -> State {
    peer.task.accept = None;
    let local_id = peer.router_id;
    let remote_id = packet.bgp_id_addr();

    if u32::from(local_id) > u32::from(remote_id) {
        // We win: our outbound session stands, the inbound one is closed.
        reject_connection(
            stream,
            NotifyCode::Cease,
            CeaseSubcode::ConnectionCollisionResolution as u8,
        );
        return peer.state;
    }

    // We lose: tear down the outbound session and adopt the inbound one.
    peer_send_notification(
        peer,
        NotifyCode::Cease,
        CeaseSubcode::ConnectionCollisionResolution as u8,
        Vec::new(),
    );
    peer_close_transport(peer);

    if let Ok(local_addr) = stream.local_addr() {
        peer.param.local_addr = Some(local_addr);
    }
    peer_attach_stream(peer, stream);
    peer_send_open(peer);
    fsm_bgp_open(peer, packet)
}

/// The three-phase driver (compute, side effects, transition clean-up),
/// kept out of `Bgp` so the instance can route effects to the pipeline.
pub fn fsm_transition(peer: &mut Peer, event: Event) -> (State, State, FsmEffect) {
    let prev_state = peer.state;
    let (next_state, effect) = fsm_next_state(peer, event);
    peer.state = next_state;

    if prev_state != next_state {
        tracing::debug!(
            "peer {}: {} -> {}",
            peer.ident,
            prev_state.to_str(),
            next_state.to_str()
        );
        if !prev_state.is_established() && next_state.is_established() {
            peer.established_transitions += 1;
            peer.instant = Some(Instant::now());
        }
        if prev_state.is_established() && !next_state.is_established() {
            peer.instant = Some(Instant::now());
            peer.record_restart();
        }
        timer::update_timers(peer);
    }
    (prev_state, next_state, effect)
}

fn peer_attach_stream(peer: &mut Peer, stream: TcpStream) {
    let (packet_tx, packet_rx) = mpsc::unbounded_channel::<BytesMut>();
    peer.packet_tx = Some(packet_tx);
    peer.out_queue.store(0, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    peer.task.reader = Some(peer_start_reader(peer, read_half));
    peer.task.writer = Some(peer_start_writer(
        peer,
        write_half,
        packet_rx,
    ));
}

fn peer_close_transport(peer: &mut Peer) {
    peer.task.reader = None;
    peer.task.writer = None;
    peer.task.connect = None;
    peer.packet_tx = None;
    peer.out_queue.store(0, Ordering::Relaxed);
}

async fn peer_packet_parse(
    rx: &[u8],
    ident: IpAddr,
    tx: &mpsc::Sender<Message>,
    as4: &AtomicBool,
) -> Result<(), ()> {
    match BgpPacket::parse_packet(rx, as4.load(Ordering::Relaxed)) {
        Ok((_, packet)) => {
            let event = match packet {
                BgpPacket::Open(p) => Event::BGPOpen(*p),
                BgpPacket::Keepalive(_) => Event::KeepAliveMsg,
                BgpPacket::Notification(p) => Event::NotifMsg(p),
                BgpPacket::Update(p) => Event::UpdateMsg(p),
            };
            let _ = tx.send(Message::Event(ident, event)).await;
            Ok(())
        }
        Err(err) => {
            // Decode failures carry their error-code/subcode pair and
            // become NOTIFICATION synthesis in the FSM; no unwinding.
            let _ = tx
                .send(Message::Event(
                    ident,
                    Event::ProtocolError(err.code(), err.subcode(), err.data().to_vec()),
                ))
                .await;
            Err(())
        }
    }
}

pub async fn peer_read(
    ident: IpAddr,
    tx: mpsc::Sender<Message>,
    mut read_half: OwnedReadHalf,
    as4: Arc<AtomicBool>,
) {
    let mut buf = BytesMut::with_capacity(BGP_PACKET_LEN * 2);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(read_len) => {
                if read_len == 0 {
                    let _ = tx.try_send(Message::Event(ident, Event::ConnFail));
                    return;
                }
                while buf.len() >= 19 && buf.len() >= peek_bgp_length(&buf) {
                    let length = peek_bgp_length(&buf);
                    if length < 19 {
                        // Let the parser emit the right error.
                        let _ = peer_packet_parse(&buf, ident, &tx, &as4).await;
                        return;
                    }
                    let mut remain = buf.split_off(length);
                    remain.reserve(BGP_PACKET_LEN * 2);

                    match peer_packet_parse(&buf, ident, &tx, &as4).await {
                        Ok(_) => buf = remain,
                        Err(_) => return,
                    }
                }
            }
            Err(_) => {
                let _ = tx.send(Message::Event(ident, Event::ConnFail)).await;
                return;
            }
        }
    }
}

pub fn peer_start_reader(peer: &Peer, read_half: OwnedReadHalf) -> Task<()> {
    let ident = peer.ident;
    let tx = peer.tx.clone();
    let as4 = peer.as4.clone();
    Task::spawn(async move {
        peer_read(ident, tx, read_half, as4).await;
    })
}

pub fn peer_start_writer(
    peer: &Peer,
    mut write_half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<BytesMut>,
) -> Task<()> {
    let ident = peer.ident;
    let tx = peer.tx.clone();
    let out_queue = peer.out_queue.clone();
    Task::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let _ = write_half.write_all(&msg).await;
            let before = out_queue.fetch_sub(1, Ordering::Relaxed);
            // Crossing the low watermark releases the fanout branch.
            if before == OUTPUT_LOW_WATERMARK + 1 {
                let _ = tx.try_send(Message::OutputReady(ident));
            }
        }
    })
}

pub fn peer_start_connection(peer: &mut Peer) -> Task<()> {
    let ident = peer.ident;
    let tx = peer.tx.clone();
    let address = peer.address;
    Task::spawn(async move {
        let addr = match address {
            IpAddr::V4(addr) => format!("{}:{}", addr, BGP_PORT),
            IpAddr::V6(addr) => format!("[{}]:{}", addr, BGP_PORT),
        };
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = tx.try_send(Message::Event(ident, Event::Connected(stream)));
            }
            Err(_) => {
                let _ = tx.try_send(Message::Event(ident, Event::ConnFail));
            }
        }
    })
}

pub fn peer_send_packet(peer: &mut Peer, bytes: BytesMut) {
    let Some(packet_tx) = peer.packet_tx.as_ref() else {
        return;
    };
    peer.out_queue.fetch_add(1, Ordering::Relaxed);
    let _ = packet_tx.send(bytes);
}

pub fn peer_send_open(peer: &mut Peer) {
    if peer.packet_tx.is_none() {
        return;
    }
    let mut caps = BgpCap::default();
    if !peer.open_without_caps {
        for (afi_safi, enabled) in peer.config.mp.iter() {
            if *enabled {
                caps.mp
                    .push(CapMultiProtocol::new(&afi_safi.afi, &afi_safi.safi));
            }
        }
        if peer.config.four_octet {
            caps.as4 = Some(CapAs4::new(peer.local_as));
        }
        if peer.config.route_refresh {
            caps.refresh = Some(CapRefresh);
        }
    }
    peer.cap_send = caps.clone();

    let hold_time = peer.config.timer.hold_time() as u16;
    peer.param_tx.hold_time = hold_time;
    peer.param_tx.keepalive = hold_time / 3;

    // On a 2-byte wire the OPEN carries AS_TRANS when our ASN is wide.
    let asn16 = if peer.local_as > u16::MAX as u32 {
        bgp_wire::AS_TRANS
    } else {
        peer.local_as as u16
    };
    let open = OpenPacket::new(asn16, hold_time, &peer.router_id, caps);
    let bytes: BytesMut = open.into();
    peer.counter[BgpType::Open as usize].sent += 1;
    peer_send_packet(peer, bytes);
}

pub fn peer_send_notification(peer: &mut Peer, code: NotifyCode, sub_code: u8, data: Vec<u8>) {
    if !notify_pair_valid(code, sub_code) {
        tracing::warn!(
            "peer {}: refusing NOTIFICATION with unknown pair {}/{}",
            peer.ident,
            u8::from(code),
            sub_code
        );
        return;
    }
    if peer.packet_tx.is_none() {
        return;
    }
    let notification = NotificationPacket::new(code, sub_code, data);
    let bytes: BytesMut = notification.into();
    peer.counter[BgpType::Notification as usize].sent += 1;
    peer_send_packet(peer, bytes);
}

pub fn peer_send_keepalive(peer: &mut Peer) {
    if peer.packet_tx.is_none() {
        return;
    }
    peer.counter[BgpType::Keepalive as usize].sent += 1;
    let bytes = keepalive_packet();
    peer_send_packet(peer, bytes);
}

/// Reject a connection by sending a NOTIFICATION and closing the socket;
/// bounded so slow peers cannot exhaust descriptors.
pub fn reject_connection(stream: TcpStream, code: NotifyCode, sub_code: u8) {
    use tokio::time::timeout;

    tokio::spawn(async move {
        let notification = NotificationPacket::new(code, sub_code, Vec::new());
        let bytes: BytesMut = notification.into();
        let mut stream = stream;
        let _ = timeout(Duration::from_secs(5), async {
            let _ = stream.write_all(&bytes).await;
            let _ = stream.shutdown().await;
        })
        .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_peer() -> Peer {
        let (tx, _rx) = mpsc::channel(8);
        Peer::new(
            "10.0.0.2".parse().unwrap(),
            PeerId(1),
            65000,
            Ipv4Addr::new(10, 0, 0, 1),
            65001,
            "10.0.0.2".parse().unwrap(),
            tx,
        )
    }

    #[test]
    fn oscillation_threshold() {
        let mut peer = test_peer();
        for _ in 0..OSCILLATION_RESTARTS - 1 {
            assert!(!peer.record_restart());
        }
        assert!(peer.record_restart());
        assert!(peer.oscillation_damped());
    }

    #[test]
    fn peer_kind_from_config() {
        let mut peer = test_peer();
        assert!(peer.is_ebgp());
        peer.peer_as = peer.local_as;
        assert!(peer.is_ibgp());
        peer.peer_as = 65002;
        peer.config.confederation = true;
        assert_eq!(peer.peer_kind(), PeerKind::Confed);
    }

    #[test]
    fn open_asn_prefers_wide_capability() {
        let mut caps = BgpCap::default();
        caps.as4 = Some(CapAs4::new(70000));
        let open = OpenPacket::new(
            bgp_wire::AS_TRANS,
            90,
            &Ipv4Addr::new(10, 0, 0, 2),
            caps,
        );
        assert_eq!(open_asn(&open), 70000);

        let open = OpenPacket::new(65001, 90, &Ipv4Addr::new(10, 0, 0, 2), BgpCap::default());
        assert_eq!(open_asn(&open), 65001);
    }
}

/// Collision arbiter for an accepted socket: consume exactly one OPEN,
/// then hand the socket and packet back for resolution.
pub fn start_accept_session(ident: IpAddr, stream: TcpStream, tx: mpsc::Sender<Message>) -> Task<()> {
    Task::spawn(async move {
        let mut stream = stream;
        let mut buf = BytesMut::with_capacity(BGP_PACKET_LEN);
        loop {
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if buf.len() >= 19 && buf.len() >= peek_bgp_length(&buf) {
                break;
            }
        }
        match BgpPacket::parse_packet(&buf, true) {
            Ok((_, BgpPacket::Open(open))) => {
                let _ = tx
                    .send(Message::Event(ident, Event::CollisionOpen(stream, *open)))
                    .await;
            }
            _ => {
                // Anything but an OPEN on a fresh session is hopeless.
                reject_connection(
                    stream,
                    NotifyCode::FsmError,
                    FsmSubcode::UnexpectedMessageInOpenSent as u8,
                );
            }
        }
    })
}
