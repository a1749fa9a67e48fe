use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use bgp_wire::{CeaseSubcode, NotifyCode};
use ipnet::IpNet;

use crate::bgp::handler::{self, IngressOutcome, IngressPeer, OutboundBatch};
use crate::bgp::peer::{
    fsm_transition, peer_send_notification, peer_send_packet, reject_connection,
    start_accept_session, Event, FsmEffect, Peer, State,
};
use crate::bgp::route::{AddressFamily, Ipv4Af, Ipv6Af, PeerId, PeerInfo};
use crate::bgp::table::{DampingConfig, Pipeline, PipelineConfig, PolicyProgram};
use crate::bgp::{timer, DebugRegistry};
use crate::config::BgpSection;
use crate::context::{HandlerGuard, Task, Timer};
use crate::error::CoreError;
use crate::rib::{self, NextHopResolver, RibRx, RibRxChannel};

/// Create an IPv6-only TCP listener so it does not shadow the v4 one.
fn create_ipv6_listener() -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;

    let addr = "[::]:179".parse::<SocketAddr>().unwrap();
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

#[derive(Debug)]
pub enum Message {
    Event(IpAddr, Event),
    Accept(TcpStream, SocketAddr),
    /// Writer crossed the low watermark; branch may drain again.
    OutputReady(IpAddr),
    /// Continue a table dump toward the peer.
    DumpStep(IpAddr),
    DampingTick,
    Originate { prefix: IpNet, nexthop: IpAddr },
    Withdraw { prefix: IpNet },
    /// Re-run the peering's filters over its stored routes.
    PushRoutes(IpAddr),
    Show(Sender<String>),
}

pub struct Bgp {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub peers: BTreeMap<IpAddr, Peer>,
    peer_idx: BTreeMap<PeerId, IpAddr>,
    next_peer_id: u32,
    pub pipeline4: Pipeline<Ipv4Af>,
    pub pipeline6: Pipeline<Ipv6Af>,
    /// Bounded channel for BGP events.
    pub tx: mpsc::Sender<Message>,
    pub rx: mpsc::Receiver<Message>,
    pub rib_tx: UnboundedSender<rib::Message>,
    pub rib_rx: UnboundedReceiver<RibRx>,
    pub listen_task: Option<Task<()>>,
    pub listen_task6: Option<Task<()>>,
    pub listen_err: Option<std::io::Error>,
    pub debug: DebugRegistry,
    damping_timer: Option<Timer>,
}

impl Bgp {
    pub fn new(section: &BgpSection, rib_tx: UnboundedSender<rib::Message>) -> Self {
        let chan = RibRxChannel::new();
        let _ = rib_tx.send(rib::Message::Subscribe {
            proto: "bgp".into(),
            tx: chan.tx.clone(),
        });

        let router_id = section.router_id.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let damping = match &section.damping {
            Some(d) => DampingConfig {
                enabled: d.enabled,
                half_life: d.half_life.unwrap_or(15),
                max_hold_down: d.max_hold_down.unwrap_or(60),
                reuse: d.reuse.unwrap_or(750),
                cutoff: d.cutoff.unwrap_or(3000),
            },
            None => DampingConfig::default(),
        };
        let pipeline_config = PipelineConfig {
            local_as: section.asn,
            router_id,
            cluster_id: section.cluster_id.unwrap_or(router_id),
            default_local_pref: 100,
            always_compare_med: section.always_compare_med,
            confederation_id: section.confederation_id,
            damping,
        };

        let (tx, rx) = mpsc::channel(8192);
        let mut bgp = Self {
            asn: section.asn,
            router_id,
            peers: BTreeMap::new(),
            peer_idx: BTreeMap::new(),
            next_peer_id: 1,
            pipeline4: Pipeline::new(
                pipeline_config.clone(),
                NextHopResolver::new(Some(rib_tx.clone())),
            ),
            pipeline6: Pipeline::new(
                pipeline_config,
                NextHopResolver::new(Some(rib_tx.clone())),
            ),
            tx,
            rx,
            rib_tx,
            rib_rx: chan.rx,
            listen_task: None,
            listen_task6: None,
            listen_err: None,
            debug: DebugRegistry::new(),
            damping_timer: None,
        };

        bgp.pipeline4.add_local_origin();
        bgp.pipeline6.add_local_origin();

        for aggregate in section.aggregates.iter() {
            match aggregate.prefix {
                IpNet::V4(net) => bgp.pipeline4.add_aggregate(net, aggregate.summary_only),
                IpNet::V6(net) => bgp.pipeline6.add_aggregate(net, aggregate.summary_only),
            }
        }

        for peer_config in section.peers.iter() {
            bgp.peer_add(peer_config);
        }

        for network in section.networks.iter() {
            bgp.originate(network.prefix, network.nexthop);
        }

        bgp
    }

    pub fn peer_add(&mut self, section: &crate::config::PeerSection) {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let mut peer = Peer::new(
            section.address,
            id,
            self.asn,
            self.router_id,
            section.peer_as,
            section.address,
            self.tx.clone(),
        );
        peer.config.transport.passive = section.passive;
        peer.config.transport.md5_password = section.md5_password.clone();
        peer.config.four_octet = section.four_octet_as;
        peer.config.prefix_limit = section.prefix_limit;
        peer.config.reflector_client = section.reflector_client;
        peer.config.confederation = section.confederation_member;
        peer.config.timer.hold_time = section.hold_time;
        peer.config.timer.connect_retry_time = section.connect_retry_time;
        peer.config.timer.delay_open_time = section.delay_open_time;
        peer.config.timer.idle_hold_time = section.idle_hold_time;

        let info = PeerInfo {
            id,
            addr: section.address,
            kind: peer.peer_kind(),
            neighbor_as: section.peer_as,
            router_id: Ipv4Addr::UNSPECIFIED,
            reflector_client: section.reflector_client,
        };
        let accept = Arc::new(PolicyProgram::accept_all());
        self.pipeline4
            .add_peering(info.clone(), accept.clone(), accept.clone());
        let accept6 = Arc::new(PolicyProgram::accept_all());
        self.pipeline6.add_peering(info, accept6.clone(), accept6);

        peer.start();
        self.peer_idx.insert(id, section.address);
        self.peers.insert(section.address, peer);
    }

    pub fn peer_delete(&mut self, addr: IpAddr) {
        let Some(mut peer) = self.peers.remove(&addr) else {
            return;
        };
        peer_send_notification(
            &mut peer,
            NotifyCode::Cease,
            CeaseSubcode::PeerDeConfigured as u8,
            Vec::new(),
        );
        let id = peer.id;
        let _ = self.pipeline4.peering_went_down(id);
        let _ = self.pipeline6.peering_went_down(id);
        self.pipeline4.delete_peering(id);
        self.pipeline6.delete_peering(id);
        self.peer_idx.remove(&id);
        self.flush_outbound();
    }

    fn peer_info_update(&mut self, addr: IpAddr) {
        // Propagate what OPEN negotiation learned into the decision
        // process's view of the peer.
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let id = peer.id;
        let remote_id = peer.remote_id;
        if let Some(info) = self.pipeline4.peers.get_mut(&id) {
            info.router_id = remote_id;
        }
        if let Some(info) = self.pipeline6.peers.get_mut(&id) {
            info.router_id = remote_id;
        }
    }

    /// Three-phase FSM driver: compute the transition, run the effects
    /// against the pipelines, then handle the state-change consequences.
    pub fn fsm(&mut self, id: IpAddr, event: Event) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let (prev, next, effect) = fsm_transition(peer, event);
        self.debug.log(
            "fsm",
            format!("{}: {} -> {}", id, prev.to_str(), next.to_str()),
        );

        if let FsmEffect::RouteUpdate(packet) = effect {
            self.route_update(id, *packet);
        }

        let now_established = !prev.is_established() && next.is_established();
        let now_down = prev.is_established() && !next.is_established();
        if now_established {
            self.established(id);
        }
        if now_down {
            self.peering_down(id);
        }
        self.flush_outbound();
    }

    fn established(&mut self, addr: IpAddr) {
        self.peer_info_update(addr);
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let id = peer.id;
        info!("peer {} established", addr);
        if let Some(local) = peer.param.local_addr {
            match local.ip() {
                IpAddr::V4(v4) => self.pipeline4.set_local_nexthop(id, v4),
                IpAddr::V6(v6) => self.pipeline6.set_local_nexthop(id, v6),
            }
        }
        if let Err(err) = self.pipeline4.peering_came_up(id) {
            warn!("peering up (v4): {}", err);
        }
        if let Err(err) = self.pipeline6.peering_came_up(id) {
            warn!("peering up (v6): {}", err);
        }
        let _ = self.tx.try_send(Message::DumpStep(addr));
    }

    fn peering_down(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let id = peer.id;
        info!("peer {} down", addr);
        if let Err(err) = self.pipeline4.peering_went_down(id) {
            warn!("peering down (v4): {}", err);
        }
        if let Err(err) = self.pipeline6.peering_went_down(id) {
            warn!("peering down (v6): {}", err);
        }
        let _ = self.pipeline4.push(id);
        let _ = self.pipeline6.push(id);
    }

    fn route_update(&mut self, addr: IpAddr, packet: bgp_wire::UpdatePacket) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let ingress = IngressPeer {
            id: peer.id,
            kind: peer.peer_kind(),
            local_as: self.asn,
            router_id: self.router_id,
            cluster_id: self.router_id,
            prefix_limit: peer.config.prefix_limit,
        };
        match handler::update_received(&ingress, &mut self.pipeline4, &mut self.pipeline6, packet)
        {
            Ok(IngressOutcome::Ok) => {}
            Ok(IngressOutcome::PrefixLimitExceeded) => {
                warn!("peer {}: prefix limit exceeded", addr);
                self.stop_peer(
                    addr,
                    NotifyCode::Cease,
                    CeaseSubcode::MaximumNumberOfPrefixesReached as u8,
                    Vec::new(),
                );
            }
            Err(CoreError::Protocol {
                code,
                subcode,
                data,
            }) => {
                self.stop_peer(addr, code, subcode, data);
            }
            Err(err) => {
                warn!("peer {}: update processing: {}", addr, err);
            }
        }
    }

    /// Send a NOTIFICATION and put the session into Stopped, sweeping
    /// its routes.
    fn stop_peer(&mut self, addr: IpAddr, code: NotifyCode, subcode: u8, data: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let was_established = peer.state.is_established();
        peer_send_notification(peer, code, subcode, data);
        peer.state = State::Stopped;
        timer::update_timers(peer);
        if was_established {
            self.peering_down(addr);
        }
    }

    fn dump_step(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        if !peer.state.is_established() {
            return;
        }
        let id = peer.id;
        let done4 = self.pipeline4.dump_step(id, 64).unwrap_or(true);
        let done6 = self.pipeline6.dump_step(id, 64).unwrap_or(true);
        if !(done4 && done6) {
            let _ = self.tx.try_send(Message::DumpStep(addr));
        }
        self.flush_outbound();
    }

    fn output_ready(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let id = peer.id;
        let _ = self.pipeline4.output_no_longer_busy(id);
        let _ = self.pipeline6.output_no_longer_busy(id);
        self.flush_outbound();
    }

    fn damping_tick(&mut self) {
        let _ = self.pipeline4.damping_tick();
        let _ = self.pipeline6.damping_tick();
        self.flush_outbound();
    }

    pub fn originate(&mut self, prefix: IpNet, nexthop: IpAddr) {
        let result = match (prefix, nexthop) {
            (IpNet::V4(net), IpAddr::V4(nh)) => {
                let attrs = local_route_attrs4(nh);
                self.pipeline4
                    .add_route(crate::bgp::table::LOCAL_PEER, net, attrs)
                    .map(|_| ())
            }
            (IpNet::V6(net), IpAddr::V6(nh)) => {
                let attrs = local_route_attrs6(nh);
                self.pipeline6
                    .add_route(crate::bgp::table::LOCAL_PEER, net, attrs)
                    .map(|_| ())
            }
            _ => Err(CoreError::config("prefix/nexthop family mismatch")),
        };
        if let Err(err) = result {
            warn!("originate {}: {}", prefix, err);
        }
        let _ = self.pipeline4.push(crate::bgp::table::LOCAL_PEER);
        let _ = self.pipeline6.push(crate::bgp::table::LOCAL_PEER);
        self.flush_outbound();
    }

    /// Replay a peering's stored routes through its (possibly changed)
    /// filter programs.
    pub fn push_routes(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let id = peer.id;
        if let Err(err) = self.pipeline4.push_routes(id) {
            warn!("push routes {} (v4): {}", addr, err);
        }
        if let Err(err) = self.pipeline6.push_routes(id) {
            warn!("push routes {} (v6): {}", addr, err);
        }
        let _ = self.pipeline4.push(id);
        let _ = self.pipeline6.push(id);
        self.flush_outbound();
    }

    pub fn withdraw(&mut self, prefix: IpNet) {
        let result = match prefix {
            IpNet::V4(net) => self.pipeline4.delete_route(crate::bgp::table::LOCAL_PEER, net),
            IpNet::V6(net) => self.pipeline6.delete_route(crate::bgp::table::LOCAL_PEER, net),
        };
        if let Err(err) = result {
            warn!("withdraw {}: {}", prefix, err);
        }
        let _ = self.pipeline4.push(crate::bgp::table::LOCAL_PEER);
        let _ = self.pipeline6.push(crate::bgp::table::LOCAL_PEER);
        self.flush_outbound();
    }

    /// Drain both pipelines' egress into encoded UPDATEs on the peers'
    /// transmit queues, tracking the backpressure watermarks.
    pub fn flush_outbound(&mut self) {
        let mut batches: BTreeMap<PeerId, OutboundBatch> = BTreeMap::new();
        handler::collect_outbound4(&mut batches, self.pipeline4.take_outbound());
        handler::collect_outbound6(&mut batches, self.pipeline6.take_outbound());

        for (peer_id, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            let Some(addr) = self.peer_idx.get(&peer_id).copied() else {
                continue;
            };
            let Some(peer) = self.peers.get_mut(&addr) else {
                continue;
            };
            if !peer.state.is_established() {
                continue;
            }
            let as4 = peer.as4.load(std::sync::atomic::Ordering::Relaxed);
            let packets = match handler::build_updates(batch, as4) {
                Ok(packets) => packets,
                Err(err) => {
                    warn!("peer {}: update build: {}", addr, err);
                    continue;
                }
            };
            for packet in packets {
                match packet.encode(as4) {
                    Ok(bytes) => {
                        peer.counter[bgp_wire::BgpType::Update as usize].sent += 1;
                        peer_send_packet(peer, bytes);
                    }
                    Err(err) => warn!("peer {}: update encode: {}", addr, err),
                }
            }
            if peer.output_queue_busy() {
                self.pipeline4.output_busy(peer_id);
                self.pipeline6.output_busy(peer_id);
            }
        }
    }

    /// Inbound connection management, collision arbitration included.
    pub fn accept(&mut self, stream: TcpStream, sockaddr: SocketAddr) {
        let peer_addr = sockaddr.ip();
        let Some(peer) = self.peers.get_mut(&peer_addr) else {
            // Not a configured peer; RST is answer enough.
            drop(stream);
            return;
        };
        match peer.state {
            State::Idle | State::Stopped => {
                drop(stream);
            }
            State::Connect => {
                peer.task.connect = None;
                self.fsm(peer_addr, Event::Connected(stream));
            }
            State::Active => {
                self.fsm(peer_addr, Event::Connected(stream));
            }
            State::OpenSent | State::OpenConfirm => {
                // Run the collision arbiter on the accepted socket; it
                // consumes the peer's OPEN and reports back.
                peer.task.accept =
                    Some(start_accept_session(peer_addr, stream, peer.tx.clone()));
            }
            State::Established => {
                reject_connection(
                    stream,
                    NotifyCode::Cease,
                    CeaseSubcode::ConnectionRejected as u8,
                );
            }
        }
    }

    fn process_rib_msg(&mut self, msg: RibRx) {
        match msg {
            RibRx::NhResult {
                addr,
                resolvable,
                metric,
            } => {
                let _ = self.pipeline4.nh_answer(addr, resolvable, metric);
                let _ = self.pipeline6.nh_answer(addr, resolvable, metric);
                self.flush_outbound();
            }
            RibRx::EoR => {}
        }
    }

    pub fn process_msg(&mut self, msg: Message) {
        let _guard = HandlerGuard::enter("bgp");
        match msg {
            Message::Event(addr, event) => self.fsm(addr, event),
            Message::Accept(stream, sockaddr) => self.accept(stream, sockaddr),
            Message::OutputReady(addr) => self.output_ready(addr),
            Message::DumpStep(addr) => self.dump_step(addr),
            Message::DampingTick => self.damping_tick(),
            Message::Originate { prefix, nexthop } => self.originate(prefix, nexthop),
            Message::Withdraw { prefix } => self.withdraw(prefix),
            Message::PushRoutes(addr) => self.push_routes(addr),
            Message::Show(tx) => {
                let out = super::show::show_summary(self);
                tokio::spawn(async move {
                    let _ = tx.send(out).await;
                });
            }
        }
    }

    pub async fn listen(&mut self) -> std::io::Result<()> {
        let tx = self.tx.clone();

        match TcpListener::bind("0.0.0.0:179").await {
            Ok(listener) => {
                let tx_ipv4 = tx.clone();
                self.listen_task = Some(Task::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((socket, sockaddr)) => {
                                if tx_ipv4.send(Message::Accept(socket, sockaddr)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!("ipv4 accept: {}", err);
                                // Back off so descriptor exhaustion does
                                // not spin the loop.
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            }
                        }
                    }
                }));
            }
            Err(err) => {
                warn!("bind 0.0.0.0:179: {}", err);
                self.listen_err = Some(err);
            }
        }

        match create_ipv6_listener() {
            Ok(listener) => {
                let tx_ipv6 = tx;
                self.listen_task6 = Some(Task::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((socket, sockaddr)) => {
                                if tx_ipv6.send(Message::Accept(socket, sockaddr)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!("ipv6 accept: {}", err);
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            }
                        }
                    }
                }));
            }
            Err(err) => {
                warn!("bind [::]:179: {}", err);
            }
        }

        Ok(())
    }

    fn start_damping_clock(&mut self) {
        let tx = self.tx.clone();
        self.damping_timer = Some(Timer::repeat(1, move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Message::DampingTick).await;
            }
        }));
    }

    pub async fn event_loop(&mut self) {
        let _ = self.listen().await;
        self.start_damping_clock();
        for (_, peer) in self.peers.iter() {
            if peer.enabled && !peer.is_passive() {
                let _ = self.tx.try_send(Message::Event(peer.ident, Event::Start));
            }
        }
        info!("bgp started, asn {} router-id {}", self.asn, self.router_id);
        loop {
            tokio::select! {
                Some(msg) = self.rx.recv() => {
                    self.process_msg(msg);
                }
                Some(msg) = self.rib_rx.recv() => {
                    self.process_rib_msg(msg);
                }
            }
        }
    }
}

fn local_route_attrs4(nexthop: Ipv4Addr) -> Arc<bgp_wire::PathAttrs> {
    let mut pa = bgp_wire::PathAttrs::new();
    pa.origin = Some(bgp_wire::Origin::Igp);
    pa.aspath = Some(bgp_wire::AsPath::new());
    Ipv4Af::set_nexthop(&mut pa, nexthop);
    Arc::new(pa)
}

fn local_route_attrs6(nexthop: std::net::Ipv6Addr) -> Arc<bgp_wire::PathAttrs> {
    let mut pa = bgp_wire::PathAttrs::new();
    pa.origin = Some(bgp_wire::Origin::Igp);
    pa.aspath = Some(bgp_wire::AsPath::new());
    Ipv6Af::set_nexthop(&mut pa, nexthop);
    Arc::new(pa)
}

pub fn serve(mut bgp: Bgp) {
    tokio::spawn(async move {
        bgp.event_loop().await;
    });
}
