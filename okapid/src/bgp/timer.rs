use std::cmp::min;

use bgp_wire::OpenPacket;

use crate::context::Timer;

use super::inst::Message;
use super::peer::{Event, Peer, State};

/// Per-peer timer configuration. Values are seconds; `None` means the
/// default.
#[derive(Debug, Default, Clone)]
pub struct Config {
    pub idle_hold_time: Option<u16>,
    pub delay_open_time: Option<u16>,
    pub hold_time: Option<u16>,
    pub connect_retry_time: Option<u16>,
    /// Applied instead of idle-hold when the session oscillates.
    pub damped_idle_hold_time: Option<u16>,
    /// Uniform multiplicative jitter in [0.75, 1.0] on armed timers.
    pub jitter: Option<bool>,
}

impl Config {
    const DEFAULT_IDLE_HOLD_TIME: u64 = 5;
    const DEFAULT_HOLD_TIME: u64 = 90;
    const DEFAULT_CONNECT_RETRY_TIME: u64 = 120;
    const DEFAULT_DAMPED_IDLE_HOLD_TIME: u64 = 120;
    /// Hold time while waiting for the peer's OPEN (RFC 4271: 4 min).
    pub const OPEN_HOLD_TIME: u64 = 240;

    pub fn idle_hold_time(&self) -> u64 {
        self.idle_hold_time
            .map(u64::from)
            .unwrap_or(Self::DEFAULT_IDLE_HOLD_TIME)
    }

    pub fn delay_open_time(&self) -> Option<u64> {
        self.delay_open_time.map(u64::from)
    }

    pub fn hold_time(&self) -> u64 {
        self.hold_time
            .map(u64::from)
            .unwrap_or(Self::DEFAULT_HOLD_TIME)
    }

    pub fn connect_retry_time(&self) -> u64 {
        self.connect_retry_time
            .map(u64::from)
            .unwrap_or(Self::DEFAULT_CONNECT_RETRY_TIME)
    }

    pub fn damped_idle_hold_time(&self) -> u64 {
        self.damped_idle_hold_time
            .map(u64::from)
            .unwrap_or(Self::DEFAULT_DAMPED_IDLE_HOLD_TIME)
    }

    pub fn jitter(&self) -> bool {
        self.jitter.unwrap_or(true)
    }
}

macro_rules! start_timer {
    ($peer:expr, $time:expr, $ev:expr) => {{
        let ident = $peer.ident;
        let tx = $peer.tx.clone();
        let jitter = $peer.config.timer.jitter();

        Timer::once_jittered($time, jitter, move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Message::Event(ident, $ev)).await;
            }
        })
    }};
}

macro_rules! start_repeater {
    ($peer:expr, $time:expr, $ev:expr) => {{
        let ident = $peer.ident;
        let tx = $peer.tx.clone();
        let jitter = $peer.config.timer.jitter();

        Timer::repeat_jittered($time, jitter, move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Message::Event(ident, $ev)).await;
            }
        })
    }};
}

fn start_idle_hold_timer(peer: &Peer) -> Timer {
    let time = if peer.oscillation_damped() {
        peer.config.timer.damped_idle_hold_time()
    } else {
        peer.config.timer.idle_hold_time()
    };
    start_timer!(peer, time, Event::IdleHoldTimerExpires)
}

pub fn start_connect_retry_timer(peer: &Peer) -> Timer {
    start_timer!(
        peer,
        peer.config.timer.connect_retry_time(),
        Event::ConnRetryTimerExpires
    )
}

fn start_hold_timer(peer: &Peer) -> Timer {
    start_timer!(peer, peer.param.hold_time as u64, Event::HoldTimerExpires)
}

pub fn start_open_hold_timer(peer: &Peer) -> Timer {
    start_timer!(peer, Config::OPEN_HOLD_TIME, Event::HoldTimerExpires)
}

fn start_keepalive_timer(peer: &Peer) -> Timer {
    start_repeater!(
        peer,
        peer.param.keepalive as u64,
        Event::KeepaliveTimerExpires
    )
}

pub fn start_delay_open_timer(peer: &Peer, time: u64) -> Timer {
    start_timer!(peer, time, Event::DelayOpenTimerExpires)
}

/// Grace period for an in-flight NOTIFICATION to drain before the
/// session resources are torn down.
pub fn start_drain_timer(peer: &Peer) -> Timer {
    let ident = peer.ident;
    let tx = peer.tx.clone();
    Timer::once(1, move || {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Message::Event(ident, Event::DrainTimerExpires)).await;
        }
    })
}

pub fn refresh_hold_timer(peer: &Peer) {
    if let Some(hold_timer) = peer.timer.hold_timer.as_ref() {
        hold_timer.refresh();
    }
}

/// Negotiate hold/keepalive from the peer's OPEN and arm the timers.
pub fn update_open_timers(peer: &mut Peer, packet: &OpenPacket) {
    peer.param_rx.hold_time = packet.hold_time;
    peer.param_rx.keepalive = packet.hold_time / 3;

    if packet.hold_time == 0 {
        peer.param.hold_time = 0;
        peer.param.keepalive = 0;
    } else {
        let hold_time = peer.config.timer.hold_time() as u16;
        peer.param.hold_time = min(packet.hold_time, hold_time);
        peer.param.keepalive = peer.param.hold_time / 3;
    }
    if peer.param.keepalive > 0 {
        peer.timer.keepalive = Some(start_keepalive_timer(peer));
    }
    if peer.param.hold_time > 0 {
        peer.timer.hold_timer = Some(start_hold_timer(peer));
    }
}

/// Reconcile timers with the state after every transition.
pub fn update_timers(peer: &mut Peer) {
    use State::*;
    match peer.state {
        Idle => {
            if peer.is_passive() {
                // A passive peer waits in Active for an inbound session.
                // This is the only state change made outside the FSM.
                peer.state = Active;
                peer.timer.idle_hold_timer = None;
            } else if peer.enabled && peer.timer.idle_hold_timer.is_none() {
                peer.timer.idle_hold_timer = Some(start_idle_hold_timer(peer));
            }
            peer.timer.connect_retry = None;
            peer.timer.hold_timer = None;
            peer.timer.keepalive = None;
            peer.timer.delay_open = None;
            peer.timer.drain = None;

            peer.task.writer = None;
            peer.task.reader = None;
        }
        Connect => {
            peer.timer.idle_hold_timer = None;
            peer.timer.hold_timer = None;
            peer.timer.keepalive = None;
        }
        Active => {
            peer.timer.idle_hold_timer = None;
            peer.timer.hold_timer = None;
            peer.timer.keepalive = None;
            peer.timer.delay_open = None;
        }
        OpenSent | OpenConfirm => {
            peer.timer.idle_hold_timer = None;
            peer.timer.delay_open = None;
        }
        Established => {
            peer.timer.idle_hold_timer = None;
            peer.timer.connect_retry = None;
            peer.timer.delay_open = None;
            if peer.timer.hold_timer.is_none() && peer.param.hold_time > 0 {
                peer.timer.hold_timer = Some(start_hold_timer(peer));
            }
            if peer.timer.keepalive.is_none() && peer.param.keepalive > 0 {
                peer.timer.keepalive = Some(start_keepalive_timer(peer));
            }
        }
        Stopped => {
            peer.timer.idle_hold_timer = None;
            peer.timer.connect_retry = None;
            peer.timer.hold_timer = None;
            peer.timer.keepalive = None;
            peer.timer.delay_open = None;
            if peer.timer.drain.is_none() {
                peer.timer.drain = Some(start_drain_timer(peer));
            }
        }
    }
}
