use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedSender};

/// A refreshable timer driving an async callback. `Refresh` restarts the
/// interval from now, which is how hold timers are re-armed on receipt.
#[derive(Debug)]
pub struct Timer {
    pub tx: UnboundedSender<TimerMessage>,
}

#[derive(Debug)]
pub enum TimerMessage {
    Refresh,
}

#[derive(PartialEq, Clone, Copy)]
pub enum TimerType {
    Once,
    Infinite,
}

impl Timer {
    pub fn new<F, Fut>(duration: Duration, typ: TimerType, mut cb: F) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(duration);
            _ = interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        (cb)().await;
                        if typ == TimerType::Once {
                            break;
                        }
                    }
                    message = rx.recv() => {
                        match message {
                            Some(TimerMessage::Refresh) => {
                                interval = tokio::time::interval(duration);
                                _ = interval.tick().await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Timer { tx }
    }

    pub fn once<F, Fut>(sec: u64, cb: F) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::new(Duration::from_secs(sec), TimerType::Once, cb)
    }

    pub fn repeat<F, Fut>(sec: u64, cb: F) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::new(Duration::from_secs(sec), TimerType::Infinite, cb)
    }

    /// One-shot with uniform multiplicative jitter in [0.75, 1.0].
    pub fn once_jittered<F, Fut>(sec: u64, jitter: bool, cb: F) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::new(jittered(sec, jitter), TimerType::Once, cb)
    }

    pub fn repeat_jittered<F, Fut>(sec: u64, jitter: bool, cb: F) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::new(jittered(sec, jitter), TimerType::Infinite, cb)
    }

    pub fn refresh(&self) {
        let _ = self.tx.send(TimerMessage::Refresh);
    }
}

fn jittered(sec: u64, jitter: bool) -> Duration {
    if !jitter || sec == 0 {
        return Duration::from_secs(sec);
    }
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.0);
    Duration::from_secs_f64(sec as f64 * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_range() {
        for _ in 0..64 {
            let d = jittered(100, true);
            assert!(d >= Duration::from_secs(75));
            assert!(d <= Duration::from_secs(100));
        }
        assert_eq!(jittered(100, false), Duration::from_secs(100));
    }
}
