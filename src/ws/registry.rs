//! Managed WebSocket connection registry.
//!
//! Opt-in per server: tracks live sessions, pings the idle ones, and closes
//! sessions whose ping went unanswered or whose inactivity exceeded the
//! configured limit. Timers run on two background tasks; the registry only
//! enqueues frames, the session task does the writing.

use crate::config::WsConfig;
use crate::ws::frame::{close_code, Frame};
use crate::ws::session::Outbound;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Opaque payload carried by heartbeat pings.
const HEARTBEAT_PAYLOAD: &[u8] = b"hb";

#[derive(Debug)]
struct Entry {
    path: Arc<str>,
    tx: UnboundedSender<Outbound>,
    last_activity: Instant,
    last_ping_sent: Instant,
    ping_pending: bool,
}

#[derive(Debug)]
pub(crate) struct WsRegistry {
    sessions: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    ping_timeout: Duration,
}

impl WsRegistry {
    pub(crate) fn new(config: &WsConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval),
            idle_timeout: Duration::from_secs(config.timeout_seconds),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: u64, path: Arc<str>, tx: UnboundedSender<Outbound>) {
        let now = Instant::now();
        self.sessions.lock().unwrap().insert(
            id,
            Entry {
                path,
                tx,
                last_activity: now,
                last_ping_sent: now,
                ping_pending: false,
            },
        );
    }

    /// Any inbound frame counts as activity and clears a pending ping.
    pub(crate) fn touch(&self, id: u64) {
        if let Some(entry) = self.sessions.lock().unwrap().get_mut(&id) {
            entry.last_activity = Instant::now();
            entry.ping_pending = false;
        }
    }

    pub(crate) fn mark_ping_sent(&self, id: u64) {
        if let Some(entry) = self.sessions.lock().unwrap().get_mut(&id) {
            entry.last_ping_sent = Instant::now();
            entry.ping_pending = true;
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        self.sessions.lock().unwrap().remove(&id);
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn session_paths(&self) -> Vec<(u64, Arc<str>)> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, e)| (*id, e.path.clone()))
            .collect()
    }

    /// One heartbeat pass: sessions idle past the interval with no pending
    /// ping get a PING queued.
    fn heartbeat_tick(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap();
        for entry in sessions.values_mut() {
            if !entry.ping_pending && now.duration_since(entry.last_activity) >= self.heartbeat_interval
            {
                if entry
                    .tx
                    .send(Outbound::Frame(Frame::ping(HEARTBEAT_PAYLOAD)))
                    .is_ok()
                {
                    entry.ping_pending = true;
                    entry.last_ping_sent = now;
                }
            }
        }
    }

    /// One timeout pass: unanswered pings and dead-idle sessions are closed
    /// with `1001 Going Away`.
    fn timeout_tick(&self) {
        let now = Instant::now();
        let sessions = self.sessions.lock().unwrap();
        for entry in sessions.values() {
            let ping_expired =
                entry.ping_pending && now.duration_since(entry.last_ping_sent) > self.ping_timeout;
            let idle_expired = now.duration_since(entry.last_activity) > self.idle_timeout;
            if ping_expired || idle_expired {
                let _ = entry.tx.send(Outbound::Close(
                    close_code::GOING_AWAY,
                    b"heartbeat timeout".to_vec(),
                ));
            }
        }
    }

    /// Spawns the heartbeat timer (every `heartbeat_interval` seconds) and
    /// the timeout timer (every second).
    pub(crate) fn spawn_timers(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.heartbeat_tick();
            }
        });

        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.timeout_tick();
            }
        });
    }
}
