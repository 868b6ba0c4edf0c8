//! Session advertisement and discovery.
//!
//! LAN discovery is built in: a hosting server periodically broadcasts a
//! session notice and answers directed search requests; a searching client
//! broadcasts requests and collects the replies for the duration of the
//! search window. A third-party lobby service can replace the broadcast
//! path by supplying a [`Discovery`] backend; the public contract (open,
//! close, search, join) does not change.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metadata a host advertises about its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub max_players: u8,
    pub player_count: u8,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            name: String::from("Ember Session"),
            max_players: 8,
            player_count: 0,
        }
    }
}

impl SessionInfo {
    pub fn is_full(&self) -> bool {
        self.player_count >= self.max_players
    }
}

/// A remote session seen during a search.
#[derive(Debug, Clone)]
pub struct DiscoveredSession {
    pub addr: SocketAddr,
    pub info: SessionInfo,
    pub last_seen: Instant,
}

/// Pluggable non-LAN discovery backend (platform lobby service, master
/// server). The manager delegates to it when present; the broadcast path
/// is skipped entirely.
pub trait Discovery {
    fn open_session(&mut self, info: &SessionInfo);
    fn close_session(&mut self);
    fn begin_search(&mut self);
    fn end_search(&mut self);
    fn is_searching(&self) -> bool;
    fn sessions(&self) -> Vec<DiscoveredSession>;
}

pub struct SessionManager {
    local: Option<SessionInfo>,
    sessions: Vec<DiscoveredSession>,
    searching: bool,
    search_deadline: Option<Instant>,
    last_search_send: Option<Instant>,
    last_advertise: Option<Instant>,
    backend: Option<Box<dyn Discovery>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            local: None,
            sessions: Vec::new(),
            searching: false,
            search_deadline: None,
            last_search_send: None,
            last_advertise: None,
            backend: None,
        }
    }

    pub fn with_backend(backend: Box<dyn Discovery>) -> Self {
        let mut manager = Self::new();
        manager.backend = Some(backend);
        manager
    }

    pub fn open(&mut self, info: SessionInfo) {
        if let Some(backend) = self.backend.as_mut() {
            backend.open_session(&info);
        }
        self.local = Some(info);
        self.last_advertise = None;
    }

    pub fn close(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.close_session();
        }
        self.local = None;
    }

    pub fn local(&self) -> Option<&SessionInfo> {
        self.local.as_ref()
    }

    pub fn local_mut(&mut self) -> Option<&mut SessionInfo> {
        self.local.as_mut()
    }

    /// Start a search window. The previous result list is discarded.
    pub fn begin_search(&mut self, now: Instant, duration: Duration) {
        if let Some(backend) = self.backend.as_mut() {
            backend.begin_search();
            self.searching = true;
            return;
        }
        self.sessions.clear();
        self.searching = true;
        self.search_deadline = Some(now + duration);
        self.last_search_send = None;
    }

    pub fn end_search(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.end_search();
        }
        self.searching = false;
        self.search_deadline = None;
    }

    pub fn is_searching(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.is_searching(),
            None => self.searching,
        }
    }

    pub fn sessions(&self) -> Vec<DiscoveredSession> {
        match &self.backend {
            Some(backend) => backend.sessions(),
            None => self.sessions.clone(),
        }
    }

    /// Record a session notice heard on the wire. Sessions are keyed by
    /// address; a repeat notice refreshes the entry.
    pub fn note_session(&mut self, addr: SocketAddr, info: SessionInfo, now: Instant) {
        if !self.searching || self.backend.is_some() {
            return;
        }
        match self.sessions.iter_mut().find(|s| s.addr == addr) {
            Some(existing) => {
                existing.info = info;
                existing.last_seen = now;
            }
            None => {
                log::info!("discovered session '{}' at {}", info.name, addr);
                self.sessions.push(DiscoveredSession {
                    addr,
                    info,
                    last_seen: now,
                });
            }
        }
    }

    /// Close the search window once its deadline passes.
    pub fn expire_search(&mut self, now: Instant) {
        if self.backend.is_none()
            && self.searching
            && self.search_deadline.is_some_and(|deadline| now >= deadline)
        {
            self.searching = false;
            self.search_deadline = None;
            log::debug!("session search ended with {} results", self.sessions.len());
        }
    }

    /// True when the next broadcast search request should go out.
    pub fn search_send_due(&mut self, now: Instant, interval: Duration) -> bool {
        if self.backend.is_some() || !self.searching {
            return false;
        }
        let due = match self.last_search_send {
            None => true,
            Some(last) => now.duration_since(last) >= interval,
        };
        if due {
            self.last_search_send = Some(now);
        }
        due
    }

    /// True when the next advertisement broadcast should go out.
    pub fn advertise_due(&mut self, now: Instant, interval: Duration) -> bool {
        if self.backend.is_some() || self.local.is_none() {
            return false;
        }
        let due = match self.last_advertise {
            None => true,
            Some(last) => now.duration_since(last) >= interval,
        };
        if due {
            self.last_advertise = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.0.10:{port}").parse().unwrap()
    }

    #[test]
    fn test_search_window_replaces_list() {
        let mut manager = SessionManager::new();
        let now = Instant::now();

        manager.begin_search(now, Duration::from_secs(5));
        manager.note_session(addr(26015), SessionInfo::default(), now);
        assert_eq!(manager.sessions().len(), 1);

        manager.begin_search(now, Duration::from_secs(5));
        assert!(manager.sessions().is_empty());
    }

    #[test]
    fn test_repeat_notice_refreshes_entry() {
        let mut manager = SessionManager::new();
        let now = Instant::now();
        manager.begin_search(now, Duration::from_secs(5));

        manager.note_session(addr(26015), SessionInfo::default(), now);
        let updated = SessionInfo {
            player_count: 3,
            ..SessionInfo::default()
        };
        manager.note_session(addr(26015), updated.clone(), now);

        let sessions = manager.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].info, updated);
    }

    #[test]
    fn test_notices_ignored_outside_search() {
        let mut manager = SessionManager::new();
        manager.note_session(addr(26015), SessionInfo::default(), Instant::now());
        assert!(manager.sessions().is_empty());
    }

    #[test]
    fn test_search_expires() {
        let mut manager = SessionManager::new();
        let now = Instant::now();

        manager.begin_search(now, Duration::from_millis(100));
        assert!(manager.is_searching());

        manager.expire_search(now + Duration::from_millis(50));
        assert!(manager.is_searching());

        manager.expire_search(now + Duration::from_millis(150));
        assert!(!manager.is_searching());
    }

    #[test]
    fn test_send_pacing() {
        let mut manager = SessionManager::new();
        let now = Instant::now();
        manager.begin_search(now, Duration::from_secs(5));

        assert!(manager.search_send_due(now, Duration::from_millis(500)));
        assert!(!manager.search_send_due(now + Duration::from_millis(100), Duration::from_millis(500)));
        assert!(manager.search_send_due(now + Duration::from_millis(600), Duration::from_millis(500)));
    }

    struct StubBackend {
        searching: bool,
    }

    impl Discovery for StubBackend {
        fn open_session(&mut self, _info: &SessionInfo) {}
        fn close_session(&mut self) {}
        fn begin_search(&mut self) {
            self.searching = true;
        }
        fn end_search(&mut self) {
            self.searching = false;
        }
        fn is_searching(&self) -> bool {
            self.searching
        }
        fn sessions(&self) -> Vec<DiscoveredSession> {
            vec![DiscoveredSession {
                addr: addr(40000),
                info: SessionInfo::default(),
                last_seen: Instant::now(),
            }]
        }
    }

    #[test]
    fn test_backend_overrides_lan_path() {
        let mut manager = SessionManager::with_backend(Box::new(StubBackend { searching: false }));
        let now = Instant::now();

        manager.begin_search(now, Duration::from_secs(5));
        assert!(manager.is_searching());
        assert_eq!(manager.sessions().len(), 1);

        // Broadcast machinery stays quiet with a backend installed.
        assert!(!manager.search_send_due(now, Duration::from_millis(1)));
        manager.open(SessionInfo::default());
        assert!(!manager.advertise_due(now, Duration::from_millis(1)));

        manager.end_search();
        assert!(!manager.is_searching());
    }
}
