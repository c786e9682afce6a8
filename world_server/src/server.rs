//! Server implementation.
//!
//! Authoritative session table with snapshot-style presence broadcasting:
//! - Join handshake over one reliable channel per client
//! - Entity updates forwarded to every other session
//! - Full entity list on membership change, corrective sync on an interval
//! - Append-only world object log, replayed once per (re)join
//! - Chat relay with per-session rate limiting
//! - Stale-session eviction as the backstop for vanished clients
//!
//! Concurrency model: one reader task per connection forwards parsed
//! messages into a single channel; the step loop is the only writer of
//! server state. Keep iteration order stable where output is broadcast.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use world_shared::chat::{sanitize, RateLimiter};
use world_shared::config::EngineConfig;
use world_shared::console::{Console, CvarFlags, CvarValue};
use world_shared::net::{
    Channel, ClientMsg, EntityRecord, FrameWriter, Identity, PlacedObject, ReliableListener,
    ServerMsg, SessionId, PROTOCOL_VERSION,
};
use world_shared::world::ObjectLog;

use crate::presence::{PresenceBroadcaster, SyncKind};

/// How long the join handshake may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected session state.
struct SessionState {
    identity: Identity,
    writer: FrameWriter,
    /// The session's own entity as last reported.
    record: EntityRecord,
    last_seen: Instant,
    chat_limiter: RateLimiter,
}

/// Parsed traffic from a per-connection reader task.
enum SessionEvent {
    Inbound(SessionId, ClientMsg),
    Closed(SessionId),
}

/// Monotonic counters exposed through the diagnostics interface.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ServerCounters {
    pub joins: u64,
    pub placements: u64,
    pub placements_rejected: u64,
    pub chat_relayed: u64,
    pub chat_rate_limited: u64,
    pub sessions_evicted: u64,
    pub sessions_closed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDiag {
    pub id: SessionId,
    pub name: String,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerDiagnostics {
    pub sessions: Vec<SessionDiag>,
    pub objects: usize,
    pub counters: ServerCounters,
}

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    pub console: Console,
    pub counters: ServerCounters,
    sessions: HashMap<SessionId, SessionState>,
    objects: ObjectLog,
    presence: PresenceBroadcaster,
    listener: ReliableListener,
    next_session: u32,
    inbound_tx: mpsc::UnboundedSender<SessionEvent>,
    inbound_rx: mpsc::UnboundedReceiver<SessionEvent>,
    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Creates a new server bound to the configured address.
    pub async fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut console = Console::new();
        Self::register_cvars(&cfg, &mut console);

        let now = Instant::now();
        Ok(Self {
            presence: PresenceBroadcaster::new(
                Duration::from_secs_f32(cfg.sync_interval_secs),
                now,
            ),
            cfg,
            console,
            counters: ServerCounters::default(),
            sessions: HashMap::new(),
            objects: ObjectLog::new(),
            listener,
            next_session: 1,
            inbound_tx,
            inbound_rx,
            console_rx: None,
        })
    }

    fn register_cvars(cfg: &EngineConfig, console: &mut Console) {
        console.register_cvar(
            "sv_sync_interval",
            CvarValue::Float(cfg.sync_interval_secs as f64),
            "Corrective entity-list broadcast interval, seconds",
            CvarFlags::REPLICATED,
        );
        console.register_cvar(
            "sv_session_stale",
            CvarValue::Float(cfg.session_stale_secs as f64),
            "Idle seconds before a session is evicted",
            CvarFlags::SERVER_ONLY,
        );
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn objects(&self) -> &ObjectLog {
        &self.objects
    }

    /// Accepts one client within the timeout, if any is waiting.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<SessionId>> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((channel, peer))) => self.handle_new_connection(channel, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None), // Timeout
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut channel: Channel,
        peer: SocketAddr,
    ) -> anyhow::Result<SessionId> {
        let join: ClientMsg = tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.recv())
            .await
            .context("handshake timed out")??;
        let identity = match join {
            ClientMsg::Join { protocol, identity } if protocol == PROTOCOL_VERSION => identity,
            ClientMsg::Join { protocol, .. } => {
                let _ = channel
                    .send(&ServerMsg::Disconnect {
                        reason: format!("protocol mismatch: {protocol}"),
                    })
                    .await;
                anyhow::bail!("protocol mismatch from {peer}: {protocol}");
            }
            other => anyhow::bail!("expected Join, got {other:?}"),
        };

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let (mut reader, mut writer) = channel.into_split();
        writer.send(&ServerMsg::Welcome { session_id: id }).await?;
        // Full object log, exactly once per join.
        writer
            .send(&ServerMsg::WorldState(self.objects.entries().to_vec()))
            .await?;

        let now = Instant::now();
        self.sessions.insert(
            id,
            SessionState {
                identity: identity.clone(),
                writer,
                record: EntityRecord::initial(id),
                last_seen: now,
                chat_limiter: RateLimiter::default(),
            },
        );
        self.counters.joins += 1;
        self.presence.mark_dirty();

        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match reader.recv::<ClientMsg>().await {
                    Ok(msg) => {
                        let closing = matches!(msg, ClientMsg::Disconnect);
                        if tx.send(SessionEvent::Inbound(id, msg)).is_err() || closing {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = tx.send(SessionEvent::Closed(id));
                        break;
                    }
                }
            }
        });

        info!(session_id = ?id, name = %identity.name, %peer, "Client joined");
        Ok(id)
    }

    /// Runs the server for a number of ticks (tests and tools).
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz as f32);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(Instant::now()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one server tick: drains inbound traffic, evicts stale
    /// sessions, and broadcasts presence when due.
    pub async fn step(&mut self, now: Instant) -> anyhow::Result<()> {
        self.process_console_commands()?;

        // Collect first; handling mutates the session table.
        let mut events = Vec::new();
        while let Ok(ev) = self.inbound_rx.try_recv() {
            events.push(ev);
        }
        for ev in events {
            match ev {
                SessionEvent::Inbound(id, msg) => self.handle_inbound(id, msg, now).await,
                SessionEvent::Closed(id) => self.drop_session(id, "connection closed"),
            }
        }

        self.evict_stale(now);

        if let Some(secs) = self
            .console
            .get_cvar("sv_sync_interval")
            .and_then(|v| v.as_float())
        {
            self.presence.set_interval(Duration::from_secs_f64(secs));
        }
        match self.presence.poll(now) {
            Some(SyncKind::Change) => {
                let list = self.entity_list();
                self.broadcast(&ServerMsg::EntityList(list), None).await;
            }
            Some(SyncKind::Interval) => {
                let list = self.entity_list();
                self.broadcast(&ServerMsg::EntityListSync(list), None).await;
            }
            None => {}
        }

        self.objects
            .compact_seen(now, Duration::from_secs(self.cfg.seen_compact_secs));
        Ok(())
    }

    async fn handle_inbound(&mut self, id: SessionId, msg: ClientMsg, now: Instant) {
        match msg {
            ClientMsg::Join { .. } => {
                warn!(?id, "duplicate join ignored");
            }
            ClientMsg::EntityUpdate(mut record) => {
                // The session id is authoritative; never trust the payload's.
                record.id = id;
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };
                session.last_seen = now;
                session.record = record.clone();
                self.broadcast(&ServerMsg::EntityUpdate(record), Some(id))
                    .await;
            }
            ClientMsg::PlaceObject {
                coord,
                color,
                timestamp_ms,
            } => {
                self.touch(id, now);
                let obj = PlacedObject {
                    coord,
                    color,
                    owner: id,
                    placed_at_ms: timestamp_ms,
                };
                if self.objects.place(obj.clone()) {
                    self.counters.placements += 1;
                    self.broadcast(&ServerMsg::ObjectPlaced(obj), Some(id)).await;
                } else {
                    // Conflict: rejected, no network effect.
                    self.counters.placements_rejected += 1;
                    debug!(?coord, owner = ?id, "placement conflict");
                }
            }
            ClientMsg::Chat { text } => {
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };
                session.last_seen = now;
                if !session.chat_limiter.record_message() {
                    self.counters.chat_rate_limited += 1;
                    debug!(?id, "chat rate limited");
                    return;
                }
                let name = session.identity.name.clone();
                let text = sanitize(&text);
                self.counters.chat_relayed += 1;
                self.broadcast(&ServerMsg::Chat { sender: id, name, text }, None)
                    .await;
            }
            ClientMsg::Heartbeat { .. } => {
                self.touch(id, now);
            }
            ClientMsg::Resync => {
                self.touch(id, now);
                let world = ServerMsg::WorldState(self.objects.entries().to_vec());
                let list = ServerMsg::EntityList(self.entity_list());
                self.send_to(id, &world).await;
                self.send_to(id, &list).await;
            }
            ClientMsg::Disconnect => {
                self.drop_session(id, "client disconnected");
            }
        }
    }

    fn touch(&mut self, id: SessionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_seen = now;
        }
    }

    fn drop_session(&mut self, id: SessionId, reason: &str) {
        if self.sessions.remove(&id).is_some() {
            info!(?id, reason, "session removed");
            self.counters.sessions_closed += 1;
            self.presence.mark_dirty();
        }
    }

    /// Removes sessions silent past the staleness threshold. The backstop
    /// for clients that vanished without any close event.
    fn evict_stale(&mut self, now: Instant) {
        let threshold = self
            .console
            .get_cvar("sv_session_stale")
            .and_then(|v| v.as_float())
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| Duration::from_secs_f32(self.cfg.session_stale_secs));
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) > threshold)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            warn!(?id, "session stale, evicting");
            self.sessions.remove(&id);
            self.counters.sessions_evicted += 1;
            self.presence.mark_dirty();
        }
    }

    /// Full live entity list, stably ordered.
    pub fn entity_list(&self) -> Vec<EntityRecord> {
        let mut list: Vec<EntityRecord> =
            self.sessions.values().map(|s| s.record.clone()).collect();
        list.sort_by_key(|r| r.id.0);
        list
    }

    async fn broadcast(&mut self, msg: &ServerMsg, skip: Option<SessionId>) {
        let mut dead = Vec::new();
        for (sid, session) in self.sessions.iter_mut() {
            if Some(*sid) == skip {
                continue;
            }
            if session.writer.send(msg).await.is_err() {
                dead.push(*sid);
            }
        }
        for sid in dead {
            warn!(?sid, "write failed, dropping session");
            self.drop_session(sid, "write failed");
        }
    }

    async fn send_to(&mut self, id: SessionId, msg: &ServerMsg) {
        let failed = match self.sessions.get_mut(&id) {
            Some(session) => session.writer.send(msg).await.is_err(),
            None => false,
        };
        if failed {
            self.drop_session(id, "write failed");
        }
    }

    fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict.
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line)? {
                println!("{out}");
            }
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "status" => {
                let mut out = Vec::new();
                out.push(format!("Sessions: {}", self.sessions.len()));
                out.push(format!("Objects: {}", self.objects.len()));
                for (id, session) in &self.sessions {
                    out.push(format!("  {:?}: {}", id, session.identity.name));
                }
                Ok(out)
            }
            "entities" => {
                let list = self.entity_list();
                Ok(vec![serde_json::to_string_pretty(&list)?])
            }
            "counters" => Ok(vec![serde_json::to_string_pretty(&self.counters)?]),
            "quit" | "exit" => {
                info!("Server shutting down");
                std::process::exit(0);
            }
            _ => self.console.exec(line),
        }
    }

    pub fn diagnostics(&self, now: Instant) -> ServerDiagnostics {
        let mut sessions: Vec<SessionDiag> = self
            .sessions
            .iter()
            .map(|(id, s)| SessionDiag {
                id: *id,
                name: s.identity.name.clone(),
                idle_ms: now.duration_since(s.last_seen).as_millis() as u64,
            })
            .collect();
        sessions.sort_by_key(|s| s.id.0);
        ServerDiagnostics {
            sessions,
            objects: self.objects.len(),
            counters: self.counters,
        }
    }
}

/// Helper for tests: bind to an ephemeral port with the given config.
pub async fn bind_ephemeral(mut cfg: EngineConfig) -> anyhow::Result<(GameServer, EngineConfig)> {
    cfg.server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string();
    let mut server = GameServer::new(cfg).await?;
    let addr = server.local_addr()?;
    server.cfg.server_addr = addr.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
