//! Client implementation.
//!
//! The client maintains:
//! - One reliable framed channel to the server (FIFO per connection); a
//!   dedicated reader task owns the read half so partially-received frames
//!   are never abandoned, and `poll` drains what it has buffered
//! - The connection lifecycle state machine (cooldown, backoff, heartbeat)
//! - The reconciliation engine and its replicated entity store
//! - Per-entity interpolation toward the latest known transforms
//! - The local object log with receive-side dedup
//! - A console for diagnostics commands
//!
//! Everything mutates on the owning task; timers are plain instants checked
//! in `poll`, so dropping the client cancels all of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use world_shared::config::EngineConfig;
use world_shared::console::{Console, CvarFlags, CvarValue};
use world_shared::event::{ChatEvent, EventBus, WorldEvent};
use world_shared::math::{Orientation, Vec3};
use world_shared::net::{
    now_ms, Animation, Channel, ClientMsg, EntityRecord, FrameReader, FrameWriter, GridCoord,
    Identity, PlacedObject, ServerMsg, SessionId, PROTOCOL_VERSION,
};
use world_shared::world::ObjectLog;

use crate::interp::Interpolator;
use crate::lifecycle::{ConnState, Lifecycle, LossAction};
use crate::reconcile::{AvatarSource, ListSource, NoScene, Reconciler, ScenePort};

/// How long a dial (TCP connect + handshake) may take.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// High-level game client.
pub struct GameClient {
    cfg: EngineConfig,
    identity: Identity,
    pub session_id: SessionId,
    pub lifecycle: Lifecycle,
    pub console: Console,
    /// Typed event stream collaborators drain (renderer, builder, chat UI).
    pub events: EventBus,
    pub reconciler: Reconciler,
    pub interp: Interpolator,
    pub objects: ObjectLog,

    writer: Option<FrameWriter>,
    /// Fed by the reader task; a dropped sender means the stream ended.
    net_rx: Option<mpsc::UnboundedReceiver<ServerMsg>>,
    scene: Box<dyn ScenePort + Send>,
    avatars: Option<Arc<dyn AvatarSource>>,
    spawn_tx: mpsc::UnboundedSender<(SessionId, bool)>,
    spawn_rx: mpsc::UnboundedReceiver<(SessionId, bool)>,

    last_heartbeat: Instant,
    last_sweep: Instant,
    retry_at: Option<Instant>,
}

impl GameClient {
    /// Connects to the server and performs the join handshake.
    pub async fn connect(cfg: &EngineConfig, identity: Identity) -> anyhow::Result<Self> {
        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(cfg);
        lifecycle.request_connection(now);

        let (channel, session_id) = match Self::dial(cfg, &identity).await {
            Ok(ok) => ok,
            Err(e) => {
                lifecycle.on_connection_lost(now, false);
                return Err(e);
            }
        };
        lifecycle.on_connected(now);
        info!(?session_id, "connected to server");

        let mut console = Console::new();
        Self::register_cvars(cfg, &mut console);

        let (reader, writer) = channel.into_split();
        let net_rx = Self::spawn_reader(reader);

        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg: cfg.clone(),
            identity,
            session_id,
            lifecycle,
            console,
            events: EventBus::default(),
            reconciler: Reconciler::new(session_id, cfg),
            interp: Interpolator::new(cfg),
            objects: ObjectLog::new(),
            writer: Some(writer),
            net_rx: Some(net_rx),
            scene: Box::new(NoScene),
            avatars: None,
            spawn_tx,
            spawn_rx,
            last_heartbeat: now,
            last_sweep: now,
            retry_at: None,
        })
    }

    /// Attaches the render-layer probe used for duplicate suppression.
    pub fn with_scene(mut self, scene: Box<dyn ScenePort + Send>) -> Self {
        self.scene = scene;
        self
    }

    /// Attaches an avatar loader; entity creation then defers behind the
    /// async visual fetch.
    pub fn with_avatar_source(mut self, avatars: Arc<dyn AvatarSource>) -> Self {
        self.avatars = Some(avatars);
        self.reconciler = Reconciler::new(self.session_id, &self.cfg).with_deferred_spawn();
        self
    }

    fn register_cvars(cfg: &EngineConfig, console: &mut Console) {
        console.register_cvar(
            "name",
            CvarValue::String(cfg.player_name.clone()),
            "Player name",
            CvarFlags::ARCHIVE,
        );
        console.register_cvar(
            "cl_sweep_interval",
            CvarValue::Float(cfg.sweep_interval_secs as f64),
            "Eviction sweep cadence, seconds",
            CvarFlags::NONE,
        );
        console.register_cvar(
            "cl_entity_stale",
            CvarValue::Float(cfg.entity_stale_secs as f64),
            "Staleness threshold before eviction, seconds",
            CvarFlags::NONE,
        );
        console.register_cvar(
            "cl_teleport_distance",
            CvarValue::Float(cfg.teleport_distance as f64),
            "Snap instead of interpolating past this distance",
            CvarFlags::NONE,
        );
    }

    /// Owns the read half of the connection. `FrameReader::recv` reads the
    /// length prefix and payload in two steps, so the future must run to
    /// completion per frame; a task does that regardless of poll cadence.
    /// The sender dropping is the connection-lost signal to `poll`.
    fn spawn_reader(mut reader: FrameReader) -> mpsc::UnboundedReceiver<ServerMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match reader.recv::<ServerMsg>().await {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "reader task stopped");
                        break;
                    }
                }
            }
        });
        rx
    }

    async fn dial(cfg: &EngineConfig, identity: &Identity) -> anyhow::Result<(Channel, SessionId)> {
        let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(&cfg.server_addr))
            .await
            .context("connect timed out")?
            .context("tcp connect")?;
        let mut channel = Channel::new(stream);

        channel
            .send(&ClientMsg::Join {
                protocol: PROTOCOL_VERSION,
                identity: identity.clone(),
            })
            .await?;

        let welcome: ServerMsg = time::timeout(DIAL_TIMEOUT, channel.recv())
            .await
            .context("handshake timed out")??;
        match welcome {
            ServerMsg::Welcome { session_id } => Ok((channel, session_id)),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.state() == ConnState::Connected && self.writer.is_some()
    }

    /// One event-loop turn: applies everything the reader task has
    /// buffered, runs due timers (heartbeat, sweep, spawn completion,
    /// reconnect). Never blocks.
    pub async fn poll(&mut self, now: Instant) -> anyhow::Result<()> {
        if self.writer.is_none() {
            self.maybe_reconnect(now).await;
            return Ok(());
        }

        self.sync_tunables();

        if now.duration_since(self.last_heartbeat) >= Duration::from_secs(self.cfg.heartbeat_secs)
        {
            self.last_heartbeat = now;
            self.send(&ClientMsg::Heartbeat {
                timestamp_ms: now_ms(),
            })
            .await;
        }

        // Drain the whole backlog; applying one message per poll would let
        // a burst of updates grow staler faster than it is consumed.
        let mut inbound = Vec::new();
        let mut closed = false;
        if let Some(rx) = self.net_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(msg) => inbound.push(msg),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        for msg in inbound {
            let server_close = matches!(msg, ServerMsg::Disconnect { .. });
            self.handle_server_msg(msg, now);
            if server_close {
                break;
            }
        }
        if closed && self.writer.is_some() {
            warn!("connection closed by peer");
            self.connection_lost(now, false);
        }

        let sweep_interval = self
            .console
            .get_cvar("cl_sweep_interval")
            .and_then(|v| v.as_float())
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| Duration::from_secs_f32(self.cfg.sweep_interval_secs));
        if now.duration_since(self.last_sweep) >= sweep_interval {
            self.last_sweep = now;
            self.reconciler
                .sweep(self.scene.as_mut(), &mut self.events, now);
            let store = self.reconciler.store();
            self.interp.retain(|id| store.contains(id));
        }

        self.drive_spawns(now);
        self.objects
            .compact_seen(now, Duration::from_secs(self.cfg.seen_compact_secs));
        Ok(())
    }

    /// Pushes the live console tunables into the components that use them,
    /// so `set` at the console changes running behavior.
    fn sync_tunables(&mut self) {
        if let Some(secs) = self
            .console
            .get_cvar("cl_entity_stale")
            .and_then(|v| v.as_float())
        {
            self.reconciler
                .set_stale_after(Duration::from_secs_f64(secs));
        }
        if let Some(dist) = self
            .console
            .get_cvar("cl_teleport_distance")
            .and_then(|v| v.as_float())
        {
            self.interp.set_teleport_distance(dist as f32);
        }
    }

    fn handle_server_msg(&mut self, msg: ServerMsg, now: Instant) {
        match msg {
            ServerMsg::EntityList(list) => self.apply_list(list, ListSource::Snapshot, now),
            ServerMsg::EntityListSync(list) => self.apply_list(list, ListSource::Sync, now),
            ServerMsg::EntityUpdate(record) => {
                self.reconciler
                    .apply_single_update(&record, &mut self.events, now);
                if self.reconciler.store().contains(record.id) {
                    self.interp
                        .set_target(record.id, record.position, record.orientation, now);
                }
            }
            ServerMsg::ObjectPlaced(obj) => {
                if self.objects.place(obj.clone()) {
                    self.events.push(WorldEvent::ObjectPlaced(obj));
                }
            }
            ServerMsg::WorldState(objects) => {
                debug!(count = objects.len(), "world state replay");
                for obj in objects {
                    if self.objects.place(obj.clone()) {
                        self.events.push(WorldEvent::ObjectPlaced(obj));
                    }
                }
            }
            ServerMsg::Chat { sender, name, text } => {
                self.events.push(ChatEvent { sender, name, text });
            }
            ServerMsg::Disconnect { reason } => {
                info!(%reason, "server closed the session");
                self.connection_lost(now, true);
            }
            ServerMsg::Welcome { .. } => {
                debug!("unexpected Welcome after handshake, ignored");
            }
        }
    }

    fn apply_list(&mut self, list: Vec<EntityRecord>, source: ListSource, now: Instant) {
        self.reconciler
            .apply_entity_list(&list, source, self.scene.as_mut(), &mut self.events, now);
        for record in &list {
            if self.reconciler.store().contains(record.id) {
                self.interp
                    .set_target(record.id, record.position, record.orientation, now);
            }
        }
        let store = self.reconciler.store();
        self.interp.retain(|id| store.contains(id));
    }

    /// Starts visual loads for fresh spawns and lands completed ones.
    fn drive_spawns(&mut self, now: Instant) {
        let fresh = self.reconciler.drain_pending_spawns();
        for record in fresh {
            match &self.avatars {
                Some(src) => {
                    let src = Arc::clone(src);
                    let tx = self.spawn_tx.clone();
                    let budget = Duration::from_secs(self.cfg.creation_timeout_secs);
                    tokio::spawn(async move {
                        let ok = matches!(time::timeout(budget, src.load(&record)).await, Ok(Ok(())));
                        let _ = tx.send((record.id, ok));
                    });
                }
                None => {
                    // No loader attached; creation completes inline.
                    self.reconciler.finish_creation(record.id, &mut self.events, now);
                }
            }
        }

        while let Ok((id, ok)) = self.spawn_rx.try_recv() {
            if !ok {
                warn!(?id, "avatar load failed, entity gets the placeholder visual");
            }
            if self.reconciler.finish_creation(id, &mut self.events, now) {
                if let Some(ent) = self.reconciler.store().get(id) {
                    self.interp
                        .set_target(id, ent.record.position, ent.record.orientation, now);
                }
            }
        }
    }

    /// Advances displayed transforms one render tick.
    pub fn render_tick(&mut self, now: Instant, dt: f32) {
        self.interp.tick(now, dt);
    }

    /// Sends this client's own transform/display state.
    pub async fn send_update(
        &mut self,
        position: Vec3,
        orientation: Orientation,
        carrying: bool,
        animation: Animation,
    ) {
        let record = EntityRecord {
            id: self.session_id,
            position,
            orientation,
            carrying,
            animation,
            timestamp_ms: now_ms(),
        };
        self.send(&ClientMsg::EntityUpdate(record)).await;
    }

    /// Places a building block. A coordinate already applied locally is
    /// rejected here with no network effect.
    pub async fn place_object(&mut self, coord: GridCoord, color: u32) -> bool {
        if self.objects.contains(coord) {
            debug!(?coord, "placement rejected, coordinate occupied");
            return false;
        }
        let obj = PlacedObject {
            coord,
            color,
            owner: self.session_id,
            placed_at_ms: now_ms(),
        };
        self.send(&ClientMsg::PlaceObject {
            coord,
            color,
            timestamp_ms: obj.placed_at_ms,
        })
        .await;
        if self.objects.place(obj.clone()) {
            self.events.push(WorldEvent::ObjectPlaced(obj));
        }
        true
    }

    pub async fn say(&mut self, text: &str) {
        self.send(&ClientMsg::Chat {
            text: text.to_string(),
        })
        .await;
    }

    /// Asks the server for a full object-log replay and entity list.
    pub async fn request_resync(&mut self) {
        self.send(&ClientMsg::Resync).await;
    }

    /// Expected, client-initiated close. No reconnect is scheduled; all
    /// remote entities are purged immediately.
    pub async fn disconnect(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.send(&ClientMsg::Disconnect).await;
        }
        self.writer = None;
        self.net_rx = None;
        self.retry_at = None;
        self.lifecycle.request_disconnection();
        self.reconciler.purge(&mut self.events);
        self.interp.retain(|_| false);
    }

    async fn send(&mut self, msg: &ClientMsg) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.send(msg).await {
            warn!(error = %e, "send failed");
            let now = Instant::now();
            self.connection_lost(now, false);
        }
    }

    fn connection_lost(&mut self, now: Instant, expected: bool) {
        self.writer = None;
        self.net_rx = None;
        match self.lifecycle.on_connection_lost(now, expected) {
            LossAction::Retry(delay) => {
                self.retry_at = Some(now + delay);
            }
            LossAction::GiveUp => {
                self.retry_at = None;
                self.reconciler.purge(&mut self.events);
                self.interp.retain(|_| false);
            }
        }
    }

    async fn maybe_reconnect(&mut self, now: Instant) {
        let Some(at) = self.retry_at else {
            return;
        };
        if now < at {
            return;
        }
        self.retry_at = None;

        // Pick up a name changed at the console since the last dial.
        if let Some(CvarValue::String(name)) = self.console.get_cvar("name") {
            self.identity.name = name;
        }

        match Self::dial(&self.cfg, &self.identity).await {
            Ok((channel, session_id)) => {
                self.lifecycle.on_connected(now);
                // Fresh session: the old observer identity is gone.
                self.reconciler.purge(&mut self.events);
                self.interp.retain(|_| false);
                self.reconciler.set_own_id(session_id);
                self.session_id = session_id;
                let (reader, writer) = channel.into_split();
                self.net_rx = Some(Self::spawn_reader(reader));
                self.writer = Some(writer);
                self.last_heartbeat = now;
                info!(?session_id, "reconnected");
            }
            Err(e) => {
                warn!(error = %e, "reconnect attempt failed");
                self.connection_lost(now, false);
            }
        }
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "status" => {
                let mut out = Vec::new();
                out.push(format!("State: {:?}", self.lifecycle.state()));
                out.push(format!("Session: {:?}", self.session_id));
                out.push(format!("Entities: {}", self.reconciler.store().len()));
                out.push(format!("Objects: {}", self.objects.len()));
                Ok(out)
            }
            "entities" => {
                let diag = self.reconciler.diagnostics(Instant::now());
                Ok(vec![serde_json::to_string_pretty(&diag)?])
            }
            "counters" => {
                let counters = self.reconciler.store().counters;
                Ok(vec![serde_json::to_string_pretty(&counters)?])
            }
            "say" => {
                let msg = tokens[1..].join(" ");
                self.say(&msg).await;
                Ok(Vec::new())
            }
            "resync" => {
                self.request_resync().await;
                Ok(vec!["Requested resync".to_string()])
            }
            "disconnect" => {
                self.disconnect().await;
                Ok(vec!["Disconnected".to_string()])
            }
            _ => self.console.exec(line),
        }
    }
}
