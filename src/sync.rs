// src/sync.rs
use crate::api::{AuthMode, DisplayApi};
use crate::signer;
use crate::sse::{self, Backoff, StreamSignal};
use crate::types::{HeartbeatReq, Manifest};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What the scheduler sees of the link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Closed,
}

/// Internal connection phase; `ConnectionState` is its public projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Authenticating,
    Syncing,
    Reconnecting,
    Closed,
}

impl SyncPhase {
    pub fn connection_state(self) -> ConnectionState {
        match self {
            SyncPhase::Syncing => ConnectionState::Connected,
            SyncPhase::Authenticating | SyncPhase::Reconnecting => ConnectionState::Reconnecting,
            SyncPhase::Idle | SyncPhase::Closed => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub manifest: Option<Arc<Manifest>>,
    /// Bumped on every committed fetch, including same-version refreshes.
    pub manifest_revision: u64,
    pub phase: SyncPhase,
    pub connection: ConnectionState,
    pub error_message: Option<String>,
    /// Set when connecting failed for good; playback cannot start.
    pub fatal: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            manifest: None,
            manifest_revision: 0,
            phase: SyncPhase::Idle,
            connection: ConnectionState::Closed,
            error_message: None,
            fatal: None,
            last_event_at: None,
            last_fetch_at: None,
        }
    }
}

#[derive(Debug)]
pub enum SyncEvent {
    Connect { authenticate: bool },
    Authenticated,
    /// `fatal` failures close the synchronizer; the rest retry with a new challenge.
    AuthFailed { message: String, fatal: bool },
    Stream(StreamSignal),
    PollTick,
    FetchCompleted {
        seq: u64,
        result: Result<Manifest, String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEffect {
    Authenticate,
    /// Start the connect sequence again after a backoff delay.
    RetryConnect,
    Fetch { seq: u64 },
    OpenStream,
}

/// Pure reducer behind the synchronizer. Every mutation of sync state goes
/// through `apply`, one event at a time.
#[derive(Debug, Default)]
pub struct SyncState {
    snapshot: SyncSnapshot,
    next_seq: u64,
    applied_seq: u64,
    fetch_error: Option<String>,
    stream_error: Option<String>,
}

impl SyncState {
    pub fn snapshot(&self) -> &SyncSnapshot {
        &self.snapshot
    }

    pub fn apply(&mut self, event: SyncEvent, now: DateTime<Utc>) -> Vec<SyncEffect> {
        if self.snapshot.phase == SyncPhase::Closed {
            if let SyncEvent::FetchCompleted { seq, .. } = event {
                debug!("discarding fetch #{seq} after close");
            }
            return Vec::new();
        }

        let effects = match event {
            SyncEvent::Connect { authenticate: true } => {
                self.set_phase(SyncPhase::Authenticating);
                vec![SyncEffect::Authenticate]
            }
            SyncEvent::Connect { authenticate: false } | SyncEvent::Authenticated => {
                self.set_phase(SyncPhase::Reconnecting);
                vec![self.issue_fetch(), SyncEffect::OpenStream]
            }
            SyncEvent::AuthFailed { message, fatal: true } => {
                error!("connect failed: {message}");
                self.snapshot.fatal = Some(message.clone());
                self.fetch_error = Some(message);
                self.set_phase(SyncPhase::Closed);
                Vec::new()
            }
            SyncEvent::AuthFailed { message, fatal: false } => {
                warn!("connect attempt failed, will retry: {message}");
                self.fetch_error = Some(message);
                self.set_phase(SyncPhase::Authenticating);
                vec![SyncEffect::RetryConnect]
            }
            SyncEvent::Stream(StreamSignal::Opened) => {
                self.stream_error = None;
                self.set_phase(SyncPhase::Syncing);
                Vec::new()
            }
            SyncEvent::Stream(StreamSignal::Message(_)) => {
                self.snapshot.last_event_at = Some(now);
                self.set_phase(SyncPhase::Syncing);
                vec![self.issue_fetch()]
            }
            SyncEvent::Stream(StreamSignal::Dropped(reason)) => {
                self.stream_error = Some(reason);
                self.set_phase(SyncPhase::Reconnecting);
                Vec::new()
            }
            SyncEvent::PollTick => match self.snapshot.phase {
                SyncPhase::Syncing | SyncPhase::Reconnecting => vec![self.issue_fetch()],
                _ => Vec::new(),
            },
            SyncEvent::FetchCompleted { seq, result } => {
                self.complete_fetch(seq, result, now);
                Vec::new()
            }
            SyncEvent::Shutdown => {
                self.set_phase(SyncPhase::Closed);
                Vec::new()
            }
        };
        self.snapshot.error_message = self.fetch_error.clone().or_else(|| self.stream_error.clone());
        effects
    }

    fn issue_fetch(&mut self) -> SyncEffect {
        self.next_seq += 1;
        SyncEffect::Fetch { seq: self.next_seq }
    }

    fn complete_fetch(&mut self, seq: u64, result: Result<Manifest, String>, now: DateTime<Utc>) {
        match result {
            Ok(_) if seq <= self.applied_seq => {
                debug!("discarding stale fetch #{seq}; #{} already applied", self.applied_seq);
            }
            Ok(manifest) => {
                self.applied_seq = seq;
                self.fetch_error = None;
                self.snapshot.last_fetch_at = Some(now);
                self.snapshot.manifest_revision += 1;
                self.snapshot.manifest = Some(Arc::new(manifest));
            }
            Err(message) if seq <= self.applied_seq => {
                debug!("ignoring failure of stale fetch #{seq}: {message}");
            }
            Err(message) => {
                warn!("manifest fetch #{seq} failed: {message}");
                self.fetch_error = Some(message);
            }
        }
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.snapshot.phase != phase {
            debug!("sync phase {:?} -> {:?}", self.snapshot.phase, phase);
        }
        self.snapshot.phase = phase;
        self.snapshot.connection = phase.connection_state();
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stream_retry_min: Duration,
    pub stream_retry_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            stream_retry_min: Duration::from_secs(1),
            stream_retry_max: Duration::from_secs(30),
        }
    }
}

/// Handle to the running synchronizer task.
pub struct Synchronizer {
    snapshot_rx: watch::Receiver<SyncSnapshot>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Synchronizer {
    pub fn spawn(api: DisplayApi, auth: AuthMode, config: SyncConfig) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connect_backoff = Backoff::new(config.stream_retry_min, config.stream_retry_max);
        let actor = SyncActor {
            api,
            auth,
            config,
            state: SyncState::default(),
            snapshot_tx,
            events_tx,
            stream_task: None,
            connect_backoff,
            retry_task: None,
        };
        let task = tokio::spawn(actor.run(events_rx, shutdown_rx));
        Self {
            snapshot_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Stops timers and the stream; results of in-flight fetches are dropped.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("synchronizer task ended abnormally: {e}");
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct SyncActor {
    api: DisplayApi,
    auth: AuthMode,
    config: SyncConfig,
    state: SyncState,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    stream_task: Option<JoinHandle<()>>,
    connect_backoff: Backoff,
    retry_task: Option<JoinHandle<()>>,
}

impl SyncActor {
    async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<SyncEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        info!("synchronizer starting for {}", self.auth.label());
        self.dispatch(SyncEvent::Connect {
            authenticate: self.auth.is_signed(),
        });

        let start = Instant::now();
        let mut poll = interval_at(start + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeats = self.auth.is_signed();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                Some(event) = events_rx.recv() => self.dispatch(event),
                _ = poll.tick() => self.dispatch(SyncEvent::PollTick),
                _ = heartbeat.tick(), if heartbeats => self.heartbeat(),
            }
            if self.state.snapshot().phase == SyncPhase::Closed {
                break;
            }
        }

        for task in [self.stream_task.take(), self.retry_task.take()].into_iter().flatten() {
            task.abort();
        }
        self.dispatch(SyncEvent::Shutdown);
        info!("synchronizer stopped for {}", self.auth.label());
    }

    fn dispatch(&mut self, event: SyncEvent) {
        if matches!(event, SyncEvent::Authenticated) {
            self.connect_backoff.reset();
        }
        let effects = self.state.apply(event, Utc::now());
        self.snapshot_tx.send_replace(self.state.snapshot().clone());
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: SyncEffect) {
        match effect {
            SyncEffect::Authenticate => {
                let AuthMode::Signed(creds) = self.auth.clone() else {
                    let _ = self.events_tx.send(SyncEvent::Authenticated);
                    return;
                };
                let api = self.api.clone();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let event = match signer::authenticate(&api, &creds).await {
                        Ok(()) => SyncEvent::Authenticated,
                        Err(e) => SyncEvent::AuthFailed {
                            message: e.to_string(),
                            fatal: e.is_fatal(),
                        },
                    };
                    let _ = tx.send(event);
                });
            }
            SyncEffect::RetryConnect => {
                let delay = self.connect_backoff.next_delay();
                info!("retrying connect for {} in {delay:?}", self.auth.label());
                let tx = self.events_tx.clone();
                self.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SyncEvent::Connect { authenticate: true });
                }));
            }
            SyncEffect::Fetch { seq } => {
                let api = self.api.clone();
                let auth = self.auth.clone();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = api.fetch_manifest(&auth).await.map_err(|e| e.to_string());
                    let _ = tx.send(SyncEvent::FetchCompleted { seq, result });
                });
            }
            SyncEffect::OpenStream => {
                if let Some(task) = self.stream_task.take() {
                    task.abort();
                }
                let backoff = Backoff::new(self.config.stream_retry_min, self.config.stream_retry_max);
                let api = self.api.clone();
                let auth = self.auth.clone();
                let events_tx = self.events_tx.clone();
                // Stream and forwarder share one task; aborting it closes the connection.
                self.stream_task = Some(tokio::spawn(async move {
                    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
                    let forward = async move {
                        while let Some(signal) = signal_rx.recv().await {
                            if events_tx.send(SyncEvent::Stream(signal)).is_err() {
                                break;
                            }
                        }
                    };
                    tokio::join!(sse::run_stream(api, auth, backoff, signal_tx), forward);
                }));
            }
        }
    }

    fn heartbeat(&self) {
        let AuthMode::Signed(creds) = self.auth.clone() else {
            return;
        };
        let api = self.api.clone();
        let body = HeartbeatReq {
            sent_at: Utc::now(),
            playlist_version: self
                .state
                .snapshot()
                .manifest
                .as_ref()
                .map(|m| m.playlist_version.clone()),
        };
        tokio::spawn(async move {
            if let Err(e) = api.send_heartbeat(&creds, &body).await {
                warn!("heartbeat failed: {e}");
            }
        });
    }
}
