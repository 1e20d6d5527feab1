// src/runtime.rs
use crate::player::{PlayerController, Tick};
use crate::sync::{ConnectionState, SyncSnapshot};
use crate::timing::{
    build_runtime_timings, MeasuredHeights, RuntimeTiming, ScrollPlan, TimingConfig, Viewport,
};
use crate::types::{Manifest, ManifestItem};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How a newly fetched manifest was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestApply {
    /// New playlist version: play head back to 0, measured heights dropped.
    Reset,
    /// Same version: contents swapped, play head and heights kept.
    InPlace,
}

/// Manifest, measurements and viewport, with the timings derived from them.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    manifest: Option<Arc<Manifest>>,
    measured: MeasuredHeights,
    viewport: Viewport,
    timings: Vec<RuntimeTiming>,
}

impl PlaybackState {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            manifest: None,
            measured: MeasuredHeights::new(),
            viewport,
            timings: Vec::new(),
        }
    }

    pub fn manifest(&self) -> Option<&Arc<Manifest>> {
        self.manifest.as_ref()
    }

    pub fn measured(&self) -> &MeasuredHeights {
        &self.measured
    }

    pub fn timings(&self) -> &[RuntimeTiming] {
        &self.timings
    }

    pub fn item(&self, index: usize) -> Option<&ManifestItem> {
        self.manifest.as_ref().and_then(|m| m.items.get(index))
    }

    pub fn apply_manifest(&mut self, manifest: Arc<Manifest>) -> ManifestApply {
        let outcome = match &self.manifest {
            Some(current) if current.playlist_version == manifest.playlist_version => {
                ManifestApply::InPlace
            }
            _ => {
                self.measured.clear();
                ManifestApply::Reset
            }
        };
        self.manifest = Some(manifest);
        self.recompute();
        outcome
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        if self.viewport == viewport {
            return false;
        }
        self.viewport = viewport;
        self.recompute();
        true
    }

    /// Caches a rendered height. Unknown item ids are ignored.
    pub fn record_height(&mut self, item_id: &str, height_px: f64) -> bool {
        let known = self
            .manifest
            .as_ref()
            .is_some_and(|m| m.items.iter().any(|i| i.id == item_id));
        if !known || !height_px.is_finite() || height_px < 0.0 {
            return false;
        }
        if self.measured.get(item_id) == Some(&height_px) {
            return false;
        }
        self.measured.insert(item_id.to_string(), height_px);
        self.recompute();
        true
    }

    fn recompute(&mut self) {
        self.timings = match &self.manifest {
            Some(m) => build_runtime_timings(
                &m.items,
                self.viewport,
                TimingConfig {
                    scroll_pixels_per_second: m.runtime_settings.scroll_px_per_second,
                },
                &self.measured,
            ),
            None => Vec::new(),
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub playlist_version: String,
    pub index: usize,
    pub item: ManifestItem,
    pub timing: RuntimeTiming,
    pub scroll: Option<ScrollPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Starting,
    Playing,
    /// Manifest has no items.
    Idle,
    /// Connect failed for good; shown on screen in place of content.
    Fatal(String),
}

/// Inputs from the renderer side.
#[derive(Debug, Clone)]
pub enum RuntimeInput {
    ViewportResized(Viewport),
    HeightMeasured { item_id: String, height_px: f64 },
    MediaEnded { index: usize },
}

/// The scheduler actor: consumes sync snapshots and renderer inputs, drives the
/// play head, publishes what should be on screen.
pub struct DisplayRuntime {
    input_tx: mpsc::UnboundedSender<RuntimeInput>,
    now_playing_rx: watch::Receiver<Option<NowPlaying>>,
    status_rx: watch::Receiver<RuntimeStatus>,
    connection_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DisplayRuntime {
    pub fn spawn(sync_rx: watch::Receiver<SyncSnapshot>, viewport: Viewport) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (now_playing_tx, now_playing_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(RuntimeStatus::Starting);
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Closed);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let actor = RuntimeActor {
            state: PlaybackState::new(viewport),
            player: None,
            generation: 0,
            manifest_revision: 0,
            tick_tx,
            now_playing_tx,
            status_tx,
            connection_tx,
        };
        let task = tokio::spawn(actor.run(sync_rx, input_rx, tick_rx, shutdown_rx));
        Self {
            input_tx,
            now_playing_rx,
            status_rx,
            connection_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub fn now_playing(&self) -> watch::Receiver<Option<NowPlaying>> {
        self.now_playing_rx.clone()
    }

    pub fn status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status_rx.clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_rx.clone()
    }

    pub fn viewport_resized(&self, viewport: Viewport) {
        let _ = self.input_tx.send(RuntimeInput::ViewportResized(viewport));
    }

    pub fn height_measured(&self, item_id: &str, height_px: f64) {
        let _ = self.input_tx.send(RuntimeInput::HeightMeasured {
            item_id: item_id.to_string(),
            height_px,
        });
    }

    pub fn media_ended(&self, index: usize) {
        let _ = self.input_tx.send(RuntimeInput::MediaEnded { index });
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("runtime task ended abnormally: {e}");
        }
    }
}

impl Drop for DisplayRuntime {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct RuntimeActor {
    state: PlaybackState,
    player: Option<PlayerController>,
    /// Bumped per controller so ticks from a replaced one are ignored.
    generation: u64,
    manifest_revision: u64,
    tick_tx: mpsc::UnboundedSender<(u64, Tick)>,
    now_playing_tx: watch::Sender<Option<NowPlaying>>,
    status_tx: watch::Sender<RuntimeStatus>,
    connection_tx: watch::Sender<ConnectionState>,
}

impl RuntimeActor {
    async fn run(
        mut self,
        mut sync_rx: watch::Receiver<SyncSnapshot>,
        mut input_rx: mpsc::UnboundedReceiver<RuntimeInput>,
        mut tick_rx: mpsc::UnboundedReceiver<(u64, Tick)>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let initial = sync_rx.borrow_and_update().clone();
        self.on_snapshot(&initial);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                changed = sync_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = sync_rx.borrow_and_update().clone();
                    self.on_snapshot(&snapshot);
                }
                Some(input) = input_rx.recv() => self.on_input(input),
                Some((generation, tick)) = tick_rx.recv() => {
                    if generation == self.generation {
                        self.publish_now_playing(tick.index);
                    }
                }
            }
        }

        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        self.connection_tx.send_replace(ConnectionState::Closed);
        info!("display runtime stopped");
    }

    fn on_snapshot(&mut self, snapshot: &SyncSnapshot) {
        self.connection_tx.send_replace(snapshot.connection);

        if let Some(message) = &snapshot.fatal {
            if self.state.manifest().is_none() {
                error!("runtime halted: {message}");
                self.status_tx
                    .send_replace(RuntimeStatus::Fatal(message.clone()));
            }
            return;
        }

        if snapshot.manifest_revision == self.manifest_revision {
            return;
        }
        self.manifest_revision = snapshot.manifest_revision;
        let Some(manifest) = snapshot.manifest.clone() else {
            return;
        };

        let version = manifest.playlist_version.clone();
        match self.state.apply_manifest(manifest) {
            ManifestApply::Reset => {
                info!("playlist version {version}: restarting at item 0");
                self.restart_player();
            }
            ManifestApply::InPlace => self.refresh_player(),
        }
    }

    fn on_input(&mut self, input: RuntimeInput) {
        match input {
            RuntimeInput::ViewportResized(viewport) => {
                if self.state.set_viewport(viewport) {
                    self.refresh_player();
                }
            }
            RuntimeInput::HeightMeasured { item_id, height_px } => {
                if self.state.record_height(&item_id, height_px) {
                    info!("measured {item_id} at {height_px}px; timings corrected");
                    self.refresh_player();
                }
            }
            RuntimeInput::MediaEnded { index } => {
                if let Some(player) = &self.player {
                    player.media_ended(index);
                }
            }
        }
    }

    fn restart_player(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        self.generation += 1;
        let generation = self.generation;
        let tick_tx = self.tick_tx.clone();
        let mut player = PlayerController::new(self.state.timings().to_vec(), 0, move |tick| {
            let _ = tick_tx.send((generation, tick));
        });
        if player.start() {
            self.status_tx.send_replace(RuntimeStatus::Playing);
            self.publish_now_playing(0);
        } else {
            self.status_tx.send_replace(RuntimeStatus::Idle);
            self.now_playing_tx.send_replace(None);
        }
        self.player = Some(player);
    }

    /// Same playlist, new timings: keep the head where it is.
    fn refresh_player(&mut self) {
        let Some(player) = self.player.as_mut() else {
            self.restart_player();
            return;
        };
        let was_running = player.is_running();
        player.update_timings(self.state.timings().to_vec());
        if !was_running {
            // Item list went from empty to non-empty under the same version.
            self.restart_player();
            return;
        }
        if !player.is_running() && self.state.timings().is_empty() {
            self.status_tx.send_replace(RuntimeStatus::Idle);
            self.now_playing_tx.send_replace(None);
            return;
        }
        let index = player.current_index();
        self.publish_now_playing(index);
    }

    fn publish_now_playing(&self, index: usize) {
        let (Some(manifest), Some(item), Some(timing)) = (
            self.state.manifest(),
            self.state.item(index),
            self.state.timings().get(index),
        ) else {
            return;
        };
        self.now_playing_tx.send_replace(Some(NowPlaying {
            playlist_version: manifest.playlist_version.clone(),
            index,
            item: item.clone(),
            timing: timing.clone(),
            scroll: timing.scroll_plan(),
        }));
    }
}
