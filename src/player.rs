// src/player.rs
//! Looping play head over a list of `RuntimeTiming`s.
//!
//! The controller owns one timer task. Each item is armed for its dwell; when
//! the timer fires (or the media player reports end of video) the index moves
//! to `(index + 1) % len` and `on_tick` is called with the new index. The list
//! never ends: the last item wraps to the first.
//!
//! Timings can be swapped while running (same playlist, corrected heights,
//! viewport changes). The current item keeps its original arm time, so a
//! longer dwell extends the running timer and a shorter one that has already
//! elapsed advances right away. If the new list is shorter than the current
//! index, the head wraps to the first item and its dwell starts over.
use crate::timing::{Advance, RuntimeTiming};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Floor for timer-driven items so a zero authored duration cannot spin.
pub const MIN_DWELL_SECONDS: f64 = 1.0;
/// Ceiling for timer-driven items. Longer or infinite dwells wait one day; NaN gets the floor.
pub const MAX_DWELL_SECONDS: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub index: usize,
}

type OnTick = Arc<dyn Fn(Tick) + Send + Sync>;

enum Control {
    /// `rearm` restarts the dwell clock of the item the head now points at.
    Timings {
        timings: Arc<Vec<RuntimeTiming>>,
        rearm: bool,
    },
    MediaEnded(usize),
}

pub struct PlayerController {
    timings: Arc<Vec<RuntimeTiming>>,
    current: Arc<AtomicUsize>,
    on_tick: OnTick,
    running: Option<(JoinHandle<()>, mpsc::UnboundedSender<Control>)>,
}

impl PlayerController {
    pub fn new(
        timings: Vec<RuntimeTiming>,
        initial_index: usize,
        on_tick: impl Fn(Tick) + Send + Sync + 'static,
    ) -> Self {
        let start = if timings.is_empty() {
            0
        } else {
            initial_index % timings.len()
        };
        Self {
            timings: Arc::new(timings),
            current: Arc::new(AtomicUsize::new(start)),
            on_tick: Arc::new(on_tick),
            running: None,
        }
    }

    /// Arms the timer for the current item. Returns false for an empty list.
    pub fn start(&mut self) -> bool {
        if self.timings.is_empty() {
            return false;
        }
        if self.is_running() {
            return true;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            self.timings.clone(),
            self.current.clone(),
            self.on_tick.clone(),
            rx,
        ));
        self.running = Some((task, tx));
        true
    }

    pub fn stop(&mut self) {
        if let Some((task, _)) = self.running.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(task, _)| !task.is_finished())
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn timings(&self) -> &[RuntimeTiming] {
        &self.timings
    }

    /// Replaces timings without moving the play head or restarting its timer,
    /// unless the head falls off the end of the new list. Then it wraps to 0
    /// before this returns, so `current_index` is valid for the new timings.
    pub fn update_timings(&mut self, timings: Vec<RuntimeTiming>) {
        self.timings = Arc::new(timings);
        if self.timings.is_empty() {
            self.stop();
            self.current.store(0, Ordering::SeqCst);
            return;
        }
        let wrapped = self.current_index() >= self.timings.len();
        if wrapped {
            debug!("play head wrapped by a shorter list of {}", self.timings.len());
            self.current.store(0, Ordering::SeqCst);
        }
        if let Some((_, tx)) = &self.running {
            let _ = tx.send(Control::Timings {
                timings: self.timings.clone(),
                rearm: wrapped,
            });
        }
    }

    /// End of media for the item at `index`; ignored if the head has moved on.
    pub fn media_ended(&self, index: usize) {
        if let Some((_, tx)) = &self.running {
            let _ = tx.send(Control::MediaEnded(index));
        }
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn drive(
    mut timings: Arc<Vec<RuntimeTiming>>,
    current: Arc<AtomicUsize>,
    on_tick: OnTick,
    mut rx: mpsc::UnboundedReceiver<Control>,
) {
    let mut armed_at = Instant::now();
    loop {
        if timings.is_empty() {
            return;
        }
        let mut index = current.load(Ordering::SeqCst);
        if index >= timings.len() {
            // An advance raced a shrinking update.
            index = 0;
            current.store(0, Ordering::SeqCst);
            armed_at = Instant::now();
            on_tick(Tick { index });
        }

        let advance = timings[index].advance;
        let deadline = match advance {
            Advance::Timer => armed_at.checked_add(dwell(timings[index].dwell_seconds)),
            Advance::MediaEnd => None,
        };

        let advanced_at = tokio::select! {
            _ = wait_until(deadline) => deadline.unwrap_or_else(Instant::now),
            control = rx.recv() => match control {
                None => return,
                Some(Control::Timings { timings: next, rearm }) => {
                    timings = next;
                    if rearm {
                        armed_at = Instant::now();
                    }
                    continue;
                }
                Some(Control::MediaEnded(ended)) if ended == index && advance == Advance::MediaEnd => {
                    Instant::now()
                }
                Some(Control::MediaEnded(_)) => continue,
            },
        };

        let next = (index + 1) % timings.len();
        current.store(next, Ordering::SeqCst);
        armed_at = advanced_at;
        debug!("play head {index} -> {next}");
        on_tick(Tick { index: next });
    }
}

fn dwell(seconds: f64) -> Duration {
    let seconds = if seconds.is_nan() {
        MIN_DWELL_SECONDS
    } else {
        seconds.clamp(MIN_DWELL_SECONDS, MAX_DWELL_SECONDS)
    };
    Duration::from_secs_f64(seconds)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
