//! Realtime Reconciler
//!
//! Follows the remote change feed. Notifications outside the loaded
//! project are ignored, our own writes echoing back are dropped, and
//! everything else triggers a full refresh. Refreshes are debounced: the
//! first notification refreshes at once, later ones inside the window are
//! coalesced into a single trailing refresh when the window closes.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{sleep_until, Instant};

use crate::domain::{ChangeEvent, ChangePayload, Table};
use crate::echo::{EchoKey, EchoSource};
use crate::gateway::{Notice, Organizer};
use crate::repository::RemoteStore;

/// What happened to one notification (or deadline)
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Not part of the loaded hierarchy
    OutOfScope,
    /// Our own write coming back
    Echo,
    /// The Entity Store was re-fetched
    Refreshed,
    /// Coalesced into the refresh at the end of the debounce window
    Deferred,
    /// The re-fetch failed; local state was kept
    RefreshFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    Debounced {
        until: Instant,
        /// A notification arrived inside the window
        pending: bool,
        /// Last actor seen inside the window
        actor: Option<String>,
    },
}

/// Whether a trigger refreshes now or waits for the window to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    RefreshNow,
    Defer,
}

/// Debounce state machine
#[derive(Debug)]
pub struct Reconciler {
    window: Duration,
    phase: Phase,
}

impl Reconciler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            phase: Phase::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// A trailing refresh is owed when the window closes
    pub fn has_pending(&self) -> bool {
        matches!(self.phase, Phase::Debounced { pending: true, .. })
    }

    /// When the current window closes
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Idle => None,
            Phase::Debounced { until, .. } => Some(until),
        }
    }

    fn on_trigger(&mut self, actor: Option<String>, now: Instant) -> Decision {
        if let Phase::Debounced { until, pending, actor: last } = &mut self.phase {
            if now < *until {
                *pending = true;
                *last = actor;
                return Decision::Defer;
            }
        }
        self.open_window(now);
        Decision::RefreshNow
    }

    /// Close an elapsed window; returns the actor to announce when a
    /// trailing refresh is owed
    fn on_deadline(&mut self, now: Instant) -> Option<Option<String>> {
        let Phase::Debounced { until, pending, actor } = &mut self.phase else {
            return None;
        };
        if now < *until {
            return None;
        }
        if *pending {
            let actor = actor.take();
            self.open_window(now);
            Some(actor)
        } else {
            self.phase = Phase::Idle;
            None
        }
    }

    fn open_window(&mut self, now: Instant) {
        self.phase = Phase::Debounced {
            until: now + self.window,
            pending: false,
            actor: None,
        };
    }
}

enum Wake {
    Event(Result<ChangeEvent, RecvError>),
    Deadline,
}

impl<S: RemoteStore> Organizer<S> {
    /// Handle one inbound notification
    pub async fn handle_remote_event(&mut self, event: ChangeEvent) -> ReconcileOutcome {
        let key = echo_key(&event);
        if !self.in_scope(&event) {
            // Cascaded rows of a group we deleted land here; their tags are spent
            if let Some(key) = key {
                self.echoes.take(&key);
            }
            return ReconcileOutcome::OutOfScope;
        }
        if let Some(key) = key {
            if self.echoes.take(&key) {
                debug!("Dropped echo of {:?}", key);
                return ReconcileOutcome::Echo;
            }
        }
        self.trigger_refresh(event.actor).await
    }

    /// Wait for the next notification or the end of the debounce window.
    ///
    /// Returns None once the feed is closed; the engine then keeps working
    /// on its last known state.
    pub async fn poll_realtime(&mut self) -> Option<ReconcileOutcome> {
        loop {
            let deadline = self.reconciler.deadline();
            let feed = self.feed.as_mut()?;
            let wake = match deadline {
                Some(at) => tokio::select! {
                    received = feed.recv() => Wake::Event(received),
                    _ = sleep_until(at) => Wake::Deadline,
                },
                None => Wake::Event(feed.recv().await),
            };

            match wake {
                Wake::Deadline => {
                    if let Some(actor) = self.reconciler.on_deadline(Instant::now()) {
                        return Some(self.remote_refresh(actor).await);
                    }
                }
                Wake::Event(Ok(event)) => return Some(self.handle_remote_event(event).await),
                Wake::Event(Err(RecvError::Lagged(missed))) => {
                    warn!("Change feed lagged, {} notifications missed", missed);
                    return Some(self.trigger_refresh(None).await);
                }
                Wake::Event(Err(RecvError::Closed)) => {
                    self.stop_realtime("change feed closed");
                    return None;
                }
            }
        }
    }

    /// Handle every notification already buffered, without waiting.
    ///
    /// Also runs a trailing refresh whose window has already closed.
    pub async fn process_pending(&mut self) -> Vec<ReconcileOutcome> {
        let mut outcomes = Vec::new();
        if let Some(actor) = self.reconciler.on_deadline(Instant::now()) {
            outcomes.push(self.remote_refresh(actor).await);
        }

        loop {
            let Some(feed) = self.feed.as_mut() else {
                break;
            };
            match feed.try_recv() {
                Ok(event) => outcomes.push(self.handle_remote_event(event).await),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Change feed lagged, {} notifications missed", missed);
                    outcomes.push(self.trigger_refresh(None).await);
                }
                Err(TryRecvError::Closed) => {
                    self.stop_realtime("change feed closed");
                    break;
                }
            }
        }
        outcomes
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn in_scope(&self, event: &ChangeEvent) -> bool {
        match event.table() {
            Table::Groups => event.project_id() == Some(self.config.project_id.as_str()),
            Table::Items => event.item_groups().iter().any(|g| self.store.group(*g).is_some()),
        }
    }

    async fn trigger_refresh(&mut self, actor: Option<String>) -> ReconcileOutcome {
        match self.reconciler.on_trigger(actor.clone(), Instant::now()) {
            Decision::RefreshNow => self.remote_refresh(actor).await,
            Decision::Defer => ReconcileOutcome::Deferred,
        }
    }

    async fn remote_refresh(&mut self, actor: Option<String>) -> ReconcileOutcome {
        match self.refresh().await {
            Ok(()) => {
                info!("Refreshed after a change by {}", actor.as_deref().unwrap_or("someone"));
                self.notify(Notice::RemoteChange { actor });
                ReconcileOutcome::Refreshed
            }
            Err(e) => {
                warn!("Refresh after remote change failed: {}", e);
                ReconcileOutcome::RefreshFailed(e.to_string())
            }
        }
    }

    fn stop_realtime(&mut self, reason: &str) {
        warn!("Realtime stopped: {}", reason);
        self.feed = None;
        self.notify(Notice::RealtimeStopped {
            reason: reason.to_string(),
        });
    }
}

fn echo_key(event: &ChangeEvent) -> Option<EchoKey> {
    match &event.payload {
        ChangePayload::Groups { before, after } => after.as_ref().or(before.as_ref()).map(EchoSource::echo_key),
        ChangePayload::Items { before, after } => after.as_ref().or(before.as_ref()).map(EchoSource::echo_key),
    }
}
