//! Sessions
//!
//! A session binds one reactive runtime to one client. It owns the named
//! inputs and outputs, turns client events into cell mutations, and answers
//! each event with an [`OutputFrame`] holding exactly the outputs that event
//! invalidated.
//!
//! # Event handling
//!
//! Every entry point takes the session gate, applies its mutations as one
//! batch and flushes. A flush round:
//!
//! 1. Drains the runtime (observers run, outputs are marked dirty).
//! 2. Pulls every dirty output and records its value. Cells frozen during
//!    the drain are still frozen here, so outputs reading them are cleared.
//! 3. Awaits the futures of async observers that ran, then starts another
//!    round for whatever they changed.
//!
//! The frame is returned once a round produces nothing new.

mod directive;
mod progress;
mod registry;
mod wire;

pub use directive::{Directive, Modal, Notification, NotificationLevel};
pub use progress::Progress;
pub use registry::SessionRegistry;
pub use wire::{ClientMessage, FailureReport, OutputFrame};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ReactiveError, Result};
use crate::reactive::{
    Cell, Computed, FlushReport, Observer, ObserverBuilder, Runtime, Trigger,
};

/// Identifies a session within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One client's reactive session.
///
/// Cloning yields another handle to the same session. Observers that need
/// to emit directives capture a clone; [`Session::close`] breaks the
/// resulting reference cycle.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    runtime: Runtime,
    inputs: RwLock<IndexMap<String, Cell<Value>>>,
    outputs: RwLock<IndexMap<String, Computed<Value>>>,
    /// Serializes event handling, including awaits of async observers.
    gate: Mutex<()>,
    notifications: AtomicU64,
    progress_bars: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.runtime.dispose_all();
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let id = SessionId::new();
        let runtime = Runtime::with_config(config.runtime_config());
        info!(session = %id, runtime = %runtime.id(), "session opened");

        Self {
            inner: Arc::new(SessionInner {
                id,
                runtime,
                inputs: RwLock::new(IndexMap::new()),
                outputs: RwLock::new(IndexMap::new()),
                gate: Mutex::new(()),
                notifications: AtomicU64::new(0),
                progress_bars: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// The cell behind input `name`, created empty on first use.
    pub fn input(&self, name: &str) -> Cell<Value> {
        if let Some(cell) = self.inner.inputs.read().get(name) {
            return cell.clone();
        }
        self.inner
            .inputs
            .write()
            .entry(name.to_string())
            .or_insert_with(|| self.inner.runtime.named_cell(name, None))
            .clone()
    }

    /// Tracked read of input `name`.
    pub fn input_value(&self, name: &str) -> Result<Value> {
        self.input(name).get()
    }

    /// Tracked read of input `name`, deserialized.
    pub fn input_as<T>(&self, name: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        Ok(serde_json::from_value(self.input_value(name)?)?)
    }

    /// Trigger on input `name`. `null` counts as unset.
    pub fn trigger(&self, name: &str) -> Trigger {
        Trigger::cell_when(&self.input(name), |value| !value.is_null())
    }

    /// Trigger on action button `name`. A button that was never clicked
    /// reports a count of zero, which counts as unset.
    pub fn action_trigger(&self, name: &str) -> Trigger {
        Trigger::cell_when(&self.input(name), |value| {
            value.as_f64().is_some_and(|clicks| clicks > 0.0)
        })
    }

    // ------------------------------------------------------------------
    // Outputs and observers
    // ------------------------------------------------------------------

    /// Register output `name`. Its value is sent whenever it is invalidated.
    ///
    /// Registering a name again replaces the previous binding.
    pub fn output<T, F>(&self, name: &str, render: F) -> Computed<Value>
    where
        T: Serialize,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let computed = self
            .inner
            .runtime
            .output(name, move || Ok(serde_json::to_value(render()?)?));

        let replaced = self
            .inner
            .outputs
            .write()
            .insert(name.to_string(), computed.clone());
        if replaced.is_some() {
            debug!(session = %self.inner.id, output = name, "output binding replaced");
        }
        drop(replaced);
        computed
    }

    /// Evaluate output `name` now.
    pub fn pull(&self, name: &str) -> Result<Value> {
        let computed = self
            .inner
            .outputs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ReactiveError::UnknownOutput(name.to_string()))?;
        computed.get()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.inner.outputs.read().keys().cloned().collect()
    }

    pub fn observe<F>(&self, run: F) -> Observer
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.inner.runtime.observer(run)
    }

    pub fn build_observer(&self) -> ObserverBuilder {
        self.inner.runtime.build_observer()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Set input `name` and flush.
    pub async fn apply_input(&self, name: &str, value: Value) -> OutputFrame {
        let _gate = self.inner.gate.lock().await;
        self.input(name).set(value);
        self.flush_locked().await
    }

    /// Set input `name`, invalidating its dependents even if the value is
    /// unchanged, and flush.
    pub async fn apply_event(&self, name: &str, value: Value) -> OutputFrame {
        let _gate = self.inner.gate.lock().await;
        self.input(name).set_force(value);
        self.flush_locked().await
    }

    /// Set several inputs as one event and flush once.
    pub async fn apply_inputs<I>(&self, values: I) -> OutputFrame
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let _gate = self.inner.gate.lock().await;
        self.inner.runtime.batch(|| {
            for (name, value) in values {
                self.input(&name).set(value);
            }
        });
        self.flush_locked().await
    }

    /// Deliver pending work without changing any input.
    pub async fn flush(&self) -> OutputFrame {
        let _gate = self.inner.gate.lock().await;
        self.flush_locked().await
    }

    pub async fn handle_message(&self, message: ClientMessage) -> OutputFrame {
        match message {
            ClientMessage::Input {
                name,
                value,
                force: false,
            } => self.apply_input(&name, value).await,
            ClientMessage::Input {
                name,
                value,
                force: true,
            } => self.apply_event(&name, value).await,
            ClientMessage::Inputs { values } => self.apply_inputs(values).await,
            ClientMessage::Flush => self.flush().await,
        }
    }

    /// Decode one MessagePack client message, handle it and encode the
    /// resulting frame.
    pub async fn handle_frame(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let message = ClientMessage::decode(bytes)?;
        self.handle_message(message).await.encode()
    }

    async fn flush_locked(&self) -> OutputFrame {
        let runtime = &self.inner.runtime;
        let max_rounds = runtime.config().max_flush_cycles;
        let mut frame = OutputFrame::default();
        let mut rounds = 0;

        loop {
            // Outputs are pulled before this flush's freezes expire
            let idle = runtime.flush_with(|report| {
                let idle = report.is_empty();
                self.collect(report, &mut frame);
                idle
            });

            let deferred = runtime.take_deferred();
            if idle && deferred.is_empty() {
                break;
            }

            rounds += 1;
            if rounds >= max_rounds {
                warn!(session = %self.inner.id, rounds, "session flush round limit reached");
                break;
            }

            for task in deferred {
                let batch = runtime.hold();
                let result = task.future.await;
                drop(batch);

                if !runtime.contains(task.node) {
                    debug!(node = %task.node, "observer destroyed while awaiting; result discarded");
                    continue;
                }
                match result {
                    Ok(()) => {}
                    Err(err) if err.is_silent() => {
                        debug!(node = %task.node, error = %err, "async observer short-circuited");
                    }
                    Err(err) => runtime.report_failure(task.node, err.within(&task.label)),
                }
            }
        }

        debug!(
            session = %self.inner.id,
            values = frame.values.len(),
            cleared = frame.cleared.len(),
            directives = frame.directives.len(),
            "frame ready"
        );
        frame
    }

    fn collect(&self, report: FlushReport, frame: &mut OutputFrame) {
        frame.directives.extend(report.directives);
        frame
            .failures
            .extend(report.failures.into_iter().map(|failure| FailureReport {
                node: failure.label,
                message: failure.error.to_string(),
            }));

        for name in report.dirty_outputs {
            let result = self.pull(&name);
            frame.record(name, result);
        }
    }

    // ------------------------------------------------------------------
    // Directives
    // ------------------------------------------------------------------

    /// Show a notification and return its id.
    pub fn show_notification(&self, notification: Notification) -> String {
        let id = notification.id.clone().unwrap_or_else(|| {
            let n = self.inner.notifications.fetch_add(1, Ordering::Relaxed);
            format!("notification-{n}")
        });
        self.inner
            .runtime
            .emit(notification.into_directive(id.clone()));
        id
    }

    pub fn remove_notification(&self, id: impl Into<String>) {
        self.inner
            .runtime
            .emit(Directive::RemoveNotification { id: id.into() });
    }

    pub fn show_modal(&self, modal: Modal) {
        self.inner.runtime.emit(Directive::ShowModal { modal });
    }

    pub fn remove_modal(&self) {
        self.inner.runtime.emit(Directive::RemoveModal);
    }

    /// Open a progress bar. It is removed when the handle is closed or
    /// dropped.
    pub fn progress(&self) -> Progress {
        let n = self.inner.progress_bars.fetch_add(1, Ordering::Relaxed);
        Progress::open(self.inner.runtime.clone(), format!("progress-{n}"))
    }

    /// Ask the client to patch input `name`. The server-side value changes
    /// once the client reports it back.
    pub fn update_input(&self, name: impl Into<String>, patch: Value) {
        self.inner.runtime.emit(Directive::UpdateInput {
            name: name.into(),
            patch,
        });
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// When the earliest pending invalidation timer is due.
    pub fn next_timer(&self) -> Option<Instant> {
        self.inner.runtime.next_deadline()
    }

    /// Sleep until the next timer is due, fire it and flush.
    ///
    /// Returns `None` straight away when no timer is pending.
    pub async fn wait_for_timer(&self) -> Option<OutputFrame> {
        let deadline = self.next_timer()?;
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;

        let _gate = self.inner.gate.lock().await;
        self.inner.runtime.fire_due_timers(Instant::now());
        Some(self.flush_locked().await)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tear down every node of the session.
    pub fn close(&self) {
        self.inner.runtime.dispose_all();
        let inputs = std::mem::take(&mut *self.inner.inputs.write());
        let outputs = std::mem::take(&mut *self.inner.outputs.write());
        info!(
            session = %self.inner.id,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "session closed"
        );
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("inputs", &self.inner.inputs.read().len())
            .field("outputs", &self.inner.outputs.read().len())
            .finish()
    }
}
