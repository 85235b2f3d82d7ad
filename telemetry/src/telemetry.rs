//! The public telemetry handle.
//!
//! [`Telemetry`] ties the session, enrichment and dispatcher together and owns
//! the flush loop. It is constructed once by the application's top-level
//! wiring and cloned into whatever needs to emit events.
//!
//! # Lifecycle
//!
//! 1. [`Telemetry::new`]: session and empty buffer are created. Captures are
//!    accepted immediately; flush requests queue up.
//! 2. [`Telemetry::start`]: spawns the flush loop (interval timer plus
//!    trigger channel). Must be called inside a tokio runtime.
//! 3. [`Telemetry::stop`]: tears the loop down and performs one final,
//!    time-bounded flush. Idempotent.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use studytrail_telemetry::context::{PageContext, SharedTokenStore};
//! use studytrail_telemetry::telemetry::{Telemetry, TelemetryConfig};
//! use studytrail_telemetry::transport::MemoryTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let telemetry = Telemetry::new(
//!         TelemetryConfig::default(),
//!         Arc::new(PageContext::new("https://learn.example.com/")),
//!         Arc::new(MemoryTransport::new()),
//!         Arc::new(SharedTokenStore::with_token("token")),
//!     );
//!     telemetry.start();
//!
//!     telemetry.page_view("Dashboard");
//!     telemetry.quiz_complete("quiz-1", 0.9, 120);
//!
//!     let unsent = telemetry.stop().await;
//!     assert_eq!(unsent, 0);
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::context::{RuntimeContext, TokenStore};
use crate::dispatcher::{DispatchSettings, Dispatcher, FlushOutcome, FlushReason};
use crate::enrich;
use crate::session::{SessionManager, VisibilityTransition};
use crate::transport::Transport;
use crate::types::{InteractionEvent, InteractionType, Visibility};

/// Default period of the flush timer.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Default bound on the final flush at unload.
pub const DEFAULT_UNLOAD_TIMEOUT_SECS: u64 = 5;

/// Runtime configuration for a [`Telemetry`] instance.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryConfig {
    /// Period of the recurring flush timer.
    pub flush_interval: Duration,
    /// Upper bound on the final flush performed by [`Telemetry::stop`].
    pub unload_timeout: Duration,
    /// Flush state machine settings.
    pub dispatch: DispatchSettings,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            unload_timeout: Duration::from_secs(DEFAULT_UNLOAD_TIMEOUT_SECS),
            dispatch: DispatchSettings::default(),
        }
    }
}

enum Lifecycle {
    /// Constructed, loop not started. Holds the trigger receiver so early
    /// flush requests are not lost.
    Created {
        triggers: mpsc::UnboundedReceiver<FlushReason>,
    },
    Running {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Stopped,
}

struct Inner {
    config: TelemetryConfig,
    session_id: String,
    session: Mutex<SessionManager>,
    context: Arc<dyn RuntimeContext>,
    dispatcher: Arc<Dispatcher>,
    triggers: mpsc::UnboundedSender<FlushReason>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to the telemetry pipeline of one page session.
///
/// Cloning is cheap; all clones share the same session and buffer.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    /// Creates a new session with an empty buffer.
    #[must_use]
    pub fn new(
        config: TelemetryConfig,
        context: Arc<dyn RuntimeContext>,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        let session = SessionManager::new();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(config.dispatch, transport, tokens));

        debug!(session_id = %session.session_id(), "Telemetry session created");

        Self {
            inner: Arc::new(Inner {
                config,
                session_id: session.session_id().to_string(),
                session: Mutex::new(session),
                context,
                dispatcher,
                triggers: trigger_tx,
                lifecycle: Mutex::new(Lifecycle::Created {
                    triggers: trigger_rx,
                }),
            }),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, SessionManager> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the flush loop. Calling it again, or after [`stop`](Self::stop),
    /// does nothing.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = self.lock_lifecycle();
        let triggers = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Created { triggers } => triggers,
            other => {
                *lifecycle = other;
                debug!("Telemetry already started or stopped");
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_flush_loop(
            Arc::clone(&self.inner.dispatcher),
            triggers,
            shutdown_rx,
            self.inner.config.flush_interval,
        ));

        *lifecycle = Lifecycle::Running {
            shutdown: shutdown_tx,
            task,
        };

        info!(
            session_id = %self.inner.session_id,
            flush_interval_secs = self.inner.config.flush_interval.as_secs(),
            "Telemetry started"
        );
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_lifecycle(), Lifecycle::Running { .. })
    }

    fn is_stopped(&self) -> bool {
        matches!(*self.lock_lifecycle(), Lifecycle::Stopped)
    }

    /// Ends the session: stops the flush loop and performs one final flush,
    /// bounded by the configured unload timeout.
    ///
    /// Only the first call does any work. Returns the number of events that
    /// could not be delivered.
    pub async fn stop(&self) -> usize {
        let previous = std::mem::replace(&mut *self.lock_lifecycle(), Lifecycle::Stopped);
        let dispatcher = &self.inner.dispatcher;

        match previous {
            Lifecycle::Stopped => return dispatcher.buffer_len(),
            Lifecycle::Running { shutdown, task } => {
                let _ = shutdown.send(());
                if let Err(e) = task.await {
                    warn!(error = %e, "Flush loop ended abnormally");
                }
            }
            Lifecycle::Created { .. } => {}
        }

        info!(
            buffered_events = dispatcher.buffer_len(),
            "Flushing interaction buffer before unload"
        );

        match time::timeout(
            self.inner.config.unload_timeout,
            dispatcher.flush(FlushReason::Unload),
        )
        .await
        {
            Ok(outcome) => debug!(?outcome, "Final flush finished"),
            Err(_) => warn!("Timeout while flushing buffer during unload"),
        }

        let unsent = dispatcher.buffer_len();
        if unsent > 0 {
            warn!(unsent_events = unsent, "Some events could not be sent");
        }
        info!(session_id = %self.inner.session_id, "Telemetry stopped");
        unsent
    }

    /// Records an interaction.
    ///
    /// Never fails and never blocks on I/O. Critical interactions also
    /// request an immediate flush. Captures after [`stop`](Self::stop) are
    /// ignored.
    pub fn capture(&self, interaction_type: InteractionType, metadata: Option<Value>) {
        if self.is_stopped() {
            trace!(interaction = %interaction_type, "Capture after stop ignored");
            return;
        }

        let critical = interaction_type.is_critical();
        let event = enrich::build_event(
            interaction_type,
            metadata,
            &self.inner.session_id,
            self.inner.context.as_ref(),
            Utc::now(),
        );
        trace!(interaction = %event.interaction_type, "Interaction captured");
        self.inner.dispatcher.append(event);

        if critical {
            self.request_flush(FlushReason::Critical);
        }
    }

    /// Asks the flush loop to flush for `reason` without waiting.
    pub fn request_flush(&self, reason: FlushReason) {
        if self.inner.triggers.send(reason).is_err() {
            debug!(reason = %reason, "Flush loop gone, request dropped");
        }
    }

    /// Flushes now and waits for the outcome.
    pub async fn flush(&self) -> FlushOutcome {
        self.inner.dispatcher.flush(FlushReason::Manual).await
    }

    /// Handles a page visibility notification.
    ///
    /// Hiding the page records `page_blur` with the seconds spent viewing it
    /// and flushes. Showing it records `page_focus` and restarts the
    /// viewing clock.
    pub fn visibility_changed(&self, visibility: Visibility) {
        let transition = self.lock_session().set_visibility(visibility);

        match transition {
            Some(VisibilityTransition::Hidden { time_on_page }) => {
                self.capture(
                    InteractionType::PageBlur,
                    Some(json!({ "timeOnPage": time_on_page })),
                );
                self.request_flush(FlushReason::VisibilityChange);
            }
            Some(VisibilityTransition::Shown) => {
                self.capture(InteractionType::PageFocus, None);
            }
            None => {}
        }
    }

    /// Identifier stamped on every event of this session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Whole seconds in the current viewing interval.
    #[must_use]
    pub fn time_on_page(&self) -> u64 {
        self.lock_session().time_on_page()
    }

    /// Number of buffered events.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.inner.dispatcher.buffer_len()
    }

    /// Copies the buffered events, in capture order.
    #[must_use]
    pub fn buffered_events(&self) -> Vec<InteractionEvent> {
        self.inner.dispatcher.buffered_events()
    }
}

/// Drives timer and trigger flushes until shutdown.
///
/// Each flush runs as its own task so the loop keeps accepting triggers
/// while a send is pending; overlapping flushes are coalesced by the
/// dispatcher.
async fn run_flush_loop(
    dispatcher: Arc<Dispatcher>,
    mut triggers: mpsc::UnboundedReceiver<FlushReason>,
    mut shutdown: oneshot::Receiver<()>,
    period: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => spawn_flush(&dispatcher, FlushReason::Timer),
            Some(reason) = triggers.recv() => spawn_flush(&dispatcher, reason),
        }
    }

    debug!("Flush loop stopped");
}

fn spawn_flush(dispatcher: &Arc<Dispatcher>, reason: FlushReason) {
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        let outcome = dispatcher.flush(reason).await;
        trace!(reason = %reason, ?outcome, "Flush finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PageContext, SharedTokenStore};
    use crate::transport::MemoryTransport;

    fn telemetry_with(transport: Arc<MemoryTransport>) -> Telemetry {
        Telemetry::new(
            TelemetryConfig::default(),
            Arc::new(PageContext::new("/dashboard")),
            transport,
            Arc::new(SharedTokenStore::with_token("token")),
        )
    }

    #[tokio::test]
    async fn captures_accumulate_without_trigger() {
        let telemetry = telemetry_with(Arc::new(MemoryTransport::new()));
        for i in 0..10 {
            telemetry.capture(
                InteractionType::ButtonClick,
                Some(json!({ "buttonId": format!("b{i}") })),
            );
        }

        let events = telemetry.buffered_events();
        assert_eq!(events.len(), 10);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.metadata["buttonId"], format!("b{i}"));
            assert_eq!(event.session_id, telemetry.session_id());
        }
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let telemetry = telemetry_with(transport.clone());

        telemetry.start();
        telemetry.start();
        assert!(telemetry.is_running());

        telemetry.page_view("Dashboard");
        assert_eq!(telemetry.stop().await, 0);
        assert!(!telemetry.is_running());
        assert_eq!(transport.attempts(), 1);

        assert_eq!(telemetry.stop().await, 0);
        assert_eq!(transport.attempts(), 1);

        telemetry.start();
        assert!(!telemetry.is_running());
    }

    #[tokio::test]
    async fn captures_after_stop_are_ignored() {
        let telemetry = telemetry_with(Arc::new(MemoryTransport::new()));
        telemetry.stop().await;

        telemetry.page_view("Late");
        assert_eq!(telemetry.buffer_len(), 0);
    }

    #[tokio::test]
    async fn stop_without_start_still_flushes() {
        let transport = Arc::new(MemoryTransport::new());
        let telemetry = telemetry_with(transport.clone());
        telemetry.page_view("Dashboard");

        assert_eq!(telemetry.stop().await, 0);
        assert_eq!(transport.batches()[0].len(), 1);
    }

    #[tokio::test]
    async fn stop_reports_unsent_events() {
        let transport = Arc::new(MemoryTransport::failing());
        let telemetry = telemetry_with(transport.clone());
        telemetry.page_view("Dashboard");
        telemetry.button_click("save", None);

        assert_eq!(telemetry.stop().await, 2);
    }

    #[tokio::test]
    async fn hidden_then_visible_records_blur_and_focus() {
        let telemetry = telemetry_with(Arc::new(MemoryTransport::new()));

        telemetry.visibility_changed(Visibility::Hidden);
        telemetry.visibility_changed(Visibility::Hidden);
        telemetry.visibility_changed(Visibility::Visible);

        let events = telemetry.buffered_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].interaction_type, InteractionType::PageBlur);
        assert!(events[0].metadata["timeOnPage"].is_u64());
        assert_eq!(events[1].interaction_type, InteractionType::PageFocus);
        assert!(events[1].metadata.get("timeOnPage").is_none());
    }
}
