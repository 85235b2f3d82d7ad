//! Page session identity and visibility timing.
//!
//! A [`SessionManager`] lives for exactly one page lifetime. It owns the
//! session identifier stamped on every event and a single "current viewing
//! interval" clock used to report time-on-page when the page is hidden.
//!
//! # Visibility Model
//!
//! - Visible → Hidden: the caller receives the seconds spent in the current
//!   viewing interval. The clock is left untouched.
//! - Hidden → Visible: the clock restarts at zero.
//!
//! The clock measures one interval at a time, not a cumulative total.

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::Instant;

use crate::types::Visibility;

/// Length of the random suffix in session IDs.
const SESSION_ID_SUFFIX_LEN: usize = 9;

/// Outcome of a visibility notification that changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityTransition {
    /// The page was hidden after being viewed for `time_on_page` seconds.
    Hidden { time_on_page: u64 },

    /// The page became visible again and the viewing clock restarted.
    Shown,
}

/// Session identity and page-visibility clock for one page lifetime.
#[derive(Debug)]
pub struct SessionManager {
    session_id: String,
    start_time: DateTime<Utc>,
    page_start: Instant,
    visibility: Visibility,
}

impl SessionManager {
    /// Starts a new session with a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_id: new_session_id(),
            start_time: Utc::now(),
            page_start: Instant::now(),
            visibility: Visibility::Visible,
        }
    }

    /// The identifier carried by every event of this session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wall-clock time at which the session started.
    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Current page visibility.
    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Whole seconds since the page last became visible (or since the session
    /// started, if it has never been hidden).
    #[must_use]
    pub fn time_on_page(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.page_start)
            .as_secs()
    }

    /// Applies a visibility notification.
    ///
    /// Returns `None` when the notification repeats the current state.
    pub fn set_visibility(&mut self, visibility: Visibility) -> Option<VisibilityTransition> {
        if self.visibility == visibility {
            return None;
        }
        self.visibility = visibility;

        match visibility {
            Visibility::Hidden => Some(VisibilityTransition::Hidden {
                time_on_page: self.time_on_page(),
            }),
            Visibility::Visible => {
                self.page_start = Instant::now();
                Some(VisibilityTransition::Shown)
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a session ID: millisecond timestamp, `-`, and a random
/// lower-case alphanumeric suffix.
#[must_use]
pub fn new_session_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let suffix: String = (0..SESSION_ID_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{}-{suffix}", Utc::now().timestamp_millis())
}
