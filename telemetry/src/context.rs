//! Boundaries between the telemetry pipeline and its host.
//!
//! The pipeline only reads from its environment. Three seams are defined here:
//!
//! - [`RuntimeContext`]: page URL, referrer and device facts used for
//!   enrichment ([`PageContext`] is the stock implementation)
//! - [`TokenStore`]: whether an authentication token is present, and its
//!   bearer value ([`FileTokenStore`], [`SharedTokenStore`])
//! - [`Deployment`]: whether a live collector exists at all
//!
//! Tokens are held in [`Zeroizing`] buffers and never logged.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use tracing::trace;
use zeroize::Zeroizing;

/// Environment variable that overrides the token file.
pub const ENV_AUTH_TOKEN: &str = "STUDYTRAIL_AUTH_TOKEN";

/// Screen dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenResolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for ScreenResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ScreenResolution {
    type Err = String;

    /// Parses `"<width>x<height>"`, e.g. `"1920x1080"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| format!("expected WIDTHxHEIGHT, got '{s}'"))
        };
        Ok(Self {
            width: parse(width)?,
            height: parse(height)?,
        })
    }
}

/// Where the user currently is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub url: String,
    pub referrer: Option<String>,
}

/// What the user is using. Every field is optional; missing facts are
/// simply left out of enriched events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub viewport_width: Option<u32>,
    pub user_agent: Option<String>,
    pub screen: Option<ScreenResolution>,
}

/// Read-only view of the host runtime.
pub trait RuntimeContext: Send + Sync {
    /// The current page.
    fn page(&self) -> PageInfo;

    /// Facts about the current device.
    fn device(&self) -> DeviceInfo;
}

/// A thread-safe, mutable [`RuntimeContext`].
///
/// The host updates it on navigation and resize; the pipeline reads it on
/// every capture.
#[derive(Debug, Default)]
pub struct PageContext {
    page: RwLock<PageInfo>,
    device: RwLock<DeviceInfo>,
}

impl PageContext {
    /// Creates a context for a page with no referrer and unknown device.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            page: RwLock::new(PageInfo {
                url: url.into(),
                referrer: None,
            }),
            device: RwLock::new(DeviceInfo::default()),
        }
    }

    /// Sets the device facts.
    #[must_use]
    pub fn with_device(self, device: DeviceInfo) -> Self {
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = device;
        self
    }

    /// Moves to a new URL. The previous URL becomes the referrer.
    pub fn navigate(&self, url: impl Into<String>) {
        let mut page = self.page.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut page.url, url.into());
        page.referrer = Some(previous);
    }

    /// Updates the viewport width after a resize.
    pub fn set_viewport_width(&self, width: Option<u32>) {
        self.device
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .viewport_width = width;
    }
}

impl RuntimeContext for PageContext {
    fn page(&self) -> PageInfo {
        self.page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn device(&self) -> DeviceInfo {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Read-only access to the ambient authentication token.
pub trait TokenStore: Send + Sync {
    /// Returns the bearer token, if one is present.
    fn token(&self) -> Option<Zeroizing<String>>;

    /// Returns `true` if a token is present.
    fn has_token(&self) -> bool {
        self.token().is_some()
    }
}

/// Where a token was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Token read from `STUDYTRAIL_AUTH_TOKEN`.
    EnvironmentVariable,
    /// Token read from the file at the given path.
    File(PathBuf),
}

/// Token store backed by the environment and a token file.
///
/// `STUDYTRAIL_AUTH_TOKEN` takes precedence when it is set and non-empty.
/// Otherwise the trimmed file contents are used. Both are re-read on every
/// call, so a login that writes the file later is picked up without restart.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Creates a store reading the token file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the token file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the token together with where it came from.
    #[must_use]
    pub fn load_with_source(&self) -> Option<(Zeroizing<String>, TokenSource)> {
        if let Ok(value) = std::env::var(ENV_AUTH_TOKEN) {
            let value = Zeroizing::new(value);
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some((
                    Zeroizing::new(trimmed.to_string()),
                    TokenSource::EnvironmentVariable,
                ));
            }
        }

        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let contents = Zeroizing::new(contents);
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    return None;
                }
                Some((
                    Zeroizing::new(trimmed.to_string()),
                    TokenSource::File(self.path.clone()),
                ))
            }
            Err(e) => {
                trace!(path = %self.path.display(), error = %e, "No token file");
                None
            }
        }
    }
}

impl TokenStore for FileTokenStore {
    fn token(&self) -> Option<Zeroizing<String>> {
        self.load_with_source().map(|(token, _)| token)
    }
}

/// In-memory token store for applications that manage login themselves.
#[derive(Debug, Default)]
pub struct SharedTokenStore {
    token: RwLock<Option<Zeroizing<String>>>,
}

impl SharedTokenStore {
    /// Creates an empty (anonymous) store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds a token.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    /// Stores a token after login.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Zeroizing::new(token.into()));
    }

    /// Forgets the token after logout.
    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl TokenStore for SharedTokenStore {
    fn token(&self) -> Option<Zeroizing<String>> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Deployment target of the host application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Deployment {
    /// A live collector is reachable.
    #[default]
    Live,
    /// Static or demo hosting with no collector. Events are discarded.
    Static,
}

impl Deployment {
    /// Returns `true` if events should be delivered to a collector.
    #[must_use]
    pub fn collects(self) -> bool {
        matches!(self, Self::Live)
    }
}

impl FromStr for Deployment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "static" | "demo" => Ok(Self::Static),
            other => Err(format!("expected 'live', 'static' or 'demo', got '{other}'")),
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Static => f.write_str("static"),
        }
    }
}
