//! StudyTrail telemetry - interaction capture for the learner dashboard.
//!
//! This crate records learner interactions (page views, quiz completions,
//! badges, errors and so on), enriches them with session and device context,
//! and delivers them to the collector in ordered batches.
//!
//! # Overview
//!
//! Capturing is synchronous and infallible: events are appended to an
//! in-memory buffer and the caller moves on. A background flush loop sends
//! the buffer every 30 seconds, immediately after critical interactions,
//! when the page is hidden, and once more when the session stops. Failed
//! sends keep their events for the next attempt; after a failure the buffer
//! is bounded so an outage cannot grow it without limit.
//!
//! Delivery only happens for live deployments with an authentication token.
//! Static and demo deployments discard events; without a token, events wait
//! in the buffer until one appears.
//!
//! # Modules
//!
//! - [`types`]: Interaction types and the event record
//! - [`session`]: Session identity and page visibility tracking
//! - [`context`]: Page, device, token and deployment context
//! - [`enrich`]: Device classification and event enrichment
//! - [`buffer`]: Ordered, sequence-numbered event buffer
//! - [`transport`]: Batch delivery over HTTP or in memory
//! - [`dispatcher`]: Flush state machine with coalescing and backoff
//! - [`telemetry`]: The public handle and its flush loop
//! - [`helpers`]: Named capture helpers
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for setup and driver code

pub mod buffer;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod enrich;
pub mod error;
pub mod helpers;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use buffer::{BufferLimits, EventBuffer};
pub use config::{Config, ConfigError};
pub use context::{
    Deployment, FileTokenStore, PageContext, RuntimeContext, SharedTokenStore, TokenStore,
};
pub use dispatcher::{DispatchSettings, Dispatcher, FlushOutcome, FlushReason, RetryPolicy};
pub use enrich::classify_device;
pub use error::{Result, TelemetryError};
pub use session::SessionManager;
pub use telemetry::{Telemetry, TelemetryConfig};
pub use transport::{HttpTransport, MemoryTransport, Transport, TransportError};
pub use types::{DeviceClass, InteractionEvent, InteractionType, Visibility};
