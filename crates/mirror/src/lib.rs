//! # Mirror Engine
//!
//! Mirrors a live HLS media playlist into a local directory that a plain
//! static file server can expose to players.
//!
//! ## Features
//!
//! - Line-oriented media playlist parser and serializer
//! - Single-connection request queue issuing requests strictly in order
//! - Segment download, window pruning and gapless client playlist publishing
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod config;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod playlist;
pub mod queue;
pub mod transport;

pub use config::{MirrorConfig, MirrorConfigBuilder};
pub use engine::{MirrorStats, MirrorStatsSnapshot, SyncEngine};
pub use error::MirrorError;
pub use mirror::{DeleteOutcome, MirrorWriter};
pub use playlist::{ParseError, Playlist, PlaylistDiff, Segment};
pub use queue::{Completion, PendingResponse, RequestQueue};
pub use transport::{HttpRequest, ReqwestTransport, ResponseHead, Transport, create_client};

/// Re-exported so callers can drive [`SyncEngine::run`] without depending on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
