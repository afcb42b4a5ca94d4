// Sync Engine: polls the server playlist, fetches new segments, prunes stale
// ones and keeps the client playlist current.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::mirror::{DeleteOutcome, MirrorWriter};
use crate::playlist::{Playlist, Segment};
use crate::queue::{Completion, RequestQueue};
use crate::transport::{HttpRequest, Transport};

/// Counters describing a mirroring session.
#[derive(Debug, Default)]
pub struct MirrorStats {
    pub polls: AtomicU64,
    pub invalid_playlists: AtomicU64,
    pub poll_failures: AtomicU64,
    pub segments_written: AtomicU64,
    pub stale_segments: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub segments_pruned: AtomicU64,
}

/// Point-in-time copy of [`MirrorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStatsSnapshot {
    pub polls: u64,
    pub invalid_playlists: u64,
    pub poll_failures: u64,
    pub segments_written: u64,
    pub stale_segments: u64,
    pub fetch_failures: u64,
    pub segments_pruned: u64,
}

impl MirrorStats {
    pub fn snapshot(&self) -> MirrorStatsSnapshot {
        MirrorStatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            invalid_playlists: self.invalid_playlists.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            segments_written: self.segments_written.load(Ordering::Relaxed),
            stale_segments: self.stale_segments.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            segments_pruned: self.segments_pruned.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            polls = s.polls,
            invalid_playlists = s.invalid_playlists,
            poll_failures = s.poll_failures,
            segments_written = s.segments_written,
            stale_segments = s.stale_segments,
            fetch_failures = s.fetch_failures,
            segments_pruned = s.segments_pruned,
            "HLS mirror statistics"
        );
    }
}

/// State shared between the polling loop and segment fetch tasks.
///
/// Every read or write of `current` that leads to a filesystem change happens
/// under the lock, so a fetch cannot write a segment after it was pruned.
struct MirrorState {
    current: Mutex<Playlist>,
    writer: MirrorWriter,
    stats: MirrorStats,
}

impl MirrorState {
    fn new(writer: MirrorWriter) -> Self {
        Self {
            current: Mutex::new(Playlist::default()),
            writer,
            stats: MirrorStats::default(),
        }
    }

    /// Prunes, promotes `next` and republishes. Returns the segments to fetch.
    fn apply(&self, next: Playlist) -> Vec<Segment> {
        let mut current = self.current.lock();
        let diff = current.diff(&next);
        for segment in &diff.prune {
            self.prune_segment(segment);
        }
        *current = next;
        self.regenerate(&current);
        diff.fetch
    }

    fn prune_segment(&self, segment: &Segment) {
        match self.writer.delete_segment(segment) {
            Ok(DeleteOutcome::Removed) => {
                self.stats.segments_pruned.fetch_add(1, Ordering::Relaxed);
                debug!(sequence = segment.media_sequence, "Pruned segment");
            }
            Ok(DeleteOutcome::NotFound) => {
                debug!(
                    sequence = segment.media_sequence,
                    "Segment left the window before it was downloaded"
                );
            }
            Err(e) => {
                warn!(
                    path = %self.writer.segment_path(segment).display(),
                    error = %e,
                    "Cannot remove segment"
                );
            }
        }
    }

    /// Writes a downloaded segment unless it has rotated out of the window.
    fn store_segment(&self, segment: &Segment, data: &[u8]) {
        let current = self.current.lock();
        if current.contains(segment.media_sequence) {
            match self.writer.write_segment(segment, data) {
                Ok(_) => {
                    self.stats.segments_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(
                        sequence = segment.media_sequence,
                        error = %e,
                        "Failed to write segment"
                    );
                    // A partial file must not become visible to the client playlist.
                    if let Err(e) = self.writer.delete_segment(segment) {
                        warn!(
                            path = %self.writer.segment_path(segment).display(),
                            error = %e,
                            "Cannot remove partially written segment"
                        );
                    }
                }
            }
        } else {
            self.stats.stale_segments.fetch_add(1, Ordering::Relaxed);
            debug!(
                sequence = segment.media_sequence,
                "Discarding segment that left the window while downloading"
            );
        }
        self.regenerate(&current);
    }

    fn regenerate(&self, current: &Playlist) {
        if let Err(e) = self.writer.regenerate(current) {
            error!(
                path = %self.writer.playlist_path().display(),
                error = %e,
                "Failed to write client playlist"
            );
        }
    }
}

/// Mirrors one live HLS media playlist into a local directory.
pub struct SyncEngine {
    config: Arc<MirrorConfig>,
    playlist_url: Url,
    request_headers: HeaderMap,
    queue: RequestQueue,
    state: Arc<MirrorState>,
    fetches: TaskTracker,
    token: CancellationToken,
}

impl SyncEngine {
    /// Creates an engine issuing its requests through `queue`.
    pub fn new(
        config: MirrorConfig,
        queue: RequestQueue,
        token: CancellationToken,
    ) -> Result<Self, MirrorError> {
        config.validate()?;
        let playlist_url = Url::parse(&config.playlist_url)
            .map_err(|e| MirrorError::invalid_url(&config.playlist_url, e.to_string()))?;

        let user_agent = HeaderValue::from_str(&config.user_agent).map_err(|e| {
            MirrorError::configuration(format!("invalid user agent `{}`: {e}", config.user_agent))
        })?;
        let mut request_headers = config.headers.clone();
        request_headers.insert(USER_AGENT, user_agent);

        let writer = MirrorWriter::new(&config)?;

        Ok(Self {
            config: Arc::new(config),
            playlist_url,
            request_headers,
            queue,
            state: Arc::new(MirrorState::new(writer)),
            fetches: TaskTracker::new(),
            token,
        })
    }

    /// Creates an engine with its own request queue over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport<T: Transport>(
        config: MirrorConfig,
        transport: T,
        token: CancellationToken,
    ) -> Result<Self, MirrorError> {
        let (queue, _worker) = RequestQueue::spawn(transport);
        Self::new(config, queue, token)
    }

    /// Copy of the most recently accepted server playlist.
    pub fn current_playlist(&self) -> Playlist {
        self.state.current.lock().clone()
    }

    pub fn stats(&self) -> MirrorStatsSnapshot {
        self.state.stats.snapshot()
    }

    /// Polls until the cancellation token fires.
    pub async fn run(&self) {
        info!(
            url = %self.playlist_url,
            output_dir = %self.state.writer.output_dir().display(),
            "Starting HLS mirror"
        );

        loop {
            let delay = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                result = self.poll_once() => match result {
                    Ok(interval) => interval,
                    Err(MirrorError::Cancelled) => break,
                    Err(MirrorError::InvalidPlaylist { errors }) => {
                        for e in &errors {
                            warn!(error = %e, "Error while parsing the server playlist");
                        }
                        warn!(
                            retry_in = ?self.config.retry_interval,
                            "Invalid playlist, retrying"
                        );
                        self.config.retry_interval
                    }
                    Err(e) => {
                        if e.is_retryable() {
                            warn!(
                                error = %e,
                                retry_in = ?self.config.retry_interval,
                                "Error while getting the playlist"
                            );
                        } else {
                            error!(
                                error = %e,
                                retry_in = ?self.config.retry_interval,
                                "Error while getting the playlist"
                            );
                        }
                        self.config.retry_interval
                    }
                },
            };

            trace!(delay = ?delay, "Waiting for next playlist refresh");
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.fetches.close();
        info!(url = %self.playlist_url, "HLS mirror stopped");
        self.state.stats.log_summary();
    }

    /// Runs one poll cycle and returns the delay before the next one.
    ///
    /// Errors mean the playlist was not applied; the caller retries after
    /// the configured retry interval.
    pub async fn poll_once(&self) -> Result<Duration, MirrorError> {
        if self.token.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        self.state.stats.polls.fetch_add(1, Ordering::Relaxed);
        let result = self.refresh().await;
        match &result {
            Ok(_) => {}
            Err(MirrorError::InvalidPlaylist { .. }) => {
                self.state
                    .stats
                    .invalid_playlists
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.state.stats.poll_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Waits until every segment fetch spawned so far has finished.
    pub async fn wait_for_fetches(&self) {
        self.fetches.close();
        self.fetches.wait().await;
        self.fetches.reopen();
    }

    async fn refresh(&self) -> Result<Duration, MirrorError> {
        let request =
            HttpRequest::get(self.playlist_url.clone()).with_headers(self.request_headers.clone());
        let response = self.queue.enqueue(request).response().await?;
        debug!(
            status = %response.head().status,
            version = ?response.head().version,
            headers = ?response.head().headers,
            "Playlist response"
        );
        let body = response.read_body().await?;
        let text = String::from_utf8_lossy(&body);
        trace!(body = %text, "Playlist body");

        let playlist = Playlist::parse(&text, &self.config.playlist_url);
        if !playlist.is_valid() {
            return Err(MirrorError::InvalidPlaylist {
                errors: playlist.errors,
            });
        }

        let interval =
            Duration::from_secs(playlist.target_duration).max(self.config.min_refresh_interval);
        let media_sequence = playlist.media_sequence;
        let segments = playlist.segments.len();

        let to_fetch = self.state.apply(playlist);
        info!(
            media_sequence,
            segments,
            new_segments = to_fetch.len(),
            "Playlist refreshed"
        );
        for segment in to_fetch {
            self.spawn_fetch(segment);
        }
        Ok(interval)
    }

    fn spawn_fetch(&self, segment: Segment) {
        let url = match Url::parse(&segment.absolute_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %segment.absolute_url, error = %e, "Skipping segment with invalid URL");
                self.state
                    .stats
                    .fetch_failures
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Enqueue now so fetches are issued in playlist order.
        let completion = self
            .queue
            .enqueue(HttpRequest::get(url).with_headers(self.request_headers.clone()));
        let state = Arc::clone(&self.state);
        let token = self.token.clone();

        self.fetches.spawn(async move {
            let body = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                body = fetch_body(completion) => body,
            };
            match body {
                Ok(data) => state.store_segment(&segment, &data),
                Err(e) => {
                    state.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        sequence = segment.media_sequence,
                        url = %segment.absolute_url,
                        error = %e,
                        "Segment fetch failed, dropping it"
                    );
                }
            }
        });
    }
}

async fn fetch_body(completion: Completion) -> Result<Bytes, MirrorError> {
    completion.response().await?.read_body().await
}
