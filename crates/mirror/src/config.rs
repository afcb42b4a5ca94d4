use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::MirrorError;

/// User agent sent with every request unless overridden.
pub const DEFAULT_USER_AGENT: &str =
    "AppleCoreMedia/1.0.0.13B42 (Macintosh; U; Intel Mac OS X 10_9_1; en_us)";

pub const DEFAULT_PLAYLIST_FILENAME: &str = "stream.m3u8";
pub const DEFAULT_SEGMENT_PREFIX: &str = "stream";
pub const DEFAULT_SEGMENT_EXTENSION: &str = "ts";

/// Configurable options for a mirroring session
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Remote media playlist to mirror
    pub playlist_url: String,

    /// Directory receiving segment files and the client playlist
    pub output_dir: PathBuf,

    /// Name of the client playlist inside `output_dir`
    pub playlist_filename: String,

    /// Segment files are named `<prefix><sequence>.<extension>`
    pub segment_prefix: String,
    pub segment_extension: String,

    /// User agent string
    pub user_agent: String,

    /// Extra HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Delay before polling again after a failed or invalid playlist fetch
    pub retry_interval: Duration,

    /// Lower bound for the poll interval derived from the target duration
    pub min_refresh_interval: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Overall timeout for a single request, body included
    pub timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// Duration to keep the idle connection alive before closing it
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Proxy URL applied to all requests (optional)
    pub proxy: Option<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            playlist_url: String::new(),
            output_dir: PathBuf::from("."),
            playlist_filename: DEFAULT_PLAYLIST_FILENAME.to_owned(),
            segment_prefix: DEFAULT_SEGMENT_PREFIX.to_owned(),
            segment_extension: DEFAULT_SEGMENT_EXTENSION.to_owned(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            retry_interval: Duration::from_secs(2),
            min_refresh_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            follow_redirects: true,
            // A single persistent connection, kept for up to ten minutes
            pool_idle_timeout: Duration::from_secs(600),
            pool_max_idle_per_host: 1,
            proxy: None,
        }
    }
}

impl MirrorConfig {
    pub fn builder(playlist_url: impl Into<String>) -> MirrorConfigBuilder {
        MirrorConfigBuilder::new(playlist_url)
    }

    /// Checks values that cannot be caught by the type system.
    pub fn validate(&self) -> Result<(), MirrorError> {
        let url = url::Url::parse(&self.playlist_url)
            .map_err(|e| MirrorError::invalid_url(&self.playlist_url, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MirrorError::invalid_url(
                &self.playlist_url,
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }
        if self.playlist_filename.is_empty() || self.playlist_filename.contains(['/', '\\']) {
            return Err(MirrorError::configuration(format!(
                "playlist filename `{}` must be a plain file name",
                self.playlist_filename
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(MirrorError::configuration(
                "retry interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`MirrorConfig`]
#[derive(Debug, Clone)]
pub struct MirrorConfigBuilder {
    config: MirrorConfig,
}

impl MirrorConfigBuilder {
    pub fn new(playlist_url: impl Into<String>) -> Self {
        Self {
            config: MirrorConfig {
                playlist_url: playlist_url.into(),
                ..MirrorConfig::default()
            },
        }
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = output_dir.into();
        self
    }

    pub fn with_playlist_filename(mut self, filename: impl Into<String>) -> Self {
        self.config.playlist_filename = filename.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Adds a header; invalid names or values are rejected.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, MirrorError> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| MirrorError::configuration(format!("invalid header name `{name}`: {e}")))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            MirrorError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        self.config.headers.insert(header_name, header_value);
        Ok(self)
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.min_refresh_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.config.proxy = proxy;
        self
    }

    pub fn build(self) -> MirrorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_single_connection_policy() {
        let config = MirrorConfig::default();
        assert_eq!(config.pool_max_idle_per_host, 1);
        assert_eq!(config.pool_idle_timeout, Duration::from_secs(600));
        assert_eq!(config.retry_interval, Duration::from_secs(2));
        assert_eq!(config.playlist_filename, "stream.m3u8");
        assert_eq!(config.output_dir, PathBuf::from("."));
    }

    #[test]
    fn builder_sets_fields() {
        let config = MirrorConfig::builder("http://h/live/stream.m3u8")
            .with_output_dir("/tmp/mirror")
            .with_user_agent("test-agent")
            .with_header("referer", "http://h/")
            .expect("valid header")
            .build();
        assert_eq!(config.playlist_url, "http://h/live/stream.m3u8");
        assert_eq!(config.output_dir, PathBuf::from("/tmp/mirror"));
        assert_eq!(config.user_agent, "test-agent");
        assert_eq!(config.headers["referer"], "http://h/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_header() {
        let result = MirrorConfig::builder("http://h/x.m3u8").with_header("bad header", "v");
        assert!(matches!(result, Err(MirrorError::Configuration { .. })));
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let config = MirrorConfig::builder("not a url").build();
        assert!(matches!(
            config.validate(),
            Err(MirrorError::InvalidUrl { .. })
        ));

        let config = MirrorConfig::builder("ftp://h/x.m3u8").build();
        assert!(matches!(
            config.validate(),
            Err(MirrorError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn validate_rejects_nested_playlist_name() {
        let config = MirrorConfig::builder("http://h/x.m3u8")
            .with_playlist_filename("a/b.m3u8")
            .build();
        assert!(matches!(
            config.validate(),
            Err(MirrorError::Configuration { .. })
        ));
    }
}
