// HLS media playlist model: parsing, serialization and snapshot diffing.

use std::fmt::Write as _;
use tracing::debug;

pub const TAG_HEADER: &str = "#EXTM3U";
pub const TAG_VERSION: &str = "#EXT-X-VERSION";
pub const TAG_TARGET_DURATION: &str = "#EXT-X-TARGETDURATION";
pub const TAG_MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE";
pub const TAG_SEGMENT_INFO: &str = "#EXTINF";

/// A problem found while parsing a server playlist.
///
/// Parse errors are recorded on the [`Playlist`] instead of being returned, so a
/// caller always gets a snapshot back and decides what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty playlist")]
    Empty,

    #[error("no #EXTM3U tag at the start of playlist")]
    MissingHeader,

    #[error("no items in the playlist")]
    NoSegments,

    #[error("invalid value `{value}` for {tag}")]
    InvalidValue { tag: &'static str, value: String },

    #[error("#EXTINF for sequence {sequence} is not followed by a URI")]
    MissingUri { sequence: u64 },
}

/// A single media segment as listed by a playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Duration in seconds, as declared by `#EXTINF`.
    pub duration: f64,
    /// URI exactly as written in the playlist.
    pub relative_url: String,
    /// URI resolved against the playlist URL.
    pub absolute_url: String,
    pub media_sequence: u64,
}

impl Segment {
    /// Returns a copy of this segment pointing at `relative_url` instead.
    pub fn with_relative_url(&self, relative_url: impl Into<String>) -> Self {
        Self {
            relative_url: relative_url.into(),
            ..self.clone()
        }
    }
}

/// Snapshot of a media playlist.
///
/// Segments are stored in order and the sequence number of `segments[i]` is
/// `media_sequence + i`, which makes lookups by sequence number O(1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playlist {
    pub version: u64,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    pub errors: Vec<ParseError>,
}

/// Segments to delete and segments to download when moving between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistDiff {
    pub prune: Vec<Segment>,
    pub fetch: Vec<Segment>,
}

impl Playlist {
    /// Creates an empty playlist carrying the header fields of `other`.
    pub fn with_header_of(other: &Playlist) -> Self {
        Self {
            version: other.version,
            target_duration: other.target_duration,
            media_sequence: other.media_sequence,
            segments: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Parses playlist text fetched from `source_url`.
    pub fn parse(text: &str, source_url: &str) -> Self {
        let mut playlist = Playlist::default();
        let base_url = match source_url.rfind('/') {
            Some(idx) => &source_url[..=idx],
            None => "",
        };

        let lines: Vec<&str> = text
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let Some((first, rest)) = lines.split_first() else {
            playlist.errors.push(ParseError::Empty);
            return playlist;
        };
        if *first != TAG_HEADER {
            playlist.errors.push(ParseError::MissingHeader);
            return playlist;
        }

        let mut lines = rest.iter().copied();
        while let Some(line) = lines.next() {
            if !line.starts_with('#') {
                debug!(line, "Dangling playlist line outside a segment entry");
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                debug!(tag = line, "Ignoring unknown playlist tag");
                continue;
            };

            match key {
                TAG_VERSION => {
                    if let Some(v) = playlist.parse_integer(TAG_VERSION, value) {
                        playlist.version = v;
                    }
                }
                TAG_TARGET_DURATION => {
                    if let Some(v) = playlist.parse_integer(TAG_TARGET_DURATION, value) {
                        playlist.target_duration = v;
                    }
                }
                TAG_MEDIA_SEQUENCE => {
                    if let Some(v) = playlist.parse_integer(TAG_MEDIA_SEQUENCE, value) {
                        playlist.media_sequence = v;
                    }
                }
                TAG_SEGMENT_INFO => {
                    // Numbering follows parse order from the current media sequence value.
                    let sequence = playlist
                        .media_sequence
                        .saturating_add(playlist.segments.len() as u64);
                    let duration_str = value.split(',').next().unwrap_or_default().trim();
                    let duration = duration_str
                        .parse::<f64>()
                        .ok()
                        .filter(|d| d.is_finite() && *d >= 0.0);

                    let Some(uri) = lines.next() else {
                        playlist.errors.push(ParseError::MissingUri { sequence });
                        break;
                    };

                    match duration {
                        Some(duration) => playlist.segments.push(Segment {
                            duration,
                            relative_url: uri.to_string(),
                            absolute_url: resolve_url(base_url, uri),
                            media_sequence: sequence,
                        }),
                        None => playlist.errors.push(ParseError::InvalidValue {
                            tag: TAG_SEGMENT_INFO,
                            value: value.to_string(),
                        }),
                    }
                }
                _ => {
                    debug!(tag = key, "Ignoring unknown playlist tag");
                }
            }
        }

        if playlist.segments.is_empty() {
            playlist.errors.push(ParseError::NoSegments);
        }
        playlist
    }

    fn parse_integer(&mut self, tag: &'static str, value: &str) -> Option<u64> {
        match value.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.errors.push(ParseError::InvalidValue {
                    tag,
                    value: value.to_string(),
                });
                None
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Looks up a segment by media sequence number.
    pub fn get(&self, media_sequence: u64) -> Option<&Segment> {
        let idx = media_sequence.checked_sub(self.media_sequence)?;
        self.segments.get(usize::try_from(idx).ok()?)
    }

    pub fn contains(&self, media_sequence: u64) -> bool {
        self.get(media_sequence).is_some()
    }

    /// Computes what changes when `next` replaces `self` as the current snapshot.
    pub fn diff(&self, next: &Playlist) -> PlaylistDiff {
        PlaylistDiff {
            prune: self
                .segments
                .iter()
                .filter(|segment| !next.contains(segment.media_sequence))
                .cloned()
                .collect(),
            fetch: next
                .segments
                .iter()
                .filter(|segment| !self.contains(segment.media_sequence))
                .cloned()
                .collect(),
        }
    }

    /// Renders the playlist using relative segment URLs.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(64 + self.segments.len() * 48);
        out.push_str(TAG_HEADER);
        out.push('\n');
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{TAG_VERSION}:{}", self.version);
        let _ = writeln!(out, "{TAG_TARGET_DURATION}:{}", self.target_duration);
        let _ = writeln!(out, "{TAG_MEDIA_SEQUENCE}:{}", self.media_sequence);
        for segment in &self.segments {
            // Debug formatting keeps a fractional part (`4.0`, not `4`).
            let _ = writeln!(out, "{TAG_SEGMENT_INFO}:{:?},", segment.duration);
            out.push_str(&segment.relative_url);
            out.push('\n');
        }
        out
    }
}

fn resolve_url(base_url: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("{base_url}{uri}")
    }
}
