// Mirror Writer: local segment files and the client playlist built from them.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::MirrorConfig;
use crate::playlist::{Playlist, Segment};

/// Outcome of deleting a local segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// The file was never written, usually because the download did not finish in time.
    NotFound,
}

/// Writes segment files and the client playlist into the output directory.
#[derive(Debug, Clone)]
pub struct MirrorWriter {
    output_dir: PathBuf,
    playlist_filename: String,
    segment_prefix: String,
    segment_extension: String,
}

impl MirrorWriter {
    /// Creates a writer, creating the output directory if needed.
    pub fn new(config: &MirrorConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        Ok(Self {
            output_dir: config.output_dir.clone(),
            playlist_filename: config.playlist_filename.clone(),
            segment_prefix: config.segment_prefix.clone(),
            segment_extension: config.segment_extension.clone(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Local file name of a segment, also used as its URL in the client playlist.
    pub fn segment_relative_url(&self, segment: &Segment) -> String {
        format!(
            "{}{}.{}",
            self.segment_prefix, segment.media_sequence, self.segment_extension
        )
    }

    pub fn segment_path(&self, segment: &Segment) -> PathBuf {
        self.output_dir.join(self.segment_relative_url(segment))
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(&self.playlist_filename)
    }

    pub fn write_segment(&self, segment: &Segment, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.segment_path(segment);
        write_file(&path, data)?;
        debug!(
            path = %path.display(),
            sequence = segment.media_sequence,
            bytes = data.len(),
            "Wrote segment"
        );
        Ok(path)
    }

    pub fn delete_segment(&self, segment: &Segment) -> io::Result<DeleteOutcome> {
        match fs::remove_file(self.segment_path(segment)) {
            Ok(()) => Ok(DeleteOutcome::Removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Builds the client playlist for `current`.
    ///
    /// Segments are taken in order while their files exist; the first missing
    /// file ends the list, so the result never has gaps.
    pub fn client_playlist(&self, current: &Playlist) -> Playlist {
        let mut published = Playlist::with_header_of(current);
        for segment in &current.segments {
            let path = self.segment_path(segment);
            if !path.is_file() {
                trace!(
                    path = %path.display(),
                    "Stopping client playlist at first missing segment"
                );
                break;
            }
            published
                .segments
                .push(segment.with_relative_url(self.segment_relative_url(segment)));
        }
        published
    }

    /// Regenerates the client playlist file and returns what was published.
    pub fn regenerate(&self, current: &Playlist) -> io::Result<Playlist> {
        let published = self.client_playlist(current);
        write_file(&self.playlist_path(), published.serialize().as_bytes())?;
        debug!(
            media_sequence = published.media_sequence,
            published = published.segments.len(),
            available = current.segments.len(),
            "Regenerated client playlist"
        );
        Ok(published)
    }
}

/// Truncates `path` and writes `data`, syncing it to stable storage.
pub fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}
