//! Frame sampling over seekable or sequential media.
//!
//! A [`FrameSampler`] walks a [`MediaSource`] and yields every
//! `interval`-th frame, keyed by its absolute frame index. Sampled indices are
//! always multiples of the interval, so a run resumed from any index samples
//! exactly the frames an uninterrupted run would have.

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Stream properties known once a source is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub frame_count: Option<u64>,
    pub fps: Option<f64>,
    pub width: u32,
    pub height: u32,
}

/// One decoded still at an absolute position in the video timeline.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub image: RgbImage,
}

/// A decoder over one video. Every `read_frame` call, successful or
/// `CorruptFrame`, advances the position by exactly one frame.
#[async_trait]
pub trait MediaSource: Send {
    fn info(&self) -> &MediaInfo;

    /// Whether `seek` can jump without decoding the frames in between.
    fn supports_seek(&self) -> bool;

    /// Position the source so the next read returns `frame_index`.
    async fn seek(&mut self, frame_index: u64) -> Result<(), SamplerError>;

    /// Decode the frame at the current position. `Ok(None)` at end of stream.
    async fn read_frame(&mut self) -> Result<Option<RgbImage>, SamplerError>;

    /// Advance past one frame. Returns `false` at end of stream.
    async fn skip_frame(&mut self) -> Result<bool, SamplerError> {
        match self.read_frame().await {
            Ok(frame) => Ok(frame.is_some()),
            Err(SamplerError::CorruptFrame { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// Restartable, finite sequence of sampled frames.
pub struct FrameSampler {
    source: Box<dyn MediaSource>,
    interval: u64,
    position: u64,
    finished: bool,
}

impl FrameSampler {
    /// Prepare to sample every `interval`-th frame at or after `start_index`.
    pub async fn open(
        mut source: Box<dyn MediaSource>,
        interval: u64,
        start_index: u64,
    ) -> Result<Self, SamplerError> {
        let interval = interval.max(1);
        let first = start_index.div_ceil(interval) * interval;

        let mut position = 0;
        let mut finished = false;
        if first > 0 {
            if source.supports_seek() {
                match source.info().frame_count {
                    Some(total) if first >= total => {
                        position = total;
                        finished = true;
                    }
                    _ => {
                        source.seek(first).await?;
                        position = first;
                    }
                }
            } else {
                tracing::debug!(first, "Source is not seekable, skipping frames linearly");
                while position < first {
                    if !source.skip_frame().await? {
                        finished = true;
                        break;
                    }
                    position += 1;
                }
            }
        }

        Ok(Self {
            source,
            interval,
            position,
            finished,
        })
    }

    pub fn info(&self) -> &MediaInfo {
        self.source.info()
    }

    /// Frames consumed so far; equals the stream length once exhausted.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next sampled frame, `Ok(None)` at end of stream.
    ///
    /// `Err(SamplerError::CorruptFrame)` is frame-scoped: the frame is
    /// skipped and the caller may keep calling `next`.
    pub async fn next(&mut self) -> Result<Option<Frame>, SamplerError> {
        if self.finished {
            return Ok(None);
        }

        while self.position % self.interval != 0 {
            if !self.source.skip_frame().await? {
                self.finished = true;
                return Ok(None);
            }
            self.position += 1;
        }

        let index = self.position;
        match self.source.read_frame().await {
            Ok(Some(image)) => {
                self.position += 1;
                Ok(Some(Frame { index, image }))
            }
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(SamplerError::CorruptFrame { reason, .. }) => {
                self.position += 1;
                tracing::warn!(frame_index = index, reason = %reason, "Skipping corrupt frame");
                Err(SamplerError::CorruptFrame {
                    frame_index: index,
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// A directory of still frames, one file per frame, ordered by file name.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    info: MediaInfo,
    position: usize,
}

impl ImageSequenceSource {
    pub async fn open(dir: &Path, fps: Option<f64>) -> Result<Self, SamplerError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SamplerError::UnreadableMedia(format!("{}: {}", dir.display(), e)))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SamplerError::UnreadableMedia(format!("{}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if image::ImageFormat::from_path(&path).is_ok() {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(SamplerError::UnreadableMedia(format!(
                "{} contains no frame images",
                dir.display()
            )));
        }

        // Dimensions come from the first readable header.
        let (width, height) = files
            .iter()
            .find_map(|path| image::image_dimensions(path).ok())
            .unwrap_or((0, 0));

        let info = MediaInfo {
            frame_count: Some(files.len() as u64),
            fps,
            width,
            height,
        };

        Ok(Self {
            files,
            info,
            position: 0,
        })
    }
}

#[async_trait]
impl MediaSource for ImageSequenceSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn supports_seek(&self) -> bool {
        true
    }

    async fn seek(&mut self, frame_index: u64) -> Result<(), SamplerError> {
        self.position = usize::try_from(frame_index).unwrap_or(usize::MAX);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, SamplerError> {
        let Some(path) = self.files.get(self.position).cloned() else {
            return Ok(None);
        };
        let frame_index = self.position as u64;
        self.position += 1;

        let decoded = tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(|e| SamplerError::CorruptFrame {
                frame_index,
                reason: e.to_string(),
            })?;

        match decoded {
            Ok(image) => Ok(Some(image.to_rgb8())),
            Err(e) => Err(SamplerError::CorruptFrame {
                frame_index,
                reason: e.to_string(),
            }),
        }
    }

    async fn skip_frame(&mut self) -> Result<bool, SamplerError> {
        if self.position >= self.files.len() {
            return Ok(false);
        }
        self.position += 1;
        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("Unreadable media: {0}")]
    UnreadableMedia(String),

    #[error("Corrupt frame {frame_index}: {reason}")]
    CorruptFrame { frame_index: u64, reason: String },

    #[error("Media I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory frames; `None` entries decode as corrupt.
    struct VecSource {
        frames: Vec<Option<u8>>,
        info: MediaInfo,
        position: usize,
        seekable: bool,
        decoded: Arc<Mutex<Vec<usize>>>,
    }

    impl VecSource {
        fn new(frames: Vec<Option<u8>>, seekable: bool) -> Self {
            let info = MediaInfo {
                frame_count: Some(frames.len() as u64),
                fps: Some(10.0),
                width: 2,
                height: 2,
            };
            Self {
                frames,
                info,
                position: 0,
                seekable,
                decoded: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl MediaSource for VecSource {
        fn info(&self) -> &MediaInfo {
            &self.info
        }

        fn supports_seek(&self) -> bool {
            self.seekable
        }

        async fn seek(&mut self, frame_index: u64) -> Result<(), SamplerError> {
            self.position = frame_index as usize;
            Ok(())
        }

        async fn read_frame(&mut self) -> Result<Option<RgbImage>, SamplerError> {
            let Some(entry) = self.frames.get(self.position).copied() else {
                return Ok(None);
            };
            self.decoded.lock().unwrap().push(self.position);
            let frame_index = self.position as u64;
            self.position += 1;
            match entry {
                Some(value) => Ok(Some(RgbImage::from_pixel(2, 2, image::Rgb([value, 0, 0])))),
                None => Err(SamplerError::CorruptFrame {
                    frame_index,
                    reason: "bad packet".to_string(),
                }),
            }
        }
    }

    async fn collect(sampler: &mut FrameSampler) -> (Vec<u64>, Vec<u64>) {
        let mut frames = Vec::new();
        let mut corrupt = Vec::new();
        loop {
            match sampler.next().await {
                Ok(Some(frame)) => frames.push(frame.index),
                Ok(None) => break,
                Err(SamplerError::CorruptFrame { frame_index, .. }) => corrupt.push(frame_index),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        (frames, corrupt)
    }

    #[tokio::test]
    async fn samples_every_interval_until_end_of_stream() {
        let source = VecSource::new((0..10).map(Some).collect(), true);
        let mut sampler = FrameSampler::open(Box::new(source), 3, 0).await.unwrap();
        let (frames, corrupt) = collect(&mut sampler).await;
        assert_eq!(frames, vec![0, 3, 6, 9]);
        assert!(corrupt.is_empty());
        assert_eq!(sampler.position(), 10);
    }

    #[tokio::test]
    async fn resume_aligns_to_the_sampling_grid() {
        let source = VecSource::new((0..10).map(Some).collect(), true);
        let mut sampler = FrameSampler::open(Box::new(source), 3, 4).await.unwrap();
        let (frames, _) = collect(&mut sampler).await;
        assert_eq!(frames, vec![6, 9]);
    }

    #[tokio::test]
    async fn non_seekable_source_skips_linearly() {
        let source = VecSource::new((0..8).map(Some).collect(), false);
        let mut sampler = FrameSampler::open(Box::new(source), 2, 5).await.unwrap();
        let (frames, _) = collect(&mut sampler).await;
        assert_eq!(frames, vec![6]);
        assert_eq!(sampler.position(), 8);
    }

    #[tokio::test]
    async fn seekable_source_does_not_decode_earlier_frames() {
        let source = VecSource::new((0..6).map(Some).collect(), true);
        let decoded = Arc::clone(&source.decoded);
        let mut sampler = FrameSampler::open(Box::new(source), 1, 4).await.unwrap();
        let (frames, _) = collect(&mut sampler).await;
        assert_eq!(frames, vec![4, 5]);
        assert_eq!(*decoded.lock().unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn corrupt_frame_is_skipped_not_fatal() {
        let source = VecSource::new(vec![Some(0), None, Some(2), Some(3)], true);
        let mut sampler = FrameSampler::open(Box::new(source), 1, 0).await.unwrap();
        let (frames, corrupt) = collect(&mut sampler).await;
        assert_eq!(frames, vec![0, 2, 3]);
        assert_eq!(corrupt, vec![1]);
    }

    #[tokio::test]
    async fn start_past_end_yields_nothing() {
        let source = VecSource::new((0..3).map(Some).collect(), false);
        let mut sampler = FrameSampler::open(Box::new(source), 1, 10).await.unwrap();
        assert!(sampler.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seek_past_last_sample_stops_at_stream_length() {
        let source = VecSource::new((0..10).map(Some).collect(), true);
        let decoded = Arc::clone(&source.decoded);
        let mut sampler = FrameSampler::open(Box::new(source), 3, 10).await.unwrap();
        assert!(sampler.next().await.unwrap().is_none());
        assert_eq!(sampler.position(), 10);
        assert!(decoded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_sequence_reports_missing_directory_as_unreadable() {
        let result = ImageSequenceSource::open(Path::new("/nonexistent/frames"), None).await;
        assert!(matches!(result, Err(SamplerError::UnreadableMedia(_))));
    }
}
