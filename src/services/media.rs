//! Video sources backed by `ffprobe`/`ffmpeg` and local storage lookup.

use async_trait::async_trait;
use image::RgbImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};

use crate::models::video::Video;
use crate::services::sampler::{ImageSequenceSource, MediaInfo, MediaSource, SamplerError};

/// Resolves a video's file reference into an open media handle.
#[async_trait]
pub trait MediaOpener: Send + Sync {
    async fn open(&self, video: &Video) -> Result<Box<dyn MediaSource>, SamplerError>;
}

/// Opens videos stored under a local directory. Directories are treated as
/// pre-extracted frame sequences, files are decoded with ffmpeg.
pub struct LocalMediaOpener {
    root: PathBuf,
}

impl LocalMediaOpener {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MediaOpener for LocalMediaOpener {
    async fn open(&self, video: &Video) -> Result<Box<dyn MediaSource>, SamplerError> {
        let path = self.root.join(&video.filename);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SamplerError::UnreadableMedia(format!("{}: {}", path.display(), e)))?;

        if metadata.is_dir() {
            let source = ImageSequenceSource::open(&path, video.fps).await?;
            Ok(Box::new(source))
        } else {
            let source = FfmpegSource::open(&path).await?;
            Ok(Box::new(source))
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Decodes a video file to raw RGB frames through an `ffmpeg` pipe.
pub struct FfmpegSource {
    path: PathBuf,
    info: MediaInfo,
    decoder: Option<(Child, ChildStdout)>,
    position: u64,
    frame_bytes: usize,
    frames_read: u64,
    exhausted: bool,
}

impl FfmpegSource {
    pub async fn open(path: &Path) -> Result<Self, SamplerError> {
        let info = probe(path).await?;
        let frame_bytes = info.width as usize * info.height as usize * 3;

        tracing::debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = ?info.fps,
            frame_count = ?info.frame_count,
            "Probed video"
        );

        Ok(Self {
            path: path.to_path_buf(),
            info,
            decoder: None,
            position: 0,
            frame_bytes,
            frames_read: 0,
            exhausted: false,
        })
    }

    fn spawn_decoder(&self) -> Result<(Child, ChildStdout), SamplerError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        if self.position > 0 {
            if let Some(fps) = self.info.fps {
                cmd.args(["-ss", &format!("{:.6}", self.position as f64 / fps)]);
            }
        }
        cmd.arg("-i")
            .arg(&self.path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-vsync", "passthrough", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SamplerError::Io(std::io::Error::other("ffmpeg stdout was not captured"))
        })?;
        Ok((child, stdout))
    }

    /// Read one raw frame into a buffer; `None` at end of stream.
    ///
    /// End of file is only a clean end when ffmpeg exited successfully on a
    /// frame boundary.
    async fn read_raw(&mut self) -> Result<Option<Vec<u8>>, SamplerError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.decoder.is_none() {
            self.decoder = Some(self.spawn_decoder()?);
        }
        let Some((_, stdout)) = self.decoder.as_mut() else {
            return Ok(None);
        };

        let mut buffer = vec![0u8; self.frame_bytes];
        let filled = read_full(stdout, &mut buffer).await?;
        if filled == self.frame_bytes {
            self.position += 1;
            self.frames_read += 1;
            return Ok(Some(buffer));
        }

        self.exhausted = true;
        let Some((mut child, _)) = self.decoder.take() else {
            return Ok(None);
        };
        let status = child.wait().await?;
        let frame_index = self.position;
        if filled > 0 {
            self.position += 1;
        }
        end_of_stream(
            status.success(),
            &status.to_string(),
            filled,
            frame_index,
            self.frames_read,
        )?;
        Ok(None)
    }
}

/// Fill `buffer` until it is full or the reader hits end of file. Returns
/// the number of bytes read.
async fn read_full<R>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Classify a decoder pipe that reached end of file.
///
/// A failed exit is unreadable media when the file never produced a frame,
/// otherwise an I/O error so the job retries from its checkpoint. A
/// successful exit with a truncated trailing frame reports that frame as
/// corrupt.
fn end_of_stream(
    success: bool,
    exit: &str,
    partial_bytes: usize,
    frame_index: u64,
    frames_read: u64,
) -> Result<(), SamplerError> {
    if !success {
        if frames_read == 0 {
            return Err(SamplerError::UnreadableMedia(format!("ffmpeg decode failed: {exit}")));
        }
        return Err(SamplerError::Io(std::io::Error::other(format!(
            "ffmpeg stopped at frame {frame_index}: {exit}"
        ))));
    }
    if partial_bytes > 0 {
        return Err(SamplerError::CorruptFrame {
            frame_index,
            reason: format!("truncated frame ({partial_bytes} bytes)"),
        });
    }
    Ok(())
}

#[async_trait]
impl MediaSource for FfmpegSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn supports_seek(&self) -> bool {
        self.info.fps.is_some()
    }

    async fn seek(&mut self, frame_index: u64) -> Result<(), SamplerError> {
        // The decoder restarts lazily from the new position.
        self.decoder = None;
        self.exhausted = false;
        self.position = frame_index;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, SamplerError> {
        let frame_index = self.position;
        let Some(buffer) = self.read_raw().await? else {
            return Ok(None);
        };

        RgbImage::from_raw(self.info.width, self.info.height, buffer)
            .map(Some)
            .ok_or_else(|| SamplerError::CorruptFrame {
                frame_index,
                reason: "frame buffer size mismatch".to_string(),
            })
    }

    async fn skip_frame(&mut self) -> Result<bool, SamplerError> {
        match self.read_raw().await {
            Ok(buffer) => Ok(buffer.is_some()),
            // A truncated frame that was going to be skipped anyway.
            Err(SamplerError::CorruptFrame { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

async fn probe(path: &Path) -> Result<MediaInfo, SamplerError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(SamplerError::UnreadableMedia(format!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| SamplerError::UnreadableMedia(format!("invalid ffprobe output: {e}")))?;

    let stream = probe
        .streams
        .first()
        .ok_or_else(|| SamplerError::UnreadableMedia("no video stream found".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(SamplerError::UnreadableMedia(
                "video stream has no dimensions".to_string(),
            ))
        }
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

    let duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| match (duration, fps) {
            (Some(d), Some(f)) => Some((d * f).round() as u64),
            _ => None,
        });

    Ok(MediaInfo {
        frame_count,
        fps,
        width,
        height,
    })
}

/// Parse an ffprobe rational like "30000/1001".
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}
