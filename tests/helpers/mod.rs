//! Shared fixtures for pipeline tests: synthetic media, a scripted detector
//! and an in-memory harness wired the way the worker binary wires production.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use parking_occupancy::config::{DetectionConfig, PipelineConfig, SchedulerConfig};
use parking_occupancy::models::detection::{BoundingBox, ObjectDetection};
use parking_occupancy::models::lot::ParkingSlot;
use parking_occupancy::models::occupancy::SlotStatus;
use parking_occupancy::models::video::Video;
use parking_occupancy::services::detection::{DetectionAdapter, Detector, DetectorError};
use parking_occupancy::services::media::MediaOpener;
use parking_occupancy::services::memory::{MemoryJobQueue, MemoryStore};
use parking_occupancy::services::processor::VideoProcessor;
use parking_occupancy::services::sampler::{MediaInfo, MediaSource, SamplerError};
use parking_occupancy::services::scheduler::{self, WorkerScheduler};
use parking_occupancy::services::store::PipelineStore;

/// Write the frame index into the top-left pixel.
pub fn encode_frame(index: u64) -> RgbImage {
    let mut image = RgbImage::new(20, 20);
    image.put_pixel(0, 0, Rgb([(index & 0xff) as u8, ((index >> 8) & 0xff) as u8, 0]));
    image
}

pub fn decode_frame(image: &RgbImage) -> u64 {
    let Rgb([lo, hi, _]) = *image.get_pixel(0, 0);
    u64::from(lo) | (u64::from(hi) << 8)
}

/// Behavior of one synthetic video.
#[derive(Default)]
pub struct MediaScript {
    pub frames: u64,
    pub fps: Option<f64>,
    pub corrupt: HashSet<u64>,
    /// Frame index whose read fails with an I/O error, once per entry.
    pub io_failures: Mutex<Vec<u64>>,
    pub unreadable: bool,
}

pub struct SyntheticSource {
    script: Arc<MediaScript>,
    info: MediaInfo,
    position: u64,
}

#[async_trait]
impl MediaSource for SyntheticSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn supports_seek(&self) -> bool {
        true
    }

    async fn seek(&mut self, frame_index: u64) -> Result<(), SamplerError> {
        self.position = frame_index;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, SamplerError> {
        let index = self.position;
        if index >= self.script.frames {
            return Ok(None);
        }

        {
            let mut failures = self.script.io_failures.lock().unwrap();
            if let Some(pos) = failures.iter().position(|&f| f == index) {
                failures.remove(pos);
                return Err(SamplerError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "decoder died")));
            }
        }

        self.position += 1;
        if self.script.corrupt.contains(&index) {
            return Err(SamplerError::CorruptFrame {
                frame_index: index,
                reason: "bad macroblock".to_string(),
            });
        }
        Ok(Some(encode_frame(index)))
    }
}

pub struct SyntheticOpener {
    pub script: Arc<MediaScript>,
    pub opens: AtomicU32,
}

impl SyntheticOpener {
    pub fn new(script: MediaScript) -> Self {
        Self {
            script: Arc::new(script),
            opens: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MediaOpener for SyntheticOpener {
    async fn open(&self, video: &Video) -> Result<Box<dyn MediaSource>, SamplerError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.script.unreadable {
            return Err(SamplerError::UnreadableMedia(format!("{}: not a video", video.filename)));
        }
        Ok(Box::new(SyntheticSource {
            info: MediaInfo {
                frame_count: Some(self.script.frames),
                fps: self.script.fps,
                width: 20,
                height: 20,
            },
            script: self.script.clone(),
            position: 0,
        }))
    }
}

type Script = dyn Fn(u64) -> Result<Vec<ObjectDetection>, DetectorError> + Send + Sync;

/// Detector whose answer for each frame comes from a closure over the
/// frame index.
pub struct ScriptedDetector {
    script: Box<Script>,
    pub calls: Mutex<Vec<u64>>,
}

impl ScriptedDetector {
    pub fn new(script: impl Fn(u64) -> Result<Vec<ObjectDetection>, DetectorError> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reports a car over slot `A1` on every frame where `signals` says occupied.
    pub fn from_signals(signals: Vec<SlotStatus>) -> Self {
        Self::new(move |index| {
            Ok(match signals.get(index as usize) {
                Some(SlotStatus::Occupied) => vec![car_over_slot()],
                _ => Vec::new(),
            })
        })
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn detect(&self, frame: &RgbImage) -> Result<Vec<ObjectDetection>, DetectorError> {
        let index = decode_frame(frame);
        self.calls.lock().unwrap().push(index);
        (self.script)(index)
    }
}

pub fn car_over_slot() -> ObjectDetection {
    ObjectDetection {
        bbox: BoundingBox::new(1.0, 1.0, 9.0, 9.0),
        class_id: 3,
        label: "car".to_string(),
        confidence: 0.92,
        track_id: Some(7),
    }
}

pub fn parse_signals(pattern: &str) -> Vec<SlotStatus> {
    pattern
        .chars()
        .filter_map(|c| match c {
            'O' => Some(SlotStatus::Occupied),
            'F' => Some(SlotStatus::Free),
            _ => None,
        })
        .collect()
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        frame_stride: 1,
        confirm_frames: 3,
        checkpoint_batch_size: 2,
        ..PipelineConfig::default()
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        lease_ttl: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
        max_attempts: 3,
        retry_base_delay: Duration::ZERO,
        retry_max_delay: Duration::ZERO,
    }
}

pub fn detection_config() -> DetectionConfig {
    DetectionConfig {
        timeout: Duration::from_secs(1),
        max_retries: 0,
        base_backoff: Duration::from_millis(1),
    }
}

/// One lot with a single 10x10 slot, backed by in-memory store and queue.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub lot_id: Uuid,
    pub slot: ParkingSlot,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown: watch::Receiver<bool>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let lot_id = Uuid::new_v4();
        let slot = ParkingSlot::rect(lot_id, "A1", 0.0, 0.0, 10.0, 10.0);
        store.insert_slots(lot_id, vec![slot.clone()]);
        let (shutdown_tx, shutdown) = watch::channel(false);

        Self {
            store,
            queue: Arc::new(MemoryJobQueue::new()),
            lot_id,
            slot,
            shutdown_tx,
            shutdown,
        }
    }

    /// Register an uploaded video and queue it the way the admin API does.
    pub async fn queue_video(&self) -> Uuid {
        self.queue_prepared(Video::new(self.lot_id, "lot-cam-1.mp4")).await
    }

    /// Queue a video whose record was built by the caller.
    pub async fn queue_prepared(&self, video: Video) -> Uuid {
        let id = video.id;
        self.store.insert_video(video);
        scheduler::enqueue_video(self.store.as_ref(), self.queue.as_ref(), id)
            .await
            .unwrap();
        id
    }

    pub fn scheduler(
        &self,
        opener: Arc<SyntheticOpener>,
        detector: Arc<dyn Detector>,
        config: SchedulerConfig,
    ) -> WorkerScheduler {
        self.scheduler_with(opener, detector, config, pipeline_config(), detection_config())
    }

    pub fn scheduler_with(
        &self,
        opener: Arc<SyntheticOpener>,
        detector: Arc<dyn Detector>,
        config: SchedulerConfig,
        pipeline: PipelineConfig,
        detection: DetectionConfig,
    ) -> WorkerScheduler {
        let processor = VideoProcessor::new(
            self.store.clone(),
            self.queue.clone(),
            opener,
            DetectionAdapter::new(detector, detection),
            pipeline,
        );
        WorkerScheduler::new(processor, self.store.clone(), self.queue.clone(), config)
    }

    pub async fn events(&self, video_id: Uuid) -> Vec<(u64, SlotStatus)> {
        self.store
            .list_events(video_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.frame_index, e.status))
            .collect()
    }
}
