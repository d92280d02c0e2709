use chrono::Utc;
use parking_occupancy::{
    config::AppConfig,
    db::{self, PgStore},
    models::{
        lot::{ParkingLot, ParkingSlot},
        occupancy::{OccupancyEvent, SlotStatus},
        video::{Video, VideoStatus},
    },
    services::{
        queue::{JobQueue, RedisJobQueue},
        scheduler,
        store::{FrameBatch, PipelineStore},
    },
};
use std::time::Duration;
use uuid::Uuid;

/// Integration test: store and queue against real backends.
///
/// Covers the schema, the video status transitions, the transactional
/// checkpoint commit and the Redis lease lifecycle.
///
/// Note: This requires a running PostgreSQL and Redis instance
/// configured via environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url, 5)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let store = PgStore::new(db_pool);
    let queue = RedisJobQueue::new(&config.redis_url).expect("Failed to initialize queue");
    store.health_check().await.expect("Postgres unhealthy");
    queue.health_check().await.expect("Redis unhealthy");

    // Fixtures
    let lot = ParkingLot {
        id: Uuid::new_v4(),
        name: format!("integration-{}", Utc::now().timestamp()),
        created_at: Utc::now(),
    };
    store.insert_lot(&lot).await.expect("Failed to insert lot");
    let slot = ParkingSlot::rect(lot.id, "A1", 0.0, 0.0, 100.0, 50.0);
    store.insert_slot(&slot).await.expect("Failed to insert slot");

    let video = Video::new(lot.id, "integration.mp4");
    let video_id = video.id;
    store.insert_video(&video).await.expect("Failed to insert video");
    println!("✓ Created lot {} with video {}", lot.id, video_id);

    let slots = store.list_slots(lot.id).await.expect("Failed to list slots");
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].polygon, slot.polygon);

    // Queue and lease
    let status = scheduler::enqueue_video(&store, &queue, video_id)
        .await
        .expect("Failed to enqueue video");
    assert_eq!(status, VideoStatus::Queued);

    let ttl = Duration::from_secs(30);
    let mut leased = None;
    // Other jobs may be waiting in a shared Redis; release them untouched.
    for _ in 0..100 {
        let Some(job) = queue.acquire("it-worker", ttl).await.expect("Acquire failed") else {
            break;
        };
        if job.video_id == video_id {
            leased = Some(job);
            break;
        }
        queue.release(job.video_id, "it-worker").await.expect("Release failed");
    }
    let job = leased.expect("Queued video was not leased");
    assert_eq!(job.attempts, 1);
    assert!(queue.renew(video_id, "it-worker", ttl).await.unwrap());
    assert!(!queue.renew(video_id, "someone-else", ttl).await.unwrap());
    println!("✓ Leased job for video {}", video_id);

    // Checkpointed batch, committed twice to prove idempotence
    assert!(store.start_processing(video_id).await.unwrap());
    let event = OccupancyEvent {
        id: Uuid::new_v4(),
        video_id,
        lot_id: lot.id,
        slot_id: slot.id,
        status: SlotStatus::Occupied,
        frame_index: 12,
        frame_time: Utc::now(),
        offset_seconds: 0.48,
        overlap_ratio: 0.71,
        created_at: Utc::now(),
    };
    let batch = FrameBatch {
        last_frame_index: 12,
        events: vec![event.clone()],
        ..FrameBatch::default()
    };
    store.commit_batch(video_id, &batch).await.expect("Commit failed");
    let replay = FrameBatch {
        events: vec![OccupancyEvent {
            id: Uuid::new_v4(),
            ..event
        }],
        ..batch
    };
    store.commit_batch(video_id, &replay).await.expect("Replayed commit failed");

    let events = store.list_events(video_id).await.unwrap();
    assert_eq!(events.len(), 1);
    let reloaded = store.get_video(video_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, VideoStatus::Processing);
    assert_eq!(reloaded.last_processed_frame_index, Some(12));
    println!("✓ Checkpoint committed at frame 12");

    let latest = store.latest_slot_statuses(lot.id).await.unwrap();
    assert_eq!(latest, vec![(slot.id, SlotStatus::Occupied)]);

    // Completion
    assert!(store.complete(video_id, 40).await.unwrap());
    assert!(!store.complete(video_id, 40).await.unwrap());
    assert!(queue.finish(video_id, "it-worker").await.unwrap());
    assert!(queue.get(video_id).await.unwrap().is_none());

    let done = store.get_video(video_id).await.unwrap().unwrap();
    assert_eq!(done.status, VideoStatus::Completed);
    assert_eq!(done.last_processed_frame_index, Some(40));
    println!("✓ Video {} completed", video_id);
}
