use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::detection::{FrameGap, GapReason};
use crate::models::lot::{ParkingLot, ParkingSlot, Point};
use crate::models::occupancy::{OccupancyEvent, SlotStatus};
use crate::models::video::{ErrorKind, Video, VideoStatus};
use crate::services::sampler::MediaInfo;
use crate::services::store::{FrameBatch, PipelineStore, StoreError};

const VIDEO_COLUMNS: &str = r#"
    id, lot_id, filename, status, uploaded_at, recorded_at, fps, frame_count,
    last_processed_frame_index, debounce_state, processing_started_at,
    processing_finished_at, error_kind, error_message
"#;

/// Postgres-backed [`PipelineStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a parking lot.
    pub async fn insert_lot(&self, lot: &ParkingLot) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO parking_lots (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(lot.id)
            .bind(&lot.name)
            .bind(lot.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a slot polygon for a lot.
    pub async fn insert_slot(&self, slot: &ParkingSlot) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO parking_slots (id, lot_id, name, polygon) VALUES ($1, $2, $3, $4)")
            .bind(slot.id)
            .bind(slot.lot_id)
            .bind(&slot.name)
            .bind(Json(&slot.polygon))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register an uploaded video.
    pub async fn insert_video(&self, video: &Video) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO videos (id, lot_id, filename, status, uploaded_at, recorded_at, fps, frame_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(video.id)
        .bind(video.lot_id)
        .bind(&video.filename)
        .bind(video.status.to_string())
        .bind(video.uploaded_at)
        .bind(video.recorded_at)
        .bind(video.fps)
        .bind(video.frame_count.map(to_db_index))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_db_index(index: u64) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

fn from_db_index(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative frame index {value}")))
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unexpected {column} value '{raw}'")))
}

fn video_from_row(r: &PgRow) -> Result<Video, StoreError> {
    let error_kind: Option<String> = r.try_get("error_kind")?;
    let frame_count: Option<i64> = r.try_get("frame_count")?;
    let checkpoint: Option<i64> = r.try_get("last_processed_frame_index")?;

    Ok(Video {
        id: r.try_get("id")?,
        lot_id: r.try_get("lot_id")?,
        filename: r.try_get("filename")?,
        status: parse_column::<VideoStatus>(r, "status")?,
        uploaded_at: r.try_get("uploaded_at")?,
        recorded_at: r.try_get("recorded_at")?,
        fps: r.try_get("fps")?,
        frame_count: frame_count.map(from_db_index).transpose()?,
        last_processed_frame_index: checkpoint.map(from_db_index).transpose()?,
        debounce_state: r.try_get("debounce_state")?,
        processing_started_at: r.try_get("processing_started_at")?,
        processing_finished_at: r.try_get("processing_finished_at")?,
        error_kind: error_kind
            .map(|kind| ErrorKind::from_str(&kind))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("unexpected error_kind: {e}")))?,
        error_message: r.try_get("error_message")?,
    })
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<Video>, StoreError> {
        let row = sqlx::query(&format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1"))
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(video_from_row).transpose()
    }

    async fn mark_queued(&self, video_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET status = 'queued',
                error_kind = NULL,
                error_message = NULL,
                processing_finished_at = NULL
            WHERE id = $1 AND status IN ('uploaded', 'failed')
            "#,
        )
        .bind(video_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn start_processing(&self, video_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET status = 'processing',
                processing_started_at = COALESCE(processing_started_at, NOW())
            WHERE id = $1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(video_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_media_info(&self, video_id: Uuid, info: &MediaInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE videos
            SET fps = COALESCE($2, fps),
                frame_count = COALESCE($3, frame_count)
            WHERE id = $1
            "#,
        )
        .bind(video_id)
        .bind(info.fps)
        .bind(info.frame_count.map(to_db_index))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_slots(&self, lot_id: Uuid) -> Result<Vec<ParkingSlot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, lot_id, name, polygon
            FROM parking_slots
            WHERE lot_id = $1
            ORDER BY id
            "#,
        )
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<ParkingSlot, StoreError> {
                let Json(polygon): Json<Vec<Point>> = r.try_get("polygon")?;
                Ok(ParkingSlot {
                    id: r.try_get("id")?,
                    lot_id: r.try_get("lot_id")?,
                    name: r.try_get("name")?,
                    polygon,
                })
            })
            .collect()
    }

    async fn latest_slot_statuses(&self, lot_id: Uuid) -> Result<Vec<(Uuid, SlotStatus)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (slot_id) slot_id, status
            FROM occupancy_events
            WHERE lot_id = $1
            ORDER BY slot_id, frame_time DESC, created_at DESC
            "#,
        )
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<(Uuid, SlotStatus), StoreError> {
                Ok((r.try_get("slot_id")?, parse_column(r, "status")?))
            })
            .collect()
    }

    /// Append the batch and advance the checkpoint in one transaction, so a
    /// checkpoint is never visible without the rows it covers.
    async fn commit_batch(&self, video_id: Uuid, batch: &FrameBatch) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(&batch.debounce_state)?;
        let mut tx = self.pool.begin().await?;

        for d in &batch.detections {
            sqlx::query(
                r#"
                INSERT INTO detections (
                    id, video_id, frame_index, frame_time, offset_seconds, class_id,
                    label, confidence, bbox, bbox_normalized, track_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(d.id)
            .bind(d.video_id)
            .bind(to_db_index(d.frame_index))
            .bind(d.frame_time)
            .bind(d.offset_seconds)
            .bind(d.class_id)
            .bind(&d.label)
            .bind(d.confidence)
            .bind(Json(d.bbox))
            .bind(Json(d.bbox_normalized))
            .bind(d.track_id)
            .execute(&mut *tx)
            .await?;
        }

        for e in &batch.events {
            sqlx::query(
                r#"
                INSERT INTO occupancy_events (
                    id, video_id, lot_id, slot_id, status, frame_index, frame_time,
                    offset_seconds, overlap_ratio, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (video_id, slot_id, frame_index) DO NOTHING
                "#,
            )
            .bind(e.id)
            .bind(e.video_id)
            .bind(e.lot_id)
            .bind(e.slot_id)
            .bind(e.status.to_string())
            .bind(to_db_index(e.frame_index))
            .bind(e.frame_time)
            .bind(e.offset_seconds)
            .bind(e.overlap_ratio)
            .bind(e.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for g in &batch.gaps {
            sqlx::query(
                r#"
                INSERT INTO frame_gaps (video_id, frame_index, reason, message)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (video_id, frame_index) DO NOTHING
                "#,
            )
            .bind(g.video_id)
            .bind(to_db_index(g.frame_index))
            .bind(g.reason.to_string())
            .bind(&g.message)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE videos
            SET last_processed_frame_index = $2,
                debounce_state = $3
            WHERE id = $1
              AND (last_processed_frame_index IS NULL OR last_processed_frame_index <= $2)
            "#,
        )
        .bind(video_id)
        .bind(to_db_index(batch.last_frame_index))
        .bind(snapshot)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete(&self, video_id: Uuid, final_checkpoint: u64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET status = 'completed',
                last_processed_frame_index = GREATEST(COALESCE(last_processed_frame_index, $2), $2),
                processing_finished_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(video_id)
        .bind(to_db_index(final_checkpoint))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, video_id: Uuid, kind: ErrorKind, message: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET status = 'failed',
                error_kind = $2,
                error_message = $3,
                processing_finished_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(video_id)
        .bind(kind.to_string())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_events(&self, video_id: Uuid) -> Result<Vec<OccupancyEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, video_id, lot_id, slot_id, status, frame_index, frame_time,
                   offset_seconds, overlap_ratio, created_at
            FROM occupancy_events
            WHERE video_id = $1
            ORDER BY frame_index, slot_id
            "#,
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<OccupancyEvent, StoreError> {
                Ok(OccupancyEvent {
                    id: r.try_get("id")?,
                    video_id: r.try_get("video_id")?,
                    lot_id: r.try_get("lot_id")?,
                    slot_id: r.try_get("slot_id")?,
                    status: parse_column(r, "status")?,
                    frame_index: from_db_index(r.try_get("frame_index")?)?,
                    frame_time: r.try_get("frame_time")?,
                    offset_seconds: r.try_get("offset_seconds")?,
                    overlap_ratio: r.try_get("overlap_ratio")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn list_gaps(&self, video_id: Uuid) -> Result<Vec<FrameGap>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT video_id, frame_index, reason, message
            FROM frame_gaps
            WHERE video_id = $1
            ORDER BY frame_index
            "#,
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<FrameGap, StoreError> {
                Ok(FrameGap {
                    video_id: r.try_get("video_id")?,
                    frame_index: from_db_index(r.try_get("frame_index")?)?,
                    reason: parse_column::<GapReason>(r, "reason")?,
                    message: r.try_get("message")?,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_indices_clamp_into_bigint() {
        assert_eq!(to_db_index(42), 42);
        assert_eq!(to_db_index(u64::MAX), i64::MAX);
        assert_eq!(from_db_index(7).unwrap(), 7);
        assert!(from_db_index(-1).is_err());
    }
}
