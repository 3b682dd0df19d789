//! Event source abstraction for the worker loop.
//!
//! Ingestion (outside this crate) materializes piece and batch records into
//! the store; the worker pulls them from there with two cursors:
//! - pieces by time: each poll reads `[cursor, now)` and moves the cursor
//! - batches by id: each poll reads ids above the last one seen

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::storage::KpiStore;
use crate::types::{BatchEvent, BatchId, PieceEvent};

/// Where the worker's events come from.
///
/// Both polls are expected to return each event once.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Pieces that arrived before `until`.
    async fn poll_pieces(&mut self, until: DateTime<Utc>) -> Result<Vec<PieceEvent>>;

    /// Batches completed since the previous poll.
    async fn poll_batches(&mut self) -> Result<Vec<BatchEvent>>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

// ============================================================================
// Store Source
// ============================================================================

/// Polls the shared store.
pub struct StoreSource<S: KpiStore + ?Sized> {
    store: Arc<S>,
    piece_cursor: DateTime<Utc>,
    batch_cursor: Option<BatchId>,
}

impl<S: KpiStore + ?Sized> StoreSource<S> {
    pub const fn new(store: Arc<S>, piece_cursor: DateTime<Utc>, batch_cursor: Option<BatchId>) -> Self {
        Self {
            store,
            piece_cursor,
            batch_cursor,
        }
    }

    /// Start after everything already stored. Older events belong to
    /// programs that recovery has closed.
    pub fn resume(store: Arc<S>, now: DateTime<Utc>) -> Result<Self> {
        let batch_cursor = store.latest_batch_id()?;
        info!(
            batch_cursor = ?batch_cursor,
            piece_cursor = %now,
            "[Source] Resuming after stored events"
        );
        Ok(Self::new(store, now, batch_cursor))
    }

    pub const fn cursors(&self) -> (DateTime<Utc>, Option<BatchId>) {
        (self.piece_cursor, self.batch_cursor)
    }
}

#[async_trait]
impl<S: KpiStore + ?Sized + 'static> EventSource for StoreSource<S> {
    async fn poll_pieces(&mut self, until: DateTime<Utc>) -> Result<Vec<PieceEvent>> {
        if until <= self.piece_cursor {
            return Ok(Vec::new());
        }
        let pieces = self.store.pieces_between(self.piece_cursor, Some(until))?;
        self.piece_cursor = until;
        Ok(pieces)
    }

    async fn poll_batches(&mut self) -> Result<Vec<BatchEvent>> {
        let batches = self.store.batches_after(self.batch_cursor)?;
        if let Some(last) = batches.iter().map(|b| b.id).max() {
            self.batch_cursor = Some(last);
        }
        Ok(batches)
    }

    fn source_name(&self) -> &str {
        self.store.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_piece_cursor_is_half_open() {
        let store = Arc::new(MemoryStore::new());
        store.put_piece(&PieceEvent::new(t0(), 100.0, 1)).unwrap();
        store.put_piece(&PieceEvent::new(t0() + Duration::seconds(60), 110.0, 1)).unwrap();

        let mut source = StoreSource::new(Arc::clone(&store), t0(), None);
        let first = source.poll_pieces(t0() + Duration::seconds(60)).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = source.poll_pieces(t0() + Duration::seconds(120)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].weight_g, 110.0);
        assert!(source.poll_pieces(t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_cursor_advances_by_id() {
        let store = Arc::new(MemoryStore::new());
        store.put_batch(&BatchEvent::new(1, 1, 1000.0, 8, t0())).unwrap();
        let mut source = StoreSource::new(Arc::clone(&store), t0(), None);
        assert_eq!(source.poll_batches().await.unwrap().len(), 1);
        assert!(source.poll_batches().await.unwrap().is_empty());

        store.put_batch(&BatchEvent::new(2, 2, 900.0, 7, t0())).unwrap();
        let next = source.poll_batches().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(source.cursors().1, Some(2));
    }

    #[test]
    fn test_resume_skips_stored_batches() {
        let store = Arc::new(MemoryStore::new());
        store.put_batch(&BatchEvent::new(7, 1, 1000.0, 8, t0())).unwrap();
        let mut source = StoreSource::resume(Arc::clone(&store), t0()).unwrap();
        assert_eq!(source.cursors(), (t0(), Some(7)));
        let batches = tokio_test::block_on(source.poll_batches()).unwrap();
        assert!(batches.is_empty());
    }
}
