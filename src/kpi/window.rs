//! Minute window state machine
//!
//! `Idle -> Open(minute) -> Closed(minute)`. Exactly one window is open at a
//! time. An event for a strictly later minute closes the open window before a
//! new one opens; the controlling loop additionally calls
//! [`WindowAggregator::advance_to`] on every wall-clock rollover so idle
//! minutes are still emitted.
//!
//! Closed windows are handed out by value and have no public mutators, so a
//! window can never be reopened. Events that arrive for an already-closed
//! minute (or for a minute below the open window) are carried forward into
//! the open window, or into the next minute when nothing is open.
//!
//! A batch may carry the minute the live path counted it in
//! (`window_minute`); that minute is used in place of its completion minute,
//! so a recompute over stored batches buckets a late batch where the live
//! aggregation did.

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{BatchEvent, Gate, MinuteKey, PieceEvent};

// ============================================================================
// Minute Window
// ============================================================================

/// Pieces and batches observed during one minute, grouped per gate. Pieces
/// keep arrival order; batches are kept in completion order, then id, so
/// the minute's sums do not depend on when a batch was polled.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteWindow {
    minute: MinuteKey,
    pieces_by_gate: BTreeMap<Gate, Vec<PieceEvent>>,
    batches_by_gate: BTreeMap<Gate, Vec<BatchEvent>>,
}

impl MinuteWindow {
    fn new(minute: MinuteKey) -> Self {
        Self {
            minute,
            pieces_by_gate: BTreeMap::new(),
            batches_by_gate: BTreeMap::new(),
        }
    }

    fn add_piece(&mut self, piece: PieceEvent) {
        self.pieces_by_gate.entry(piece.gate).or_default().push(piece);
    }

    fn add_batch(&mut self, batch: BatchEvent) {
        let batches = self.batches_by_gate.entry(batch.gate).or_default();
        let key = (batch.completed_at, batch.id);
        let at = batches.partition_point(|b| (b.completed_at, b.id) <= key);
        batches.insert(at, batch);
    }

    pub const fn minute(&self) -> MinuteKey {
        self.minute
    }

    pub fn pieces_on(&self, gate: Gate) -> &[PieceEvent] {
        self.pieces_by_gate.get(&gate).map_or(&[], Vec::as_slice)
    }

    pub fn batches_on(&self, gate: Gate) -> &[BatchEvent] {
        self.batches_by_gate.get(&gate).map_or(&[], Vec::as_slice)
    }

    pub fn pieces(&self) -> impl Iterator<Item = (Gate, &[PieceEvent])> {
        self.pieces_by_gate.iter().map(|(&g, p)| (g, p.as_slice()))
    }

    pub fn batches(&self) -> impl Iterator<Item = (Gate, &[BatchEvent])> {
        self.batches_by_gate.iter().map(|(&g, b)| (g, b.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.pieces_by_gate.is_empty() && self.batches_by_gate.is_empty()
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Buckets events into minute windows and emits each window once.
///
/// `open == None` is the idle state.
#[derive(Debug)]
pub struct WindowAggregator {
    open: Option<MinuteWindow>,
    last_closed: Option<MinuteKey>,
    /// Upper bound on empty windows emitted for one gap.
    max_gap_minutes: u32,
    late_events: u64,
}

impl WindowAggregator {
    pub const fn new(max_gap_minutes: u32) -> Self {
        Self {
            open: None,
            last_closed: None,
            max_gap_minutes,
            late_events: 0,
        }
    }

    pub fn open_minute(&self) -> Option<MinuteKey> {
        self.open.as_ref().map(MinuteWindow::minute)
    }

    pub const fn last_closed(&self) -> Option<MinuteKey> {
        self.last_closed
    }

    /// Events carried forward because their minute had already closed.
    pub const fn late_events(&self) -> u64 {
        self.late_events
    }

    /// Route a piece; returns any windows closed by it.
    pub fn add_piece(&mut self, piece: PieceEvent) -> Vec<MinuteWindow> {
        let (closed, window) = self.slot_for(piece.minute());
        window.add_piece(piece);
        closed
    }

    /// Minute of the window an event for `minute` would be counted in now.
    pub fn window_for(&self, minute: MinuteKey) -> MinuteKey {
        match (self.open_minute(), self.last_closed) {
            (Some(open), _) if minute <= open => open,
            (None, Some(last)) if minute <= last => last.next(),
            _ => minute,
        }
    }

    /// Route a batch; returns any windows closed by it.
    pub fn add_batch(&mut self, batch: BatchEvent) -> Vec<MinuteWindow> {
        let completed = MinuteKey::of(batch.completed_at);
        if batch.minute() > completed {
            self.note_late(completed, batch.minute());
        }
        let (closed, window) = self.slot_for(batch.minute());
        window.add_batch(batch);
        closed
    }

    /// Close everything strictly before `minute`, emitting empty windows for
    /// skipped minutes. Driven by the wall clock.
    pub fn advance_to(&mut self, minute: MinuteKey) -> Vec<MinuteWindow> {
        self.close_until(minute)
    }

    /// Close the open window regardless of the clock (shutdown, program end).
    pub fn flush(&mut self) -> Option<MinuteWindow> {
        let window = self.open.take()?;
        self.last_closed = Some(window.minute);
        Some(window)
    }

    fn slot_for(&mut self, key: MinuteKey) -> (Vec<MinuteWindow>, &mut MinuteWindow) {
        let target = self.window_for(key);
        let closed = if target == key {
            self.close_until(key)
        } else {
            self.note_late(key, target);
            Vec::new()
        };
        let window = self.open.get_or_insert_with(|| MinuteWindow::new(target));
        (closed, window)
    }

    fn close_until(&mut self, target: MinuteKey) -> Vec<MinuteWindow> {
        let mut out = Vec::new();

        if self.open_minute().is_some_and(|open| open < target) {
            out.extend(self.flush());
        }
        if self.open.is_some() {
            return out;
        }

        if let Some(last) = self.last_closed {
            let gap = target.minutes_since(last) - 1;
            if gap > 0 {
                let emit = gap.min(i64::from(self.max_gap_minutes));
                if emit < gap {
                    debug!(
                        "[Window] Gap of {} minutes after {} exceeds cap; emitting last {}",
                        gap, last, emit
                    );
                }
                let mut minute = MinuteKey::from_index(target.index() - emit);
                while minute < target {
                    out.push(MinuteWindow::new(minute));
                    minute = minute.next();
                }
                if emit > 0 {
                    self.last_closed = Some(target.prev());
                }
            }
        }
        out
    }

    fn note_late(&mut self, key: MinuteKey, into: MinuteKey) {
        self.late_events += 1;
        debug!("[Window] Late event for {} carried into {}", key, into);
    }
}
