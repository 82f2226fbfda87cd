//! Drag-and-drop reorder engine for one trip's itinerary.
//!
//! ```text
//!            on_drag_start            on_drag_end / finish_drag
//!   Idle ───────────────────► Dragging ───────────────────────► Idle
//!                              │   ▲         (committed | cancelled)
//!                 on_drag_over │   │
//!                  (preview)   └───┘
//! ```
//!
//! Drag start snapshots the full item list. Drag-over only moves the
//! dragged item's day for visual feedback. Drag end restores the
//! snapshot, recomputes the move from scratch, applies it locally and
//! hands back a [`PendingMove`]; [`ItineraryBoard::persist`] commits it
//! through [`ReorderPersistence`] and restores the snapshot on failure.

use async_trait::async_trait;
use thiserror::Error;

use crate::itinerary::{
    apply_move, day_numbers, destination, renormalize, Bucket, DropTarget, ItemMove,
    ItineraryItem,
};
use crate::transaction::{apply_optimistic, LocalTransaction};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReorderError {
    #[error("failed to save new order: {0}")]
    PersistFailed(String),
    #[error("the unscheduled section cannot be reordered")]
    UnscheduledSectionFixed,
    #[error("unknown item: {0}")]
    UnknownItem(String),
    #[error("unknown section: {0}")]
    UnknownSection(Bucket),
}

/// Remote side of a reorder, implemented by the surrounding screen.
#[async_trait]
pub trait ReorderPersistence: Send + Sync {
    /// Persist one item's new day and position.
    async fn on_reorder(&self, item_move: &ItemMove) -> Result<(), ReorderError>;

    /// Persist a new day order, given as the old day numbers in their new order.
    async fn on_section_reorder(&self, day_order: &[i32]) -> Result<(), ReorderError>;
}

/// Result of releasing a drag.
#[derive(Debug)]
pub enum DropOutcome {
    /// No drag was active.
    Ignored,
    /// Released outside any target, or on a target we couldn't parse.
    Cancelled,
    /// Released on its own slot. Nothing to persist.
    Unchanged,
    /// Applied locally; persist it next.
    Moved(PendingMove),
}

/// A move applied optimistically and waiting for the remote commit.
#[derive(Debug)]
pub struct PendingMove {
    item_move: ItemMove,
    rollback: LocalTransaction<Vec<ItineraryItem>>,
}

impl PendingMove {
    pub fn item_move(&self) -> &ItemMove {
        &self.item_move
    }
}

#[derive(Debug)]
struct DragSession {
    active_id: String,
    snapshot: LocalTransaction<Vec<ItineraryItem>>,
}

#[derive(Debug, Default)]
enum DragState {
    #[default]
    Idle,
    Dragging(DragSession),
}

/// In-memory, optimistically updated item list for one trip.
#[derive(Debug, Default)]
pub struct ItineraryBoard {
    items: Vec<ItineraryItem>,
    drag: DragState,
    last_error: Option<ReorderError>,
}

impl ItineraryBoard {
    /// Take ownership of a loaded list, repairing any position gaps.
    /// The list order is kept as given.
    pub fn new(mut items: Vec<ItineraryItem>) -> Self {
        renormalize(&mut items);
        Self {
            items,
            drag: DragState::Idle,
            last_error: None,
        }
    }

    pub fn items(&self) -> &[ItineraryItem] {
        &self.items
    }

    /// Replace the list after an external refresh. Refused mid-drag.
    pub fn replace_items(&mut self, mut items: Vec<ItineraryItem>) -> bool {
        if self.is_dragging() {
            log::warn!("Ignoring itinerary refresh during an active drag");
            return false;
        }
        renormalize(&mut items);
        self.items = items;
        true
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.drag, DragState::Dragging(_))
    }

    pub fn active_id(&self) -> Option<&str> {
        match &self.drag {
            DragState::Dragging(session) => Some(session.active_id.as_str()),
            DragState::Idle => None,
        }
    }

    /// The error from the last failed persist, for a toast.
    pub fn last_error(&self) -> Option<&ReorderError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    // ─── Drag lifecycle ───────────────────────────────────────────────

    /// Start dragging `active_id`. Only one drag may be open at a time.
    pub fn on_drag_start(&mut self, active_id: &str) -> bool {
        if let DragState::Dragging(session) = &self.drag {
            log::warn!(
                "Drag of {active_id} ignored: {} is already being dragged",
                session.active_id
            );
            return false;
        }
        if !self.items.iter().any(|item| item.id == active_id) {
            log::warn!("Drag of unknown item {active_id} ignored");
            return false;
        }

        self.drag = DragState::Dragging(DragSession {
            active_id: active_id.to_string(),
            snapshot: LocalTransaction::begin(&self.items),
        });
        true
    }

    /// Preview the dragged item in the bucket under the pointer.
    ///
    /// Only the dragged item's day changes; nobody's position moves.
    /// Returns `true` when the preview changed.
    pub fn on_drag_over(&mut self, over_id: &str) -> bool {
        let DragState::Dragging(session) = &self.drag else {
            return false;
        };

        let bucket = match DropTarget::resolve(over_id, &self.items) {
            Ok(DropTarget::Item(id)) => match self.items.iter().find(|item| item.id == id) {
                Some(over) => over.bucket(),
                None => return false,
            },
            Ok(DropTarget::Container(bucket)) => bucket,
            Err(e) => {
                log::debug!("Drag over unrecognised target: {e}");
                return false;
            }
        };

        let active_id = session.active_id.clone();
        match self.items.iter_mut().find(|item| item.id == active_id) {
            Some(active) if active.bucket() != bucket => {
                active.day_number = bucket.day_number();
                true
            }
            _ => false,
        }
    }

    /// Abandon the drag and restore the pre-drag list.
    pub fn on_drag_cancel(&mut self) {
        if let DragState::Dragging(session) = std::mem::take(&mut self.drag) {
            session.snapshot.rollback(&mut self.items);
        }
    }

    /// Release the drag over `over_id` and apply the move locally.
    ///
    /// The list is rebuilt from the drag-start snapshot, so preview
    /// changes never leak into the result. `over_id == None` means the
    /// item was released outside any drop zone.
    pub fn finish_drag(&mut self, over_id: Option<&str>) -> DropOutcome {
        let DragState::Dragging(session) = std::mem::take(&mut self.drag) else {
            return DropOutcome::Ignored;
        };
        self.items = session.snapshot.snapshot().clone();

        let Some(over_id) = over_id else {
            return DropOutcome::Cancelled;
        };

        let target = match DropTarget::resolve(over_id, &self.items) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("Drop of {} ignored: {e}", session.active_id);
                return DropOutcome::Cancelled;
            }
        };

        let Some(active) = self.items.iter().find(|item| item.id == session.active_id) else {
            log::warn!("Dragged item {} vanished before drop", session.active_id);
            return DropOutcome::Cancelled;
        };

        let Some((bucket, position)) = destination(&self.items, active, &target) else {
            log::warn!("Drop of {} on unknown target {over_id:?} ignored", active.id);
            return DropOutcome::Cancelled;
        };

        if bucket == active.bucket() && position == active.position {
            return DropOutcome::Unchanged;
        }

        let active_id = active.id.clone();
        match apply_move(&mut self.items, &active_id, bucket, position) {
            Some(item_move) => {
                log::debug!(
                    "Moved {} to {bucket} position {}",
                    item_move.item_id,
                    item_move.new_position
                );
                DropOutcome::Moved(PendingMove {
                    item_move,
                    rollback: session.snapshot,
                })
            }
            None => DropOutcome::Cancelled,
        }
    }

    /// Commit a pending move, restoring the drag-start list on failure.
    pub async fn persist(
        &mut self,
        pending: PendingMove,
        persistence: &dyn ReorderPersistence,
    ) -> Result<ItemMove, ReorderError> {
        match persistence.on_reorder(&pending.item_move).await {
            Ok(()) => {
                pending.rollback.commit();
                Ok(pending.item_move)
            }
            Err(e) => {
                log::error!("Reorder of {} failed, rolling back: {e}", pending.item_move.item_id);
                pending.rollback.rollback(&mut self.items);
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Release the drag and persist the resulting move, if any.
    pub async fn on_drag_end(
        &mut self,
        over_id: Option<&str>,
        persistence: &dyn ReorderPersistence,
    ) -> Result<Option<ItemMove>, ReorderError> {
        match self.finish_drag(over_id) {
            DropOutcome::Moved(pending) => self.persist(pending, persistence).await.map(Some),
            DropOutcome::Ignored | DropOutcome::Cancelled | DropOutcome::Unchanged => Ok(None),
        }
    }

    // ─── Sections ─────────────────────────────────────────────────────

    /// Move the `active` day section to the slot held by `over`.
    ///
    /// Both sections must be scheduled days; the unscheduled section is
    /// pinned first and is never reordered.
    pub async fn move_section(
        &mut self,
        active: Bucket,
        over: Bucket,
        persistence: &dyn ReorderPersistence,
    ) -> Result<Option<Vec<i32>>, ReorderError> {
        let (Bucket::Day(from), Bucket::Day(to)) = (active, over) else {
            log::warn!("Section reorder {active} -> {over} refused");
            return Err(ReorderError::UnscheduledSectionFixed);
        };
        if self.is_dragging() {
            log::warn!("Section reorder refused during an active item drag");
            return Ok(None);
        }

        let days = day_numbers(&self.items);
        for bucket in [active, over] {
            if !bucket.day_number().is_some_and(|d| days.contains(&d)) {
                return Err(ReorderError::UnknownSection(bucket));
            }
        }

        let result = apply_optimistic(
            &mut self.items,
            |items| crate::itinerary::reorder_days(items, from, to),
            |order: Vec<i32>| async move { persistence.on_section_reorder(&order).await },
        )
        .await;

        if let Err(e) = &result {
            log::error!("Section reorder {active} -> {over} failed, rolled back: {e}");
            self.last_error = Some(e.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itinerary::check_dense;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        fail: bool,
        moves: Mutex<Vec<ItemMove>>,
        orders: Mutex<Vec<Vec<i32>>>,
    }

    impl Recorder {
        fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }
    }

    #[async_trait]
    impl ReorderPersistence for Recorder {
        async fn on_reorder(&self, item_move: &ItemMove) -> Result<(), ReorderError> {
            self.moves.lock().unwrap().push(item_move.clone());
            if self.fail {
                return Err(ReorderError::PersistFailed("network down".into()));
            }
            Ok(())
        }

        async fn on_section_reorder(&self, day_order: &[i32]) -> Result<(), ReorderError> {
            self.orders.lock().unwrap().push(day_order.to_vec());
            if self.fail {
                return Err(ReorderError::PersistFailed("network down".into()));
            }
            Ok(())
        }
    }

    fn sample() -> Vec<ItineraryItem> {
        vec![
            ItineraryItem::new("A", Some(1), 0),
            ItineraryItem::new("B", Some(1), 1),
            ItineraryItem::new("C", None, 0),
        ]
    }

    #[test]
    fn test_single_active_drag() {
        let mut board = ItineraryBoard::new(sample());
        assert!(board.on_drag_start("A"));
        assert!(!board.on_drag_start("B"));
        assert_eq!(board.active_id(), Some("A"));
    }

    #[test]
    fn test_drag_unknown_item_ignored() {
        let mut board = ItineraryBoard::new(sample());
        assert!(!board.on_drag_start("Z"));
        assert!(!board.is_dragging());
    }

    #[test]
    fn test_drag_over_previews_day_only() {
        let mut board = ItineraryBoard::new(sample());
        board.on_drag_start("C");
        assert!(board.on_drag_over("B"));
        let c = board.items().iter().find(|i| i.id == "C").unwrap();
        assert_eq!(c.day_number, Some(1));
        assert_eq!(c.position, 0);
        // Hovering over the same bucket again changes nothing.
        assert!(!board.on_drag_over("A"));
        assert!(!board.on_drag_over("bogus"));
    }

    #[test]
    fn test_drag_cancel_restores_snapshot() {
        let original = ItineraryBoard::new(sample()).items().to_vec();
        let mut board = ItineraryBoard::new(sample());
        board.on_drag_start("C");
        board.on_drag_over("day-1");
        board.on_drag_cancel();
        assert_eq!(board.items(), original.as_slice());
        assert!(!board.is_dragging());
    }

    #[test]
    fn test_finish_without_drag_is_ignored() {
        let mut board = ItineraryBoard::new(sample());
        assert!(matches!(board.finish_drag(Some("A")), DropOutcome::Ignored));
    }

    #[test]
    fn test_malformed_target_cancels() {
        let mut board = ItineraryBoard::new(sample());
        let before = board.items().to_vec();
        board.on_drag_start("A");
        board.on_drag_over("unscheduled");
        assert!(matches!(board.finish_drag(Some("week-3")), DropOutcome::Cancelled));
        assert_eq!(board.items(), before.as_slice());
        assert!(!board.is_dragging());
    }

    #[tokio::test]
    async fn test_drop_on_self_is_noop() {
        let recorder = Recorder::default();
        let mut board = ItineraryBoard::new(sample());
        let before = board.items().to_vec();

        board.on_drag_start("B");
        board.on_drag_over("unscheduled");
        let result = board.on_drag_end(Some("B"), &recorder).await;

        assert_eq!(result, Ok(None));
        assert_eq!(board.items(), before.as_slice());
        assert!(recorder.moves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_into_day_persists_move() {
        let recorder = Recorder::default();
        let mut board = ItineraryBoard::new(sample());

        board.on_drag_start("C");
        board.on_drag_over("B");
        let result = board.on_drag_end(Some("B"), &recorder).await;

        let expected = ItemMove {
            item_id: "C".into(),
            new_day_number: Some(1),
            new_position: 1,
        };
        assert_eq!(result, Ok(Some(expected.clone())));
        assert_eq!(*recorder.moves.lock().unwrap(), vec![expected]);

        let order: Vec<(&str, Option<i32>, u32)> = board
            .items()
            .iter()
            .map(|i| (i.id.as_str(), i.day_number, i.position))
            .collect();
        assert_eq!(order, vec![("A", Some(1), 0), ("C", Some(1), 1), ("B", Some(1), 2)]);
        assert!(!board.is_dragging());
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let recorder = Recorder::failing();
        let original = sample();
        let mut board = ItineraryBoard::new(original.clone());

        board.on_drag_start("A");
        let result = board.on_drag_end(Some("B"), &recorder).await;

        assert!(matches!(result, Err(ReorderError::PersistFailed(_))));
        assert_eq!(board.items(), original.as_slice());
        assert!(matches!(board.last_error(), Some(ReorderError::PersistFailed(_))));
        board.clear_error();
        assert!(board.last_error().is_none());
    }

    #[tokio::test]
    async fn test_failed_cross_bucket_drop_restores_original_list() {
        let recorder = Recorder::failing();
        let original = sample();
        let mut board = ItineraryBoard::new(original.clone());
        assert_eq!(board.items(), original.as_slice());

        // Day 1 position 0 to the end of the unscheduled bucket.
        board.on_drag_start("A");
        board.on_drag_over("unscheduled");
        let pending = match board.finish_drag(Some("unscheduled")) {
            DropOutcome::Moved(pending) => pending,
            other => panic!("expected a move, got {other:?}"),
        };
        assert_eq!(pending.item_move().new_day_number, None);
        assert_eq!(pending.item_move().new_position, 1);
        assert_ne!(board.items(), original.as_slice());

        let result = board.persist(pending, &recorder).await;
        assert!(matches!(result, Err(ReorderError::PersistFailed(_))));
        assert_eq!(board.items(), original.as_slice());
        assert_eq!(recorder.moves.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_on_self_leaves_original_list() {
        let recorder = Recorder::default();
        let original = sample();
        let mut board = ItineraryBoard::new(original.clone());

        board.on_drag_start("C");
        board.on_drag_over("day-1");
        assert_eq!(board.on_drag_end(Some("C"), &recorder).await, Ok(None));
        assert_eq!(board.items(), original.as_slice());
        assert!(recorder.moves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_outside_cancels() {
        let recorder = Recorder::default();
        let mut board = ItineraryBoard::new(sample());
        let before = board.items().to_vec();
        board.on_drag_start("A");
        board.on_drag_over("unscheduled");
        assert_eq!(board.on_drag_end(None, &recorder).await, Ok(None));
        assert_eq!(board.items(), before.as_slice());
    }

    #[tokio::test]
    async fn test_move_sequence_keeps_buckets_dense() {
        let recorder = Recorder::default();
        let mut board = ItineraryBoard::new(vec![
            ItineraryItem::new("a", Some(1), 0),
            ItineraryItem::new("b", Some(1), 1),
            ItineraryItem::new("c", Some(1), 2),
            ItineraryItem::new("d", Some(2), 0),
            ItineraryItem::new("e", Some(2), 1),
            ItineraryItem::new("f", None, 0),
        ]);

        let drops = [
            ("a", "c"),
            ("f", "day-2"),
            ("d", "a"),
            ("e", "unscheduled"),
            ("b", "f"),
            ("c", "day-3"),
            ("f", "e"),
            ("a", "a"),
        ];
        for (active, over) in drops {
            board.on_drag_start(active);
            board.on_drag_over(over);
            board.on_drag_end(Some(over), &recorder).await.unwrap();
            assert!(check_dense(board.items()).is_ok(), "after {active} -> {over}");
            assert_eq!(board.items().len(), 6);
        }
        assert!(board
            .items()
            .iter()
            .any(|i| i.id == "c" && i.day_number == Some(3) && i.position == 0));
    }

    #[tokio::test]
    async fn test_move_section_rejects_unscheduled() {
        let recorder = Recorder::default();
        let mut board = ItineraryBoard::new(sample());
        let result = board
            .move_section(Bucket::Unscheduled, Bucket::Day(1), &recorder)
            .await;
        assert_eq!(result, Err(ReorderError::UnscheduledSectionFixed));
        let result = board
            .move_section(Bucket::Day(1), Bucket::Unscheduled, &recorder)
            .await;
        assert_eq!(result, Err(ReorderError::UnscheduledSectionFixed));
        assert!(recorder.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_section_unknown_day() {
        let recorder = Recorder::default();
        let mut board = ItineraryBoard::new(sample());
        let result = board.move_section(Bucket::Day(1), Bucket::Day(4), &recorder).await;
        assert_eq!(result, Err(ReorderError::UnknownSection(Bucket::Day(4))));
    }

    #[tokio::test]
    async fn test_move_section_commits_and_rolls_back() {
        let items = vec![
            ItineraryItem::new("a", Some(1), 0),
            ItineraryItem::new("b", Some(2), 0),
            ItineraryItem::new("c", Some(2), 1),
        ];

        let ok = Recorder::default();
        let mut board = ItineraryBoard::new(items.clone());
        let order = board.move_section(Bucket::Day(2), Bucket::Day(1), &ok).await;
        assert_eq!(order, Ok(Some(vec![2, 1])));
        assert_eq!(*ok.orders.lock().unwrap(), vec![vec![2, 1]]);
        let a = board.items().iter().find(|i| i.id == "a").unwrap();
        assert_eq!(a.day_number, Some(2));
        assert!(check_dense(board.items()).is_ok());

        let failing = Recorder::failing();
        let mut board = ItineraryBoard::new(items.clone());
        let before = board.items().to_vec();
        let result = board.move_section(Bucket::Day(2), Bucket::Day(1), &failing).await;
        assert!(matches!(result, Err(ReorderError::PersistFailed(_))));
        assert_eq!(board.items(), before.as_slice());
        assert!(board.last_error().is_some());
    }

    #[test]
    fn test_replace_items_refused_mid_drag() {
        let mut board = ItineraryBoard::new(sample());
        board.on_drag_start("A");
        assert!(!board.replace_items(Vec::new()));
        board.on_drag_cancel();
        assert!(board.replace_items(vec![ItineraryItem::new("X", Some(3), 4)]));
        assert_eq!(board.items()[0].position, 0);
    }
}
