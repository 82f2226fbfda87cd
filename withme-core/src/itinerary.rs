//! Itinerary items and the position arithmetic behind drag-and-drop.
//!
//! Items are grouped into buckets: one per day number plus the
//! unscheduled pseudo-day. Within a bucket, positions are dense and
//! 0-based. Every operation in this module that moves items finishes by
//! renormalizing the buckets it touched, so the invariant holds after
//! each completed move even when the input had gaps or duplicates.
//!
//! ```text
//!  drop target ──► destination() ──► (bucket, position)
//!                                        │
//!                                        ▼
//!                       apply_move(): close gap at source,
//!                       open gap at target, renormalize
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ───────────────────────────────────────────────────────────────────
// Buckets
// ───────────────────────────────────────────────────────────────────

/// Grouping key for itinerary items.
///
/// The derived ordering is the rendered order: unscheduled first, then
/// days ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bucket {
    Unscheduled,
    Day(i32),
}

impl Bucket {
    pub fn from_day(day_number: Option<i32>) -> Self {
        match day_number {
            Some(day) => Bucket::Day(day),
            None => Bucket::Unscheduled,
        }
    }

    pub fn day_number(&self) -> Option<i32> {
        match self {
            Bucket::Day(day) => Some(*day),
            Bucket::Unscheduled => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Day(day) => write!(f, "day-{day}"),
            Bucket::Unscheduled => f.write_str("unscheduled"),
        }
    }
}

/// A container id that is neither `unscheduled` nor `day-<n>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid container id {0:?}")]
pub struct InvalidContainer(pub String);

impl FromStr for Bucket {
    type Err = InvalidContainer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "unscheduled" {
            return Ok(Bucket::Unscheduled);
        }
        s.strip_prefix("day-")
            .and_then(|n| n.parse::<i32>().ok())
            .map(Bucket::Day)
            .ok_or_else(|| InvalidContainer(s.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Items
// ───────────────────────────────────────────────────────────────────

/// The subset of an itinerary item that reordering cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryItem {
    pub id: String,
    pub trip_id: String,
    pub title: String,
    /// `None` is the unscheduled bucket.
    pub day_number: Option<i32>,
    pub position: u32,
}

impl ItineraryItem {
    pub fn new(id: impl Into<String>, day_number: Option<i32>, position: u32) -> Self {
        Self {
            id: id.into(),
            trip_id: String::new(),
            title: String::new(),
            day_number,
            position,
        }
    }

    pub fn with_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = trip_id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::from_day(self.day_number)
    }
}

/// The `(itemId, newDayNumber, newPosition)` triple a committed move persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMove {
    pub item_id: String,
    pub new_day_number: Option<i32>,
    pub new_position: u32,
}

/// Where a dragged item was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropTarget {
    /// On top of another item.
    Item(String),
    /// On a bucket's container (usually an empty one).
    Container(Bucket),
}

impl DropTarget {
    /// Resolve a raw drop id: item ids win over container ids.
    pub fn resolve(id: &str, items: &[ItineraryItem]) -> Result<Self, InvalidContainer> {
        if items.iter().any(|item| item.id == id) {
            return Ok(DropTarget::Item(id.to_string()));
        }
        id.parse().map(DropTarget::Container)
    }
}

/// A bucket whose positions are not exactly `0..count`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bucket {bucket} has positions {positions:?}")]
pub struct DensityViolation {
    pub bucket: Bucket,
    pub positions: Vec<u32>,
}

// ───────────────────────────────────────────────────────────────────
// Ordering helpers
// ───────────────────────────────────────────────────────────────────

/// Stable sort into rendered order: by bucket, then position.
pub fn sort_rendered(items: &mut [ItineraryItem]) {
    items.sort_by_key(|item| (item.bucket(), item.position));
}

/// Number of items in `bucket`.
pub fn bucket_len(items: &[ItineraryItem], bucket: Bucket) -> usize {
    items.iter().filter(|item| item.bucket() == bucket).count()
}

/// Distinct scheduled day numbers, ascending.
pub fn day_numbers(items: &[ItineraryItem]) -> Vec<i32> {
    items
        .iter()
        .filter_map(|item| item.day_number)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Reassign dense 0-based positions within each of `buckets`.
///
/// Ties are broken by the current list order, so a duplicated position
/// keeps whichever item came first. The list itself is not reordered,
/// and a bucket that is already dense comes out unchanged.
pub fn renormalize_buckets(items: &mut [ItineraryItem], buckets: &[Bucket]) {
    let mut ranked: Vec<usize> = (0..items.len())
        .filter(|&i| buckets.contains(&items[i].bucket()))
        .collect();
    ranked.sort_by_key(|&i| (items[i].bucket(), items[i].position));

    let mut current: Option<(Bucket, u32)> = None;
    for i in ranked {
        let bucket = items[i].bucket();
        let next = match current {
            Some((b, n)) if b == bucket => n,
            _ => 0,
        };
        items[i].position = next;
        current = Some((bucket, next + 1));
    }
}

/// Renormalize every bucket present in the list.
pub fn renormalize(items: &mut [ItineraryItem]) {
    let buckets: Vec<Bucket> = items
        .iter()
        .map(ItineraryItem::bucket)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    renormalize_buckets(items, &buckets);
}

/// Check that every bucket's positions are exactly `0..count`.
pub fn check_dense(items: &[ItineraryItem]) -> Result<(), DensityViolation> {
    let buckets: BTreeSet<Bucket> = items.iter().map(ItineraryItem::bucket).collect();
    for bucket in buckets {
        let mut positions: Vec<u32> = items
            .iter()
            .filter(|item| item.bucket() == bucket)
            .map(|item| item.position)
            .collect();
        positions.sort_unstable();
        let dense = positions.iter().enumerate().all(|(i, p)| *p as usize == i);
        if !dense {
            return Err(DensityViolation { bucket, positions });
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Moves
// ───────────────────────────────────────────────────────────────────

/// Compute where `active` lands when dropped on `target`.
///
/// Returns the destination bucket and the final position in that bucket
/// once the active item has left its source slot. `None` when the target
/// item is unknown.
///
/// Dropping on an item takes that item's slot. Within one bucket, moving
/// downward inserts after the target (so the target ends up above the
/// dragged item); across buckets, and on ties, the dragged item goes in
/// front of the target. Dropping on a container appends.
pub fn destination(
    items: &[ItineraryItem],
    active: &ItineraryItem,
    target: &DropTarget,
) -> Option<(Bucket, u32)> {
    let source = active.bucket();

    let (bucket, insert_at) = match target {
        DropTarget::Item(over_id) if *over_id == active.id => (source, active.position),
        DropTarget::Item(over_id) => {
            let over = items.iter().find(|item| item.id == *over_id)?;
            let bucket = over.bucket();
            let moving_down = bucket == source && active.position < over.position;
            (bucket, over.position + u32::from(moving_down))
        }
        DropTarget::Container(bucket) => {
            let next = items
                .iter()
                .filter(|item| item.bucket() == *bucket)
                .map(|item| item.position + 1)
                .max()
                .unwrap_or(0);
            (*bucket, next)
        }
    };

    // `insert_at` counts slots in a list that still holds the active item.
    let mut position = if bucket == source && insert_at > active.position {
        insert_at - 1
    } else {
        insert_at
    };

    let remaining = bucket_len(items, bucket) - usize::from(bucket == source);
    position = position.min(remaining as u32);
    Some((bucket, position))
}

/// Move `active_id` to `position` in `target`, shifting its neighbours.
///
/// Closes the gap at the source slot, opens one at the target slot, then
/// renormalizes both buckets and leaves the list in rendered order.
/// Returns the persisted triple with the item's final position, or
/// `None` if the item is not in the list.
pub fn apply_move(
    items: &mut [ItineraryItem],
    active_id: &str,
    target: Bucket,
    position: u32,
) -> Option<ItemMove> {
    let index = items.iter().position(|item| item.id == active_id)?;
    let source = items[index].bucket();
    let old_position = items[index].position;

    for (i, item) in items.iter_mut().enumerate() {
        if i == index {
            continue;
        }
        let bucket = item.bucket();
        if bucket == source && item.position > old_position {
            item.position -= 1;
        }
        if bucket == target && item.position >= position {
            item.position += 1;
        }
    }

    let moved = &mut items[index];
    moved.day_number = target.day_number();
    moved.position = position;

    renormalize_buckets(items, &[source, target]);
    sort_rendered(items);

    let moved = items.iter().find(|item| item.id == active_id)?;
    Some(ItemMove {
        item_id: moved.id.clone(),
        new_day_number: moved.day_number,
        new_position: moved.position,
    })
}

/// Move a whole day bucket from `from_day`'s slot to `to_day`'s slot.
///
/// Day numbers are slots: after the move, the bucket that now sits in
/// the i-th slot takes the i-th smallest day number. Positions inside
/// each bucket are untouched. Returns the new order expressed in the old
/// day numbers, or `None` when nothing moves or a day is unknown.
pub fn reorder_days(items: &mut [ItineraryItem], from_day: i32, to_day: i32) -> Option<Vec<i32>> {
    let days = day_numbers(items);
    let from = days.iter().position(|d| *d == from_day)?;
    let to = days.iter().position(|d| *d == to_day)?;
    if from == to {
        return None;
    }

    let mut order = days.clone();
    let moved = order.remove(from);
    order.insert(to, moved);

    for item in items.iter_mut() {
        if let Some(day) = item.day_number {
            if let Some(slot) = order.iter().position(|d| *d == day) {
                item.day_number = Some(days[slot]);
            }
        }
    }
    sort_rendered(items);
    Some(order)
}
