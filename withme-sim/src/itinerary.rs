//! A scripted drag-and-drop session over one trip's itinerary.

use log::{info, warn};
use withme_collab::{ItemStore, StoreError, TripItinerary};
use withme_core::itinerary::{check_dense, sort_rendered};
use withme_core::{Bucket, ItineraryBoard, ItineraryItem};

fn demo_items(trip_id: &str) -> Vec<ItineraryItem> {
    [
        ("item-museum", Some(1), 0, "Gulbenkian Museum"),
        ("item-tram", Some(1), 1, "Tram 28"),
        ("item-belem", Some(2), 0, "Belém Tower"),
        ("item-fado", Some(2), 1, "Fado night"),
        ("item-sintra", None, 0, "Day trip to Sintra"),
    ]
    .into_iter()
    .map(|(id, day, pos, title)| {
        ItineraryItem::new(id, day, pos)
            .with_trip(trip_id)
            .with_title(title)
    })
    .collect()
}

fn layout(items: &[ItineraryItem]) -> String {
    let mut items = items.to_vec();
    sort_rendered(&mut items);
    items
        .iter()
        .map(|i| format!("{}@{}:{}", i.id, i.bucket(), i.position))
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn run<S: ItemStore + ?Sized>(trip_id: &str, store: &S) -> Result<(), StoreError> {
    let itinerary = TripItinerary::new(store, trip_id);
    if itinerary.load().await?.is_empty() {
        store.put_items(trip_id, &demo_items(trip_id)).await?;
    }

    let mut board = ItineraryBoard::new(itinerary.load().await?);
    info!("Itinerary: {}", layout(board.items()));

    // Unscheduled Sintra onto day 1, in front of the tram.
    let drags = [
        ("item-sintra", Some("item-tram")),
        ("item-fado", Some("day-1")),
        ("item-museum", Some("item-museum")),
    ];
    for (active, over) in drags {
        board.on_drag_start(active);
        if let Some(over) = over {
            board.on_drag_over(over);
        }
        match board.on_drag_end(over, &itinerary).await {
            Ok(Some(moved)) => info!(
                "Moved {} to {} position {}",
                moved.item_id,
                Bucket::from_day(moved.new_day_number),
                moved.new_position
            ),
            Ok(None) => info!("Drag of {active} changed nothing"),
            Err(e) => warn!("Drag of {active} rolled back: {e}"),
        }
    }

    match board
        .move_section(Bucket::Day(2), Bucket::Day(1), &itinerary)
        .await
    {
        Ok(Some(order)) => info!("Days reordered to {order:?}"),
        Ok(None) => info!("Day order unchanged"),
        Err(e) => warn!("Day reorder rolled back: {e}"),
    }
    if let Err(e) = board
        .move_section(Bucket::Unscheduled, Bucket::Day(1), &itinerary)
        .await
    {
        info!("Refused as expected: {e}");
    }

    let stored = itinerary.load().await?;
    if let Err(violation) = check_dense(&stored) {
        warn!("Stored itinerary is not dense: {violation}");
    }
    info!("Stored itinerary: {}", layout(&stored));
    Ok(())
}
