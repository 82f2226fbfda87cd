use criterion::{black_box, criterion_group, criterion_main, Criterion};
use withme_core::itinerary::{
    apply_move, check_dense, destination, renormalize, reorder_days, Bucket, DropTarget,
    ItineraryItem,
};

/// `days` buckets of `per_day` items each, plus `per_day` unscheduled.
fn trip(days: i32, per_day: u32) -> Vec<ItineraryItem> {
    let mut items = Vec::new();
    for pos in 0..per_day {
        items.push(ItineraryItem::new(format!("u{pos}"), None, pos));
    }
    for day in 1..=days {
        for pos in 0..per_day {
            items.push(ItineraryItem::new(format!("d{day}-{pos}"), Some(day), pos));
        }
    }
    items
}

fn bench_destination(c: &mut Criterion) {
    let items = trip(10, 20);
    let active = items[5].clone();
    let target = DropTarget::Item("d7-12".into());

    c.bench_function("destination_220_items", |b| {
        b.iter(|| black_box(destination(black_box(&items), &active, &target)))
    });
}

fn bench_apply_move_cross_bucket(c: &mut Criterion) {
    let items = trip(10, 20);

    c.bench_function("apply_move_cross_bucket_220_items", |b| {
        b.iter(|| {
            let mut items = items.clone();
            black_box(apply_move(&mut items, "d2-3", Bucket::Day(9), 4));
        })
    });
}

fn bench_renormalize(c: &mut Criterion) {
    let mut items = trip(10, 20);
    for (i, item) in items.iter_mut().enumerate() {
        item.position = (i as u32 * 7) % 97;
    }

    c.bench_function("renormalize_220_items", |b| {
        b.iter(|| {
            let mut items = items.clone();
            renormalize(&mut items);
            black_box(check_dense(&items).is_ok());
        })
    });
}

fn bench_reorder_days(c: &mut Criterion) {
    let items = trip(10, 20);

    c.bench_function("reorder_days_10_days", |b| {
        b.iter(|| {
            let mut items = items.clone();
            black_box(reorder_days(&mut items, 10, 1));
        })
    });
}

criterion_group!(
    benches,
    bench_destination,
    bench_apply_move_cross_bucket,
    bench_renormalize,
    bench_reorder_days,
);
criterion_main!(benches);
