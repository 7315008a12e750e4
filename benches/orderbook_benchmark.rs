//! Benchmarks for order book operations

use binance_bridge::orderbook::OrderBook;
use binance_bridge::parser::BookLevel;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn make_levels(base: i64, count: usize, ascending: bool) -> Vec<BookLevel> {
    (0..count as i64)
        .map(|i| BookLevel {
            price: if ascending { base + i * 100 } else { base - i * 100 },
            qty: 15_000,
        })
        .collect()
}

fn benchmark_apply_snapshot(c: &mut Criterion) {
    let bids = make_levels(500_000_000, 1000, false);
    let asks = make_levels(500_100_000, 1000, true);

    c.bench_function("apply_snapshot_1000_levels", |b| {
        b.iter(|| {
            let mut book = OrderBook::new("BTCUSDT", 1);
            book.apply_snapshot(black_box(1000), black_box(&bids), black_box(&asks));
        })
    });
}

fn benchmark_apply_diff(c: &mut Criterion) {
    let bids = make_levels(500_000_000, 1000, false);
    let asks = make_levels(500_100_000, 1000, true);
    let mut book = OrderBook::new("BTCUSDT", 1);
    book.apply_snapshot(1000, &bids, &asks);

    let diff_bids = vec![BookLevel {
        price: 499_990_000,
        qty: 20_000,
    }];
    let diff_asks = vec![BookLevel {
        price: 500_100_000,
        qty: 25_000,
    }];

    let mut next_id = 1001u64;
    c.bench_function("apply_diff", |b| {
        b.iter(|| {
            book.apply_diff(
                black_box(next_id),
                black_box(next_id),
                black_box(&diff_bids),
                black_box(&diff_asks),
            );
            next_id += 1;
        })
    });
}

fn benchmark_generate_updates(c: &mut Criterion) {
    let bids = make_levels(500_000_000, 1000, false);
    let asks = make_levels(500_100_000, 1000, true);
    let mut book = OrderBook::new("BTCUSDT", 1);
    book.apply_snapshot(1000, &bids, &asks);

    c.bench_function("generate_updates_1000_levels", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(2001);
            book.generate_updates(&mut out);
            black_box(out);
        })
    });
}

criterion_group!(
    benches,
    benchmark_apply_snapshot,
    benchmark_apply_diff,
    benchmark_generate_updates
);
criterion_main!(benches);
