use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::Ipv4Addr;

use dns_cache::entry::Cent;
use dns_cache::store::{Cache, TtlLimits};
use dns_types::protocol::types::test_util::*;
use dns_types::protocol::types::RecordTypeWithData;

fn cent_with_a(name: &str, ts: u64, a: u8) -> Cent {
    let mut cent = Cent::new(domain(name), 0);
    cent.add_record(
        300,
        ts,
        0,
        RecordTypeWithData::A {
            address: Ipv4Addr::new(10, 0, 0, a),
        },
    )
    .unwrap();
    cent
}

fn populated(entries: usize) -> Cache {
    let mut cache = Cache::new(10 * 1024, TtlLimits::default());
    for i in 0..entries {
        cache.add_cache(cent_with_a(&format!("host{i}.example.com."), i as u64, 1), i as u64);
    }
    cache
}

fn bench_add(c: &mut Criterion) {
    c.bench_function("add 1000 entries", |b| {
        b.iter(|| black_box(populated(1000)));
    });
}

fn bench_lookup(c: &mut Criterion) {
    let cache = populated(1000);
    let name = domain("host500.example.com.");
    c.bench_function("lookup hit", |b| {
        b.iter(|| black_box(cache.lookup(&name)));
    });

    let miss = domain("missing.example.net.");
    c.bench_function("lookup miss", |b| {
        b.iter(|| black_box(cache.lookup(&miss)));
    });
}

fn bench_purge(c: &mut Criterion) {
    c.bench_function("purge 1000 timed-out entries", |b| {
        b.iter_with_setup(
            || populated(1000),
            |mut cache| {
                cache.purge(u64::MAX, false);
                black_box(cache)
            },
        );
    });
}

criterion_group!(benches, bench_add, bench_lookup, bench_purge);
criterion_main!(benches);
