use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pubmed_research_mcp::repositories::cache_key;
use pubmed_research_mcp::MemoryCache;
use std::time::Duration;

fn benchmark_cache_key(c: &mut Criterion) {
    c.bench_function("cache_key", |b| {
        b.iter(|| cache_key(black_box("breast cancer immunotherapy"), 20, 30, "relevance"));
    });
}

fn benchmark_memory_cache(c: &mut Criterion) {
    let cache = MemoryCache::new(100, Duration::from_secs(300));
    for i in 0..100 {
        cache.set(format!("key-{i}"), i);
    }

    c.bench_function("memory_cache_hit", |b| {
        b.iter(|| cache.get(black_box("key-42")));
    });

    // every insert of a new key into a full cache evicts one entry
    let mut next = 100_u64;
    c.bench_function("memory_cache_evicting_set", |b| {
        b.iter(|| {
            next += 1;
            cache.set(format!("key-{next}"), 0);
        });
    });
}

criterion_group!(benches, benchmark_cache_key, benchmark_memory_cache);
criterion_main!(benches);
