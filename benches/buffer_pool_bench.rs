use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use std::sync::Arc;
use basaltdb::BufferPoolManager;

// Create temporary db for benchmarking
fn create_bench_buffer_pool(pool_size: usize) -> Arc<BufferPoolManager> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path, 2).unwrap());

    // Keep the temp file alive
    std::mem::forget(temp_file);

    buffer_pool
}

fn buffer_pool_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferPool");

    for size in [16usize, 128, 1024].iter() {
        group.bench_with_input(
            BenchmarkId::new("sequential_access", size),
            size,
            |b, &size| {
                let buffer_pool = create_bench_buffer_pool(size);

                let mut page_ids = Vec::new();
                for i in 0..size {
                    let (page, page_id) = buffer_pool.new_page().unwrap();
                    {
                        let mut page_guard = page.write();
                        page_guard.data[0] = i as u8;
                    }
                    buffer_pool.unpin_page(page_id, true);
                    page_ids.push(page_id);
                }

                b.iter(|| {
                    for &page_id in &page_ids {
                        let page = buffer_pool.fetch_page(page_id).unwrap();
                        {
                            let _page_guard = page.read();
                        }
                        buffer_pool.unpin_page(page_id, false);
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("random_access_with_pressure", size),
            size,
            |b, &size| {
                // Twice as many pages as frames, so fetches churn the replacer
                let buffer_pool = create_bench_buffer_pool(size);

                let mut page_ids = Vec::new();
                for _ in 0..size * 2 {
                    let (_, page_id) = buffer_pool.new_page().unwrap();
                    buffer_pool.unpin_page(page_id, true);
                    page_ids.push(page_id);
                }

                let mut rng = StdRng::seed_from_u64(17);
                b.iter(|| {
                    let page_id = *page_ids.choose(&mut rng).unwrap();
                    let page = buffer_pool.fetch_page(page_id).unwrap();
                    {
                        let _page_guard = page.read();
                    }
                    buffer_pool.unpin_page(page_id, false);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, buffer_pool_benchmark);
criterion_main!(benches);
