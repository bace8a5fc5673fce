// FerroDB
// Copyright (C) 2025 FerroDB Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Submit/drain throughput of the two pool backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use ferrodb_scheduler::{CentralThreadPool, WorkStealingThreadPool};

const TASKS: usize = 10_000;

fn drain<F>(push: F, done: &Arc<AtomicUsize>)
where
    F: Fn(Box<dyn FnOnce() + Send>),
{
    done.store(0, Ordering::Relaxed);
    for _ in 0..TASKS {
        let done = Arc::clone(done);
        push(Box::new(move || {
            done.fetch_add(1, Ordering::Relaxed);
        }));
    }
    while done.load(Ordering::Relaxed) < TASKS {
        std::hint::spin_loop();
    }
}

fn bench_central(c: &mut Criterion) {
    let mut group = c.benchmark_group("central_pool");
    group.measurement_time(Duration::from_secs(10));
    for workers in [1, 4, 8] {
        let pool = CentralThreadPool::new("bench-sched", workers);
        pool.start().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        group.bench_function(format!("submit_drain_{workers}_workers"), |b| {
            b.iter(|| drain(|job| pool.push_work(job), &done));
        });
        pool.shutdown();
    }
    group.finish();
}

fn bench_work_stealing(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_stealing_pool");
    group.measurement_time(Duration::from_secs(10));
    for workers in [1, 4, 8] {
        let pool = WorkStealingThreadPool::new("bench-steal", workers);
        pool.start().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        group.bench_function(format!("submit_drain_{workers}_workers"), |b| {
            b.iter(|| drain(|job| pool.push_work(job), &done));
        });
        pool.shutdown();
    }
    group.finish();
}

criterion_group!(benches, bench_central, bench_work_stealing);
criterion_main!(benches);
