use bdd_core::config::SchedulerConfig;
use bdd_core::scheduler::{call_task, spawn_task, sync_task, Scheduler, TaskBody};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

#[derive(Copy, Clone)]
struct Fib(u32);

impl TaskBody for Fib {
    type Output = u64;
    fn run(self) -> u64 {
        if self.0 < 2 {
            return self.0 as u64;
        }
        let left = spawn_task(Fib(self.0 - 1));
        let right = call_task(Fib(self.0 - 2));
        sync_task(left) + right
    }
}

fn fib_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_fib");
    for workers in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            // A fresh `Scheduler` per iteration: `startup` spawns worker threads that only stop
            // once `exit` runs, so reusing one scheduler across iterations without joining in
            // between would leak a thread pool per sample instead of measuring steady-state work.
            b.iter_batched(
                || Scheduler::init(SchedulerConfig::default().with_workers(workers)),
                |mut scheduler| {
                    let result = scheduler.startup(1 << 20, |_: &mut ()| call_task(Fib(25)), &mut ());
                    scheduler.exit();
                    result
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, fib_benchmark);
criterion_main!(benches);
