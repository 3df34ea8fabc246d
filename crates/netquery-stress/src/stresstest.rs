use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use netquery::Config;
use parking_lot::Mutex;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_operation};

/// The outcome of running one workload.
pub struct WorkloadReport {
    pub concurrency: usize,
    /// Durations of all finished operations, in seconds.
    pub durations: DDSketch,
    pub failures: usize,
    /// The number of fetches that actually reached the backend.
    pub fetches: usize,
}

impl WorkloadReport {
    pub fn operations(&self) -> usize {
        self.durations.count()
    }

    /// The share of operations that did not need a fetch of their own.
    pub fn dedup_ratio(&self) -> f64 {
        let operations = self.operations();
        if operations == 0 {
            return 0.0;
        }
        1.0 - (self.fetches.min(operations) as f64 / operations as f64)
    }

    fn quantile(&self, q: f64) -> Duration {
        let secs = self.durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    }
}

pub async fn perform_stresstest(
    config: &Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<Vec<WorkloadReport>> {
    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(prepare_workload(i, workload, config.queries)))
        .collect();

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_operation(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let deadline = Instant::now() + duration;
        let warmup_fetches = workload.backend.calls();

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if !process_operation(&workload).await {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = std::mem::take(&mut *task_durations.lock());
            WorkloadReport {
                concurrency,
                durations,
                failures: failures.load(Ordering::Relaxed),
                fetches: workload.backend.calls() - warmup_fetches,
            }
        });
        tasks.push(task);
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in futures::future::join_all(tasks).await {
        reports.push(task.context("workload task failed")?);
    }
    Ok(reports)
}

pub fn print_reports(reports: &[WorkloadReport], duration: Duration) {
    for (i, report) in reports.iter().enumerate() {
        let concurrency = report.concurrency;
        let ops = report.operations();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops == 0 {
            continue;
        }

        let fetches = report.fetches;
        let failures = report.failures;
        let dedup = report.dedup_ratio() * 100.0;
        println!("  fetches: {fetches}; failures: {failures}; served without fetch: {dedup:.1}%");

        let avg = Duration::from_secs_f64(report.durations.sum().unwrap_or_default() / ops as f64);
        let p50 = report.quantile(0.5);
        let p90 = report.quantile(0.9);
        let p99 = report.quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
}
