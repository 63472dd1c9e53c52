use std::{
    sync::{Arc, Barrier, mpsc},
    time::Instant,
};

use clap::Parser;
use dispatcher::{ApplicationContext, BuiltinHandlerFactory, DispatchError, ServerRegistry};
use log::{info, warn};
use schema::{
    AccessLevel, Acl, AclEntryKind, ApplicationDefinition, CachePolicyDefinition,
    DatasetDefinition, Request,
};

/// Drives one in-process application with concurrent callers and reports
/// how admission control split them.
#[derive(Debug, Clone, Parser)]
#[command(name = "admission-load")]
struct Args {
    #[arg(long, default_value_t = 16)]
    concurrency: usize,
    #[arg(long, default_value_t = 100)]
    requests_per_worker: usize,
    /// Admission ceiling (max threads) of the application under load.
    #[arg(long, default_value_t = 4)]
    ceiling: usize,
    #[arg(long, default_value_t = 2)]
    handler_delay_ms: u64,
    #[arg(long, default_value_t = 10)]
    warmup_requests: usize,
    /// Cache responses keyed on the `q` parameter.
    #[arg(long)]
    cache: bool,
    /// Number of distinct `q` values the callers cycle through.
    #[arg(long, default_value_t = 8)]
    distinct_queries: usize,
}

#[derive(Debug, Default)]
struct WorkerStats {
    accepted: usize,
    rejected: usize,
    failed: usize,
    latencies_ms: Vec<f64>,
    sample_errors: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.concurrency == 0 || args.requests_per_worker == 0 || args.ceiling == 0 {
        eprintln!("--concurrency, --requests-per-worker and --ceiling must be > 0");
        std::process::exit(2);
    }

    if let Err(err) = run(args) {
        eprintln!("admission-load failed: {err}");
        std::process::exit(1);
    }
}

fn application(args: &Args) -> ApplicationDefinition {
    let mut app = ApplicationDefinition::new(1, "load", "load", args.ceiling);
    app.acl = Acl::default().with_entry("anyone", AclEntryKind::Anyone, AccessLevel::QUERY);
    let mut dataset = DatasetDefinition::new(1, "Search", "search.xml", "echo");
    dataset
        .settings
        .insert("delay_ms".to_string(), args.handler_delay_ms.to_string());
    if args.cache {
        dataset.cache = Some(CachePolicyDefinition {
            enabled: true,
            key_parameters: vec!["q".to_string()],
            ..CachePolicyDefinition::default()
        });
    }
    app.datasets.push(dataset);
    app
}

fn run(args: Args) -> Result<(), String> {
    let registry = ServerRegistry::new(ApplicationContext::new(Arc::new(BuiltinHandlerFactory)));
    let app = registry
        .start_application(application(&args))
        .map_err(|err| format!("application did not start: {err}"))?;

    for warmup_idx in 0..args.warmup_requests {
        let mut request = search_request(&args, 0, warmup_idx);
        if let Err(err) = registry.dispatch(&mut request) {
            warn!("warmup request {warmup_idx} failed: {err}");
        }
    }

    let total_requests = args.concurrency * args.requests_per_worker;
    let barrier = Barrier::new(args.concurrency);
    let (tx, rx) = mpsc::channel::<WorkerStats>();
    let started_at = Instant::now();

    std::thread::scope(|scope| {
        for worker_idx in 0..args.concurrency {
            let tx = tx.clone();
            let (registry, barrier, args) = (&registry, &barrier, &args);
            scope.spawn(move || {
                let mut stats = WorkerStats::default();
                barrier.wait();
                for request_idx in 0..args.requests_per_worker {
                    let mut request = search_request(args, worker_idx, request_idx);
                    let req_started = Instant::now();
                    match registry.dispatch(&mut request) {
                        Ok(()) => {
                            stats.accepted += 1;
                            stats
                                .latencies_ms
                                .push(req_started.elapsed().as_secs_f64() * 1000.0);
                        }
                        Err(DispatchError::CapacityExceeded { .. }) => stats.rejected += 1,
                        Err(err) => {
                            stats.failed += 1;
                            if stats.sample_errors.len() < 4 {
                                stats.sample_errors.push(err.to_string());
                            }
                        }
                    }
                }
                let _ = tx.send(stats);
            });
        }
    });
    drop(tx);

    let elapsed_seconds = started_at.elapsed().as_secs_f64();
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut failed = 0usize;
    let mut latencies_ms = Vec::with_capacity(total_requests);
    let mut errors = Vec::new();
    for stats in rx {
        accepted += stats.accepted;
        rejected += stats.rejected;
        failed += stats.failed;
        latencies_ms.extend(stats.latencies_ms);
        for err in stats.sample_errors {
            if errors.len() >= 10 {
                break;
            }
            errors.push(err);
        }
    }

    latencies_ms.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = if latencies_ms.is_empty() {
        0.0
    } else {
        latencies_ms.iter().sum::<f64>() / latencies_ms.len() as f64
    };
    let snapshot = app.statistics();

    println!("Admission load benchmark");
    println!("ceiling: {}", app.ceiling());
    println!("concurrency: {}", args.concurrency);
    println!("requests_per_worker: {}", args.requests_per_worker);
    println!("total_requests: {total_requests}");
    println!("accepted_requests: {accepted}");
    println!("rejected_requests: {rejected}");
    println!("failed_requests: {failed}");
    println!(
        "rejection_rate_pct: {:.2}",
        (rejected as f64 / total_requests as f64) * 100.0
    );
    println!("peak_in_flight: {}", app.peak_in_flight());
    println!("cache_hits: {}", snapshot.cache_hit_total);
    println!("elapsed_seconds: {:.4}", elapsed_seconds);
    println!(
        "throughput_rps: {:.2}",
        accepted as f64 / elapsed_seconds.max(0.0001)
    );
    println!("latency_avg_ms: {:.4}", avg_ms);
    println!("latency_p50_ms: {:.4}", percentile(&latencies_ms, 0.50));
    println!("latency_p95_ms: {:.4}", percentile(&latencies_ms, 0.95));
    println!("latency_p99_ms: {:.4}", percentile(&latencies_ms, 0.99));

    let in_flight = app.in_flight();
    let peak = app.peak_in_flight();
    registry.shutdown_all();
    info!("admission load finished in {elapsed_seconds:.3}s");

    if peak > args.ceiling {
        return Err(format!("peak in flight {peak} exceeded ceiling {}", args.ceiling));
    }
    if in_flight != 0 {
        return Err(format!("{in_flight} admission slots leaked"));
    }
    if failed > 0 {
        for err in errors {
            println!("error_sample: {err}");
        }
        return Err(format!("{failed} requests failed"));
    }
    if accepted == 0 {
        return Err("no accepted requests".to_string());
    }
    Ok(())
}

fn search_request(args: &Args, worker_idx: usize, request_idx: usize) -> Request {
    let query = (worker_idx + request_idx) % args.distinct_queries.max(1);
    Request::new("load", "search.xml").with_param("q", &format!("term-{query}"))
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (((sorted.len() - 1) as f64) * quantile).round() as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_nearest_rank() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.50), 3.0);
        assert_eq!(percentile(&sorted, 0.99), 5.0);
        assert_eq!(percentile(&[], 0.95), 0.0);
    }

    #[test]
    fn args_default_to_a_saturating_load() {
        let args = Args::parse_from(["admission-load"]);
        assert!(args.concurrency > args.ceiling);
        assert!(!args.cache);

        let args = Args::parse_from(["admission-load", "--ceiling", "2", "--cache"]);
        let app = application(&args);
        assert_eq!(app.admission_ceiling(), 2);
        assert!(app.datasets[0].cache.as_ref().is_some_and(|cache| cache.enabled));
    }
}
