//! redoline workload driver
//!
//! Commits MTRs from several threads against a redo log in a data
//! directory and prints the commit statistics as JSON. Comparing
//! `--preset low_concurrency` with the default shows what the bounded
//! closed-log wait costs at a given thread count.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::info;
use rand::Rng;
use serde::Serialize;

use redoline::redo::{CommitStatsSnapshot, LatchTable, PageLsnTable};
use redoline::{LogRecord, PageId, PageStore, RedoConfig, RedoManager};

struct Options {
    threads: usize,
    mtrs: usize,
    record_size: usize,
    pages: u32,
    data_dir: PathBuf,
    durable: bool,
    config: RedoConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threads: 4,
            mtrs: 10_000,
            record_size: 64,
            pages: 1024,
            data_dir: PathBuf::from("./redo-data"),
            durable: false,
            config: RedoConfig::default(),
        }
    }
}

#[derive(Serialize)]
struct Report {
    threads: usize,
    mtrs_per_thread: usize,
    record_size: usize,
    elapsed_ms: u128,
    commits_per_sec: f64,
    config: RedoConfig,
    stats: CommitStatsSnapshot,
}

fn print_help() {
    println!("redoline - MTR commit pipeline workload driver");
    println!();
    println!("Usage: redoline [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -t, --threads N        Committing threads (default: 4)");
    println!("  -n, --mtrs N           MTRs per thread (default: 10000)");
    println!("  -s, --record-size B    Redo bytes per MTR (default: 64)");
    println!("      --pages N          Distinct pages to modify (default: 1024)");
    println!("  -d, --data-dir DIR     Data directory (default: ./redo-data)");
    println!("      --preset NAME      default, synchronous, high_throughput, low_concurrency");
    println!("      --config FILE      JSON file with RedoConfig overrides");
    println!("      --durable          Wait for durability after every commit");
    println!("  -h, --help             Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--threads" | "-t", Some(v)) => {
                options.threads = v.parse()?;
                i += 1;
            }
            ("--mtrs" | "-n", Some(v)) => {
                options.mtrs = v.parse()?;
                i += 1;
            }
            ("--record-size" | "-s", Some(v)) => {
                options.record_size = v.parse()?;
                i += 1;
            }
            ("--pages", Some(v)) => {
                options.pages = v.parse()?;
                i += 1;
            }
            ("--data-dir" | "-d", Some(v)) => {
                options.data_dir = PathBuf::from(v);
                i += 1;
            }
            ("--preset", Some(v)) => {
                options.config = RedoConfig::preset(v)
                    .ok_or_else(|| format!("unknown preset: {}", v))?;
                i += 1;
            }
            ("--config", Some(v)) => {
                options.config = RedoConfig::from_json_file(&PathBuf::from(v))?;
                i += 1;
            }
            ("--durable", _) => options.durable = true,
            ("--help" | "-h", _) => {
                print_help();
                return Ok(());
            }
            (other, _) => {
                return Err(format!("unrecognised argument: {} (try --help)", other).into());
            }
        }
        i += 1;
    }
    if options.pages == 0 || options.record_size == 0 {
        return Err("--pages and --record-size must be positive".into());
    }

    info!(
        "Starting workload: {} threads x {} MTRs, {} bytes each",
        options.threads, options.mtrs, options.record_size
    );

    let pages = Arc::new(PageLsnTable::new());
    let manager = Arc::new(RedoManager::open(
        options.data_dir.clone(),
        options.config.clone(),
        Arc::clone(&pages) as Arc<dyn PageStore>,
    )?);
    if let Some(recovered) = manager.take_recovered() {
        if recovered.blocks > 0 {
            info!(
                "Recovered {} redo bytes above checkpoint LSN {}",
                recovered.redo.len(),
                recovered.checkpoint_lsn()
            );
        }
    }

    let latches = LatchTable::new();
    let started = Instant::now();
    let mut handles = Vec::with_capacity(options.threads);
    for _ in 0..options.threads {
        let manager = Arc::clone(&manager);
        let latches = Arc::clone(&latches);
        let (mtrs, record_size, page_count, durable) =
            (options.mtrs, options.record_size, options.pages, options.durable);

        handles.push(thread::spawn(move || -> redoline::Result<()> {
            let mut rng = rand::thread_rng();
            for _ in 0..mtrs {
                let page = PageId::new(0, rng.gen_range(0..page_count));
                let mut payload = vec![0u8; record_size];
                rng.fill(payload.as_mut_slice());

                let mut mtr = manager.begin();
                mtr.memo_latch(Box::new(latches.x_lock(page)?))?;
                mtr.set_modified(page)?;
                mtr.log(LogRecord::new(payload))?;

                if durable {
                    manager.commit_durable(mtr)?;
                } else {
                    manager.commit(mtr)?;
                }
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| "workload thread panicked")??;
    }
    manager.flush_up_to(manager.current_lsn())?;
    let elapsed = started.elapsed();

    let checkpoint = manager.checkpoint()?;
    info!(
        "Workload done: durable LSN {}, checkpoint LSN {}, {} dirty pages",
        manager.durable_lsn(),
        checkpoint.checkpoint_lsn,
        pages.dirty_count()
    );

    let commits = (options.threads * options.mtrs) as f64;
    let report = Report {
        threads: options.threads,
        mtrs_per_thread: options.mtrs,
        record_size: options.record_size,
        elapsed_ms: elapsed.as_millis(),
        commits_per_sec: commits / elapsed.as_secs_f64().max(f64::EPSILON),
        config: options.config,
        stats: manager.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown()?;
    Ok(())
}
