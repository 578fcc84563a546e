//! Progress supervisor mode
//!
//! Runs a master as a child process and polls the shared control block twice
//! a second, printing human-readable progress. An optional wall-clock
//! timeout acts as the deadlock watchdog: there is no in-band detection, a
//! hung driver simply stops making progress until the supervisor kills the
//! process tree.

use std::time::{Duration, Instant};

use anyhow::Result;

use replay_control::{ExternalReplayer, ExternalReplayerOptions, PollResult, Progress};

use crate::Cli;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn log_progress(progress: &Progress) {
    tracing::info!("=================");
    tracing::info!(" progress report:");
    tracing::info!(
        "   graphics {} / {}, skipped {}",
        progress.graphics.completed,
        progress.graphics.total,
        progress.graphics.skipped
    );
    tracing::info!(
        "   compute {} / {}, skipped {}",
        progress.compute.completed,
        progress.compute.total,
        progress.compute.skipped
    );
    tracing::info!(
        "   modules {}, banned {}",
        progress.total_modules,
        progress.banned_modules
    );
    tracing::info!("   clean crashes {}", progress.clean_crashes);
    tracing::info!("   dirty crashes {}", progress.dirty_crashes);
    tracing::info!("=================");
}

fn log_faulty_modules(replayer: &ExternalReplayer) {
    for hash in replayer.faulty_spirv_modules() {
        tracing::info!("detected faulty SPIR-V module: {hash:016x}");
    }
}

pub fn run(cli: &Cli) -> Result<i32> {
    let opts = ExternalReplayerOptions {
        database: cli.database.clone(),
        external_replayer_path: None,
        on_disk_pipeline_cache: cli.on_disk_pipeline_cache.clone(),
        pipeline_cache: cli.wants_pipeline_cache(),
        num_threads: cli.worker_threads(),
        quiet: true,
    };

    let mut replayer = ExternalReplayer::start(&opts)?;
    let start = Instant::now();
    let mut has_killed = false;

    loop {
        if !has_killed {
            if let Some(timeout) = cli.timeout {
                if start.elapsed() >= Duration::from_secs(timeout) {
                    tracing::error!("killing replay process due to timeout");
                    replayer.kill()?;
                    has_killed = true;
                }
            }
        }

        std::thread::sleep(POLL_INTERVAL);

        let mut progress = Progress::default();
        let result = replayer.poll_progress(&mut progress);

        if replayer.is_process_complete(None) {
            if result != PollResult::NotReady {
                log_progress(&progress);
            }
            log_faulty_modules(&replayer);
            return replayer.wait();
        }

        match result {
            PollResult::Error => return Ok(1),
            PollResult::NotReady => {}
            PollResult::Running | PollResult::Complete => {
                log_progress(&progress);
                if result == PollResult::Complete {
                    log_faulty_modules(&replayer);
                    return replayer.wait();
                }
            }
        }
    }
}
