//! Programmatic control of an out-of-process replay
//!
//! `ExternalReplayer` spawns a master replay process with a fresh control
//! block, then exposes polling, waiting and killing to the embedding
//! application. It never blocks on the child except in [`ExternalReplayer::wait`].

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};

use crate::control_block::Progress;
use crate::shm::ControlRegion;

/// Options for starting a replay under external control.
#[derive(Debug, Clone, Default)]
pub struct ExternalReplayerOptions {
    /// Archive to replay.
    pub database: PathBuf,
    /// Replayer binary; defaults to the current executable.
    pub external_replayer_path: Option<PathBuf>,
    /// Pass `--on-disk-pipeline-cache` to the master.
    pub on_disk_pipeline_cache: Option<PathBuf>,
    /// Enable the in-memory driver pipeline cache.
    pub pipeline_cache: bool,
    /// Worker/slice count handed to the master.
    pub num_threads: u32,
    /// Silence slave logging.
    pub quiet: bool,
}

/// Result of one progress poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The master has not begun publishing progress yet.
    NotReady,
    /// Progress snapshot is valid; the job is still running.
    Running,
    /// Progress snapshot is valid and the job has finished.
    Complete,
    /// The control block cannot be interpreted.
    Error,
}

/// Handle to a replay master running in a child process.
pub struct ExternalReplayer {
    child: Child,
    region: ControlRegion,
}

impl ExternalReplayer {
    /// Create the shared control block and spawn the master.
    pub fn start(opts: &ExternalReplayerOptions) -> Result<Self> {
        let region = ControlRegion::create_shared()?;
        let fd = region
            .shm_fd()
            .context("shared control region is missing its fd")?;

        let program = match &opts.external_replayer_path {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("Failed to locate replayer binary")?,
        };

        let mut command = Command::new(&program);
        command
            .arg("--master-process")
            .arg("--num-threads")
            .arg(opts.num_threads.max(1).to_string())
            .arg("--shm-fd")
            .arg(fd.to_string());
        if opts.quiet {
            command.arg("--quiet-slave");
        }
        if opts.pipeline_cache {
            command.arg("--pipeline-cache");
        }
        if let Some(path) = &opts.on_disk_pipeline_cache {
            command.arg("--on-disk-pipeline-cache").arg(path);
        }
        command.arg(&opts.database);
        command.stdin(Stdio::null());

        tracing::info!(program = %program.display(), "starting external replayer");
        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn replayer {}", program.display()))?;

        Ok(Self { child, region })
    }

    /// Snapshot progress. `out` is only meaningful for `Running`/`Complete`.
    pub fn poll_progress(&self, out: &mut Progress) -> PollResult {
        let block = self.region.block();
        if block.is_version_mismatch() {
            return PollResult::Error;
        }
        if !block.is_initialized() || !block.has_started() {
            return PollResult::NotReady;
        }

        *out = block.snapshot();
        if block.is_complete() {
            PollResult::Complete
        } else {
            PollResult::Running
        }
    }

    /// Non-blocking exit check; fills `exit_code` when the child is gone.
    pub fn is_process_complete(&mut self, exit_code: Option<&mut i32>) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                if let Some(out) = exit_code {
                    *out = status.code().unwrap_or(-1);
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::error!("Failed to poll replayer process: {err}");
                false
            }
        }
    }

    /// Block until the master exits.
    pub fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .context("Failed to wait for replayer process")?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Force-terminate the master; its own teardown kills active slaves.
    pub fn kill(&mut self) -> Result<()> {
        self.child.kill().context("Failed to kill replayer process")?;
        Ok(())
    }

    /// Hashes of shader modules implicated in crashed pipeline creations.
    pub fn faulty_spirv_modules(&self) -> Vec<u64> {
        self.region.block().faulty_modules()
    }
}
