// src/lib.rs

pub mod cells;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod sink;
pub mod stream;
pub mod transport;
pub mod types;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cells::{CodeBlock, MarkerState, cells, compute_marker_state, find_code_block};
use crate::cli::CliArgs;
use crate::config::load_or_default;
use crate::engine::handle::DEFAULT_CHANNEL_CAPACITY;
use crate::engine::{Anchor, Coordinator, CoordinatorHandle, KernelSpec, Runtime, RuntimeOptions};
use crate::sink::TerminalSink;
use crate::stream::StreamSettings;
use crate::transport::{KernelCommand, ProcessLauncher};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - cell selection from the source file
/// - coordinator / runtime / bridge process
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let mut cfg = load_or_default(args.config.as_deref())?;
    if let Some(kernel) = &args.kernel {
        cfg.kernel.name = kernel.clone();
    }

    let source = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let lines: Vec<&str> = source.lines().collect();
    let state = compute_marker_state(&lines, 0);
    let blocks = select_blocks(&args, &state, lines.len())?;

    if args.dry_run {
        print_dry_run(&args.file, &state, &blocks);
        return Ok(());
    }

    let blocks: Vec<&CodeBlock> = blocks
        .iter()
        .filter(|b| !b.code(&lines).trim().is_empty())
        .collect();
    if blocks.is_empty() {
        info!(file = %args.file.display(), "nothing to run");
        return Ok(());
    }

    let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
    let sink = TerminalSink::stdout().with_prompts(prompt_tx);
    let failures = sink.failures();

    let core = Coordinator::new(
        KernelSpec::from_config(&cfg.kernel),
        cfg.coordinator.restart_queue,
        RuntimeOptions::default(),
    );
    let launcher = ProcessLauncher::new(KernelCommand::from_config(&cfg.kernel));
    let (handle, rt_rx) = engine::channel(DEFAULT_CHANNEL_CAPACITY);
    let runtime = Runtime::new(core, rt_rx, launcher, sink, StreamSettings::from(&cfg.stream));
    let runtime_task = tokio::spawn(runtime.run());

    // Ctrl-C → interrupt and drop the queue; a second Ctrl-C stops.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            let _ = handle.interrupt(true).await;
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = handle.stop().await;
            }
        });
    }

    tokio::spawn(answer_prompts(handle.clone(), prompt_rx));

    info!(cells = blocks.len(), kernel = %cfg.kernel.name, "submitting cells");
    for block in blocks {
        let anchor_line = if block.meta.is_some() {
            block.start - 1
        } else {
            block.start
        };
        let seq = handle
            .submit(block.code(&lines), Anchor::new(0, anchor_line, block.start))
            .await
            .context("failed to submit cell")?;
        debug!(seq, start = block.start, end = block.end, "cell submitted");
    }
    handle.exit_when_idle().await?;

    runtime_task.await.context("runtime task failed")??;

    let failed = failures.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{failed} cell(s) failed");
    }
    Ok(())
}

/// Answer kernel input requests with lines read from our own stdin.
async fn answer_prompts(handle: CoordinatorHandle, mut prompts: mpsc::UnboundedReceiver<String>) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while prompts.recv().await.is_some() {
        let text = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => String::new(),
            Err(e) => {
                warn!(error = %e, "failed reading stdin for kernel input");
                String::new()
            }
        };
        if handle.reply_stdin(text).await.is_err() {
            break;
        }
    }
}

/// Cells to run: the one under `--row`, or all of them.
fn select_blocks(args: &CliArgs, state: &MarkerState, line_count: usize) -> Result<Vec<CodeBlock>> {
    let Some(row) = args.row else {
        return Ok(cells(state, line_count));
    };

    let cursor = usize::try_from(row - 1).context("--row out of range")?;
    if cursor >= line_count {
        bail!(
            "--row {row} is past the end of {} ({line_count} lines)",
            args.file.display()
        );
    }

    match find_code_block(state, line_count, cursor, args.include_subcells) {
        Some(block) => Ok(vec![block]),
        None => {
            info!(row, "no cell at this row");
            Ok(Vec::new())
        }
    }
}

/// Simple dry-run output: print markers and the spans that would run.
fn print_dry_run(file: &Path, state: &MarkerState, blocks: &[CodeBlock]) {
    println!("cellrunner dry-run: {}", file.display());
    println!("  parents = {}", state.parent_total);
    println!();

    println!("markers ({}):", state.markers.len());
    for marker in state.iter() {
        println!("  line {:>4}  [{marker}]", marker.row + 1);
    }
    println!();

    println!("cells to run ({}):", blocks.len());
    for block in blocks {
        let name = match &block.meta {
            Some(marker) => marker.to_string(),
            None => "(top)".to_string(),
        };
        println!("  lines {}-{}  {name}", block.start + 1, block.end + 1);
    }

    debug!("dry-run complete (no execution)");
}
