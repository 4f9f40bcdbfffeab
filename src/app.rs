//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - sets up logging
//! - resolves weights and discovers subjects
//! - runs the batch and prints the summary

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::{Backend, ExternalToolkit, ToolkitSettings};
use crate::cli::{Command, ModelArgs, RunArgs};
use crate::domain::{BatchConfig, FoldSelector, ParallelLimits};
use crate::error::AppError;
use crate::schedule::Scheduler;

pub mod pipeline;

pub const ENV_LOG: &str = "OB_LOG";

/// Entry point for the `ob` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    // `ob -s ... -w ... -o ...` behaves like `ob run ...`. Clap requires a
    // subcommand name, so argv is rewritten before parsing.
    let argv = rewrite_args(std::env::args().collect());
    let cli = crate::cli::Cli::parse_from(argv);

    match cli.command {
        Command::Run(args) => {
            init_logging(args.debug);
            handle_run(args)
        }
        Command::Resolve(args) => {
            init_logging(false);
            handle_resolve(args)
        }
    }
}

/// `OB_LOG` takes precedence; otherwise `info`, or `debug` with `--debug`.
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_run(args: RunArgs) -> Result<(), AppError> {
    let config = batch_config_from_args(&args)?;
    let batch = pipeline::prepare_batch(&config)?;

    let toolkit = ExternalToolkit::new(ToolkitSettings::from_env()?);
    let scheduler = Scheduler::new(Backend::toolkit(toolkit));
    watch_interrupts(scheduler.cancel_flag())?;
    let output = pipeline::execute_batch(&batch, config.fold, &scheduler, config.debug)?;

    println!("{}", crate::report::format_batch_summary(&output.report));
    Ok(())
}

/// Ctrl-C stores `true` in `cancel`: running subjects finish, the rest are
/// cancelled and the batch is still collected. A second Ctrl-C exits at once.
fn watch_interrupts(cancel: Arc<AtomicBool>) -> Result<(), AppError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::runtime(format!("Failed to start the interrupt watcher: {e}")))?;

    thread::Builder::new()
        .name("ob-interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                let mut received = 0u32;
                while tokio::signal::ctrl_c().await.is_ok() {
                    received += 1;
                    if received > 1 {
                        error!("second interrupt; exiting without collecting outputs");
                        std::process::exit(130);
                    }
                    warn!("interrupt received; running subjects will finish (Ctrl-C again to exit now)");
                    cancel.store(true, Ordering::SeqCst);
                }
            })
        })
        .map_err(|e| AppError::runtime(format!("Failed to start the interrupt watcher: {e}")))?;
    Ok(())
}

fn handle_resolve(args: ModelArgs) -> Result<(), AppError> {
    let fold = FoldSelector::from_index(args.model);
    let weights =
        pipeline::resolve_weights(&args.loc_arc, &args.loc_root(), &args.seg_arc, &args.seg_root(), fold)?;

    println!("Localization ({}, all folds):", args.loc_arc);
    for (name, path) in weights.localization.iter() {
        println!("  {name:<24} {}", path.display());
    }
    println!("Segmentation ({}, {fold}):", args.seg_arc);
    for (name, path) in weights.segmentation.iter() {
        println!("  {name:<24} {}", path.display());
    }
    Ok(())
}

/// Validate CLI values and turn them into a `BatchConfig` with absolute paths.
/// Work and output directories are created here.
pub fn batch_config_from_args(args: &RunArgs) -> Result<BatchConfig, AppError> {
    if !args.scans_dir.is_dir() {
        return Err(AppError::config(format!(
            "Scans directory '{}' does not exist.",
            args.scans_dir.display()
        )));
    }
    if let Some(list) = &args.subject_list
        && !list.is_file()
    {
        return Err(AppError::config(format!("Subject list '{}' does not exist.", list.display())));
    }
    if args.name.is_empty() || args.name.contains(['/', '\\']) {
        return Err(AppError::config(format!("Invalid batch name '{}'.", args.name)));
    }

    let work_dir = ensure_dir(&args.work_dir)?;
    let output_dir = ensure_dir(&args.output_dir)?;

    Ok(BatchConfig {
        scans_dir: absolute(&args.scans_dir)?,
        work_dir,
        output_dir,
        subjects: args.subjects.clone(),
        subject_list: args.subject_list.as_deref().map(absolute).transpose()?,
        input_pattern: args.input_pattern.clone(),
        batch_size: args.batch_size,
        fold: FoldSelector::from_index(args.models.model),
        no_cuda: args.no_cuda,
        save_logits: args.logits,
        loc_arc: args.models.loc_arc.clone(),
        seg_arc: args.models.seg_arc.clone(),
        loc_dir: absolute(&args.models.loc_root())?,
        seg_dir: absolute(&args.models.seg_root())?,
        debug: args.debug,
        limits: ParallelLimits {
            max_processes: args.processes,
            max_gpus: args.ngpus,
            max_processes_per_gpu: args.ngpuproc,
        },
        name: args.name.clone(),
    })
}

fn ensure_dir(path: &Path) -> Result<PathBuf, AppError> {
    fs::create_dir_all(path)
        .map_err(|e| AppError::config(format!("Failed to create directory '{}': {e}", path.display())))?;
    absolute(path)
}

fn absolute(path: &Path) -> Result<PathBuf, AppError> {
    std::path::absolute(path)
        .map_err(|e| AppError::config(format!("Failed to resolve path '{}': {e}", path.display())))
}

/// Rewrite argv so a bare flag list defaults to `ob run`.
///
/// Rules:
/// - `ob`                      -> unchanged (clap prints usage)
/// - `ob -s DIR ...`           -> `ob run -s DIR ...`
/// - `ob --help/--version/-h`  -> unchanged (show top-level help/version)
fn rewrite_args(mut argv: Vec<String>) -> Vec<String> {
    let Some(arg1) = argv.get(1).cloned() else {
        return argv;
    };

    let is_top_level_help_or_version = matches!(
        arg1.as_str(),
        "-h" | "--help" | "-V" | "--version" | "help"
    );
    if is_top_level_help_or_version {
        return argv;
    }

    let is_subcommand = matches!(arg1.as_str(), "run" | "resolve");
    if is_subcommand {
        return argv;
    }

    if arg1.starts_with('-') {
        argv.insert(1, "run".to_string());
    }
    argv
}
