//! autospec-dag CLI: thin front-end over the engine library.
//!
//! Maps subcommands onto the library operations and library errors onto
//! process exit codes. Exit code 0 means the run completed with every spec
//! completed; anything else is non-zero.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autospec_dag::agent::CommandAgent;
use autospec_dag::cancel::{install_signal_handler, CancelToken};
use autospec_dag::cleanup;
use autospec_dag::config::Config;
use autospec_dag::dag::{self, status_counts, Document, RunStatus, SpecStatus};
use autospec_dag::git_ops;
use autospec_dag::resume;
use autospec_dag::scheduler::{self, RunOptions};
use autospec_dag::staging::{self, BatchMergeOptions, StagingEngine};
use autospec_dag::worktree::Worktrees;

#[derive(Parser)]
#[command(
    name = "autospec-dag",
    version,
    about = "Parallel DAG execution engine for agent-driven code generation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a DAG of specs
    Run {
        /// Path to the DAG definition file
        dag_file: PathBuf,
        /// Maximum concurrent specs (default 4)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Cancel the run as soon as any spec fails
        #[arg(long)]
        fail_fast: bool,
        /// Reuse worktrees of previously-failed specs
        #[arg(long)]
        force: bool,
        /// Discard any prior run state before starting
        #[arg(long)]
        fresh: bool,
    },
    /// Resume an interrupted run, re-driving only incomplete specs
    Resume {
        dag_file: PathBuf,
        /// Reuse worktrees of previously-failed specs
        #[arg(long)]
        force: bool,
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long)]
        fail_fast: bool,
    },
    /// Merge completed spec branches into the base branch (batch mode)
    Merge {
        dag_file: PathBuf,
        /// Print the merge plan without merging
        #[arg(long)]
        dry_run: bool,
        /// Skip specs with no commits instead of failing
        #[arg(long)]
        skip_no_commits: bool,
        /// Merge even when worktrees have uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// Remove worktrees of merged specs (everything, with --force)
    Cleanup {
        /// DAG definition file(s)
        #[arg(required = true)]
        dag_files: Vec<PathBuf>,
        /// Also remove unmerged/failed worktrees and delete branches
        #[arg(long)]
        force: bool,
        /// Clean every given DAG whose run is not currently running
        #[arg(long)]
        all_runs: bool,
    },
    /// Show per-spec status from the state file
    Status { dag_file: PathBuf },
}

fn main() {
    if !atty::is(atty::Stream::Stdout) {
        colored::control::set_override(false);
    }

    let cli = Cli::parse();
    let exit_code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            dag_file,
            max_parallel,
            fail_fast,
            force,
            fresh,
        } => cmd_run(&dag_file, max_parallel, fail_fast, force, fresh),
        Commands::Resume {
            dag_file,
            force,
            max_parallel,
            fail_fast,
        } => cmd_resume(&dag_file, force, max_parallel, fail_fast),
        Commands::Merge {
            dag_file,
            dry_run,
            skip_no_commits,
            force,
        } => cmd_merge(&dag_file, dry_run, skip_no_commits, force),
        Commands::Cleanup {
            dag_files,
            force,
            all_runs,
        } => cmd_cleanup(&dag_files, force, all_runs),
        Commands::Status { dag_file } => cmd_status(&dag_file),
    }
}

fn load_config(max_parallel: Option<usize>, fail_fast: bool) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(n) = max_parallel {
        config.max_parallel = n.max(1);
    }
    if fail_fast {
        config.fail_fast = true;
    }
    config.validate()?;
    Ok(config)
}

fn run_options(force: bool) -> Result<RunOptions> {
    let cancel = CancelToken::new();
    if let Err(e) = install_signal_handler(Arc::clone(&cancel)) {
        eprintln!("{} Could not install signal handler: {}", "⚠".yellow(), e);
    }

    let mut opts = RunOptions::new(cancel);
    opts.force = force;

    if atty::is(atty::Stream::Stderr) {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{bar:30.cyan/dim} {pos}/{len} {msg}")
                .expect("progress template is valid"),
        );
        opts.on_progress = Some(Box::new(move |snapshot| {
            bar.set_length(snapshot.total as u64);
            bar.set_position((snapshot.completed + snapshot.failed + snapshot.blocked) as u64);
            bar.set_message(format!(
                "{} running, {} failed",
                snapshot.running, snapshot.failed
            ));
            if snapshot.is_complete() {
                bar.finish_and_clear();
            }
        }));
    }
    Ok(opts)
}

fn cmd_run(
    dag_file: &Path,
    max_parallel: Option<usize>,
    fail_fast: bool,
    force: bool,
    fresh: bool,
) -> Result<i32> {
    let config = load_config(max_parallel, fail_fast)?;
    let mut doc = Document::load(dag_file)?;
    dag::validate(&doc)?;

    if doc.has_inline_state() {
        if fresh {
            doc.clear_state();
            doc.save()?;
        } else if let Some(run) = &doc.run {
            if run.status == RunStatus::Completed {
                anyhow::bail!(
                    "run '{}' already completed; use --fresh to start over",
                    run.run_id
                );
            }
            anyhow::bail!(
                "{} has prior run state (run '{}', status {}); use `resume` to continue or --fresh to discard it",
                dag_file.display(),
                run.run_id,
                run.status
            );
        } else {
            anyhow::bail!(
                "{} has prior spec state; use `resume` to continue or --fresh to discard it",
                dag_file.display()
            );
        }
    }

    println!(
        "{} Running DAG '{}' ({} specs, max parallel {})",
        "→".cyan(),
        doc.dag_id(),
        doc.spec_count(),
        config.max_parallel
    );

    let agent = Arc::new(CommandAgent::new(config.agent_cmd.clone()));
    let opts = run_options(force)?;
    let status = scheduler::start(doc, config, agent, opts)?;

    print_summary(dag_file)?;
    Ok(exit_code_for(status))
}

fn cmd_resume(
    dag_file: &Path,
    force: bool,
    max_parallel: Option<usize>,
    fail_fast: bool,
) -> Result<i32> {
    let config = load_config(max_parallel, fail_fast)?;
    let agent = Arc::new(CommandAgent::new(config.agent_cmd.clone()));
    let opts = run_options(force)?;

    println!("{} Resuming {}", "→".cyan(), dag_file.display());
    let status = resume::resume(dag_file, config, agent, opts)?;

    print_summary(dag_file)?;
    Ok(exit_code_for(status))
}

fn cmd_merge(dag_file: &Path, dry_run: bool, skip_no_commits: bool, force: bool) -> Result<i32> {
    let config = load_config(None, false)?;
    let mut doc = Document::load(dag_file)?;
    dag::validate(&doc)?;

    let repo_root = git_ops::repo_root(definition_dir(dag_file).as_path())?;
    let engine = StagingEngine::new(&repo_root);

    let result = staging::batch_merge(
        &mut doc,
        &engine,
        &config,
        BatchMergeOptions {
            dry_run,
            skip_no_commits,
            force,
        },
    );
    // Merge sub-state (including merge_failed) must survive even when the
    // phase aborts on a conflict
    doc.save()?;
    let report = result?;

    if dry_run {
        println!("{} Merge plan ({} specs):", "→".cyan(), report.planned.len());
        for spec_id in &report.planned {
            println!("  {} {}", "•".cyan(), spec_id);
        }
        return Ok(0);
    }

    for spec_id in &report.merged {
        println!("{} Merged {}", "✓".green(), spec_id);
    }
    for spec_id in &report.skipped_no_commits {
        println!("{} Skipped {} (no commits)", "→".yellow(), spec_id);
    }
    Ok(0)
}

fn cmd_cleanup(dag_files: &[PathBuf], force: bool, all_runs: bool) -> Result<i32> {
    let config = load_config(None, false)?;

    let mut docs = Vec::new();
    for path in dag_files {
        docs.push(Document::load(path)?);
    }
    let repo_root = git_ops::repo_root(definition_dir(&docs[0].path).as_path())?;
    let worktrees = Worktrees::new(&repo_root, config.worktree_root(&repo_root));

    let report = if all_runs {
        cleanup::cleanup_all(&docs, &worktrees, force)
    } else {
        let mut report = cleanup::CleanupReport::default();
        for doc in &docs {
            let partial = cleanup::cleanup_run(doc, &worktrees, force);
            report.cleaned.extend(partial.cleaned);
            report.kept.extend(partial.kept);
            report.errors.extend(partial.errors);
            report.warnings.extend(partial.warnings);
        }
        report
    };

    for spec_id in &report.cleaned {
        println!("{} Removed worktree for {}", "✓".green(), spec_id);
    }
    for spec_id in &report.kept {
        println!("{} Kept {} (not merged; use --force)", "→".yellow(), spec_id);
    }
    for warning in &report.warnings {
        println!("{} {}", "⚠".yellow(), warning);
    }
    for (spec_id, error) in &report.errors {
        println!("{} {}: {}", "✗".red(), spec_id, error);
    }
    Ok(if report.errors.is_empty() { 0 } else { 1 })
}

fn cmd_status(dag_file: &Path) -> Result<i32> {
    let doc = Document::load(dag_file)?;
    dag::validate(&doc)?;

    if let Some(run) = &doc.run {
        println!(
            "Run {} ({}): started {}",
            run.run_id.bold(),
            colored_run_status(run.status),
            run.started_at.as_deref().unwrap_or("-")
        );
    } else {
        println!("No run state; DAG has not been executed yet.");
    }
    println!();
    println!("{:<24} {:<11} {:<10} BRANCH", "SPEC", "STATUS", "MERGE");

    for feature in doc.dag.features() {
        let rt = doc.specs.get(&feature.id).cloned().unwrap_or_default();
        let merge = rt
            .merge
            .as_ref()
            .map(|m| m.status.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<11} {:<10} {}",
            feature.id,
            colored_spec_status(rt.status),
            merge,
            rt.branch.as_deref().unwrap_or("-")
        );
    }

    let counts = status_counts(&doc);
    println!();
    println!(
        "{} completed, {} failed, {} blocked, {} pending, {} running",
        counts.completed, counts.failed, counts.blocked, counts.pending, counts.running
    );
    Ok(0)
}

fn definition_dir(dag_file: &Path) -> PathBuf {
    dag_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn colored_spec_status(status: SpecStatus) -> String {
    let text = status.to_string();
    match status {
        SpecStatus::Completed => text.green().to_string(),
        SpecStatus::Failed => text.red().to_string(),
        SpecStatus::Running => text.cyan().to_string(),
        SpecStatus::Blocked => text.yellow().to_string(),
        SpecStatus::Pending => text.dimmed().to_string(),
    }
}

fn colored_run_status(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Completed => text.green().to_string(),
        RunStatus::Failed | RunStatus::Interrupted => text.red().to_string(),
        RunStatus::Running => text.cyan().to_string(),
        RunStatus::Pending => text.dimmed().to_string(),
    }
}

fn print_summary(dag_file: &Path) -> Result<()> {
    let doc = Document::load(dag_file)?;
    let counts = status_counts(&doc);

    println!("\n{}", "═".repeat(60).dimmed());
    println!("{}", "Run complete:".bold());
    println!("  {} {} specs completed", "✓".green(), counts.completed);
    if counts.failed > 0 {
        println!("  {} {} specs failed", "✗".red(), counts.failed);
    }
    if counts.blocked > 0 {
        println!("  {} {} specs blocked", "⚠".yellow(), counts.blocked);
    }
    if counts.pending > 0 {
        println!("  {} {} specs pending", "→".yellow(), counts.pending);
    }
    println!("{}", "═".repeat(60).dimmed());

    for feature in doc.dag.features() {
        if let Some(rt) = doc.specs.get(&feature.id) {
            if rt.status == SpecStatus::Failed {
                println!(
                    "  {} {}: {}",
                    "✗".red(),
                    feature.id,
                    rt.failure_reason.as_deref().unwrap_or("unknown failure")
                );
            }
        }
    }
    Ok(())
}

fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => 0,
        _ => 1,
    }
}
