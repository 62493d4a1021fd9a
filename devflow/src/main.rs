//! Dependency-aware scheduler for AI-assisted delivery.
//!
//! Keeps a board of work items and developer stories in `.devflow/`, runs
//! ready stories on their own branches and worktrees, and records every
//! lifecycle step in an append-only execution log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use devflow::app::App;
use devflow::core::board::NewWorkItem;
use devflow::core::error::fault_category;
use devflow::core::types::{StoryId, WorkItemId, WorkItemType};
use devflow::exit_codes;
use devflow::implement::{StoryOutcome, implement_story, retry_story};
use devflow::io::init::{InitOptions, init_devflow};
use devflow::listing::{render_board, render_history, render_outcome};
use devflow::refine::refine_work_item;
use devflow::worker::run_pool;

#[derive(Parser)]
#[command(
    name = "devflow",
    version,
    about = "Dependency-aware scheduler for AI-assisted delivery"
)]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(short = 'C', long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Kind {
    UserStory,
    Bug,
}

impl From<Kind> for WorkItemType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::UserStory => WorkItemType::UserStory,
            Kind::Bug => WorkItemType::Bug,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create `.devflow/` with default config, an empty board and log.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a work item and print its id.
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, value_enum, default_value = "user-story")]
        kind: Kind,
        /// 1 (most urgent) through 9.
        #[arg(short, long, default_value_t = 5)]
        priority: u8,
        #[arg(short, long)]
        acceptance: Option<String>,
        /// Ref story branches start from (defaults to config `base_ref`).
        #[arg(long)]
        base_ref: Option<String>,
    },
    /// Ask the provider to break a work item into stories.
    Refine { work_item: u64 },
    /// Report what would run next without reserving it.
    Next {
        #[arg(short, long)]
        work_item: Option<u64>,
    },
    /// Run one story: the given one, or the next by priority.
    Implement {
        #[arg(short, long)]
        work_item: Option<u64>,
        #[arg(short, long)]
        story: Option<u64>,
    },
    /// Run ready stories concurrently until done, stalled or interrupted.
    Run {
        #[arg(short, long)]
        work_item: Option<u64>,
        /// Concurrent stories (defaults to config `workers`).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show work items and stories in dependency order.
    List,
    /// Make `dependent` wait for `required`.
    Depend {
        dependent: u64,
        required: u64,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Return a failed or blocked story to Ready.
    Retry {
        story: u64,
        /// Remove the worktree kept from the failed attempt.
        #[arg(long)]
        cleanup: bool,
    },
    /// Fail stories left in progress by a crashed run.
    Recover,
    /// Print a story's execution history.
    Log { story: u64 },
}

#[tokio::main]
async fn main() {
    devflow::logging::init();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error[{}]: {err:#}", fault_category(&err));
            exit_codes::FAULT
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    if let Command::Init { force } = cli.command {
        let paths = init_devflow(&root, &InitOptions { force })?;
        println!("initialized {}", paths.devflow_dir.display());
        return Ok(exit_codes::OK);
    }

    let app = Arc::new(App::open(&root)?);
    let code = match cli.command {
        Command::Init { .. } => exit_codes::OK,
        Command::Create {
            title,
            description,
            kind,
            priority,
            acceptance,
            base_ref,
        } => {
            let id = app.scheduler.create_work_item(NewWorkItem {
                kind: kind.into(),
                title,
                description,
                acceptance_criteria: acceptance,
                priority,
                base_ref,
            })?;
            println!("{id}");
            exit_codes::OK
        }
        Command::Refine { work_item } => {
            let cancel = cancel_on_ctrl_c();
            let created = refine_work_item(&app, WorkItemId(work_item), &cancel).await?;
            for story in created {
                println!("{story}");
            }
            exit_codes::OK
        }
        Command::Next { work_item } => {
            let outcome = app.scheduler.next_outcome(work_item.map(WorkItemId))?;
            println!("{}", render_outcome(&outcome));
            exit_codes::OK
        }
        Command::Implement { work_item, story } => {
            cmd_implement(&app, work_item.map(WorkItemId), story.map(StoryId)).await?
        }
        Command::Run { work_item, workers } => {
            let workers = workers.unwrap_or(app.config.workers);
            let cancel = cancel_on_ctrl_c();
            let report = run_pool(app.clone(), work_item.map(WorkItemId), workers, cancel).await?;
            println!("completed: {}", join_ids(&report.completed));
            println!("failed: {}", join_ids(&report.failed));
            println!("cancelled: {}", join_ids(&report.cancelled));
            println!("{}", render_outcome(&report.outcome));
            if report.cancelled.is_empty() {
                exit_codes::OK
            } else {
                eprintln!("error[cancelled]: run interrupted");
                exit_codes::FAULT
            }
        }
        Command::List => {
            print!("{}", render_board(&app.scheduler.snapshot()?)?);
            exit_codes::OK
        }
        Command::Depend {
            dependent,
            required,
            description,
        } => {
            app.scheduler
                .add_dependency(StoryId(dependent), StoryId(required), description)?;
            exit_codes::OK
        }
        Command::Retry { story, cleanup } => {
            retry_story(&app, StoryId(story), cleanup).await?;
            exit_codes::OK
        }
        Command::Recover => {
            let recovery = app.scheduler.recover()?;
            if recovery.is_empty() {
                println!("nothing to recover");
            }
            for story in recovery.stories {
                println!("story {story}");
            }
            for item in recovery.work_items {
                println!("work item {item}");
            }
            exit_codes::OK
        }
        Command::Log { story } => {
            let story = StoryId(story);
            app.scheduler.snapshot()?.story(story)?;
            let entries = app
                .log()
                .lock()
                .map_err(|_| anyhow::anyhow!("execution log poisoned"))?
                .query_by_story(story);
            print!("{}", render_history(story, &entries)?);
            exit_codes::OK
        }
    };
    app.scheduler.flush_log()?;
    Ok(code)
}

async fn cmd_implement(
    app: &App,
    scope: Option<WorkItemId>,
    story: Option<StoryId>,
) -> Result<i32> {
    let cancel = cancel_on_ctrl_c();
    let Some(run) = implement_story(app, scope, story, &cancel).await? else {
        println!("{}", render_outcome(&app.scheduler.next_outcome(scope)?));
        return Ok(exit_codes::OK);
    };
    let branch = run.branch.as_deref().unwrap_or("-");
    match run.outcome {
        StoryOutcome::Completed(_) => {
            println!("story {} completed on {branch}", run.story);
            Ok(exit_codes::OK)
        }
        StoryOutcome::Failed {
            failure,
            category,
            reason,
        } => {
            eprintln!(
                "error[{category}]: story {} failed (attempt {}): {reason}",
                run.story, failure.attempts
            );
            Ok(exit_codes::FAULT)
        }
        StoryOutcome::Cancelled => {
            eprintln!("error[cancelled]: story {} cancelled", run.story);
            Ok(exit_codes::FAULT)
        }
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

fn join_ids(ids: &[StoryId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
