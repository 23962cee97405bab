//! CLI command definitions and dispatch.

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tabled::{Table, Tabled};
use taskforge_core::{Frame, TaskStatus};

use crate::client::TaskforgeClient;

const BANNER: &str = r#"
   ▣ taskforge
   Orchestrate staged agent pipelines from the terminal.
"#;

/// `taskforge` — operator CLI for the task execution engine.
#[derive(Parser)]
#[command(
    name = "taskforge",
    version,
    about = "▣ taskforge — orchestrate staged agent pipelines",
    long_about = BANNER,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Server URL (overrides TASKFORGE_URL).
    #[arg(long, global = true, env = "TASKFORGE_URL")]
    pub url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new task and immediately start its pipeline.
    Create(CreateArgs),

    /// List known tasks.
    List,

    /// Get a single task's current status.
    Get(TaskIdArgs),

    /// Stream a task's events live until it finishes.
    Watch(TaskIdArgs),

    /// Request cooperative cancellation of a running task.
    Stop(TaskIdArgs),

    /// Delete a task's durable record.
    Delete(TaskIdArgs),
}

#[derive(Args)]
pub struct CreateArgs {
    /// The requirement to hand to the PM stage.
    pub input_prompt: String,

    /// Optional short title.
    #[arg(long, short)]
    pub title: Option<String>,

    /// Only create the task; don't start its pipeline.
    #[arg(long)]
    pub no_start: bool,
}

#[derive(Args)]
pub struct TaskIdArgs {
    pub task_id: String,
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let client = match cli.url {
        Some(url) => TaskforgeClient::new(&url)?,
        None => TaskforgeClient::from_env()?,
    };

    match cli.command {
        Commands::Create(args) => create(&client, args).await,
        Commands::List => list(&client).await,
        Commands::Get(args) => get(&client, args).await,
        Commands::Watch(args) => watch(&client, args).await,
        Commands::Stop(args) => stop(&client, args).await,
        Commands::Delete(args) => delete(&client, args).await,
    }
}

async fn create(client: &TaskforgeClient, args: CreateArgs) -> anyhow::Result<()> {
    let task = client
        .create_task(&args.input_prompt, args.title.as_deref())
        .await?;
    println!(
        "  {} Created task {}",
        "✓".green().bold(),
        task.id.cyan()
    );

    if !args.no_start {
        client.start_task(&task.id).await?;
        println!("  {} Pipeline started", "→".dimmed());
        println!(
            "  {} Watch it with: {}",
            "→".dimmed(),
            format!("taskforge watch {}", task.id).green()
        );
    }
    Ok(())
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "TITLE")]
    title: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

async fn list(client: &TaskforgeClient) -> anyhow::Result<()> {
    let tasks = client.list_tasks().await?;
    if tasks.is_empty() {
        println!("  (no tasks yet — use `taskforge create <prompt>`)");
        return Ok(());
    }

    let rows: Vec<TaskRow> = tasks
        .into_iter()
        .map(|t| TaskRow {
            id: t.id,
            title: t.title.unwrap_or_else(|| "-".into()),
            status: t.status.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

async fn get(client: &TaskforgeClient, args: TaskIdArgs) -> anyhow::Result<()> {
    let task = client.get_task(&args.task_id).await?;
    println!("  {} {}", "Task:".bold(), task.id);
    if let Some(title) = &task.title {
        println!("  {} {}", "Title:".bold(), title);
    }
    println!("  {} {}", "Status:".bold(), colorize_status(task.status));
    println!("  {} {}", "Prompt:".bold(), task.input_prompt);
    if let Some(summary) = task.result_summary {
        println!("  {} {}", "Result:".bold(), summary);
    }
    Ok(())
}

async fn watch(client: &TaskforgeClient, args: TaskIdArgs) -> anyhow::Result<()> {
    println!("  {} Watching task {}...\n", "◉".cyan(), args.task_id);

    client
        .watch(&args.task_id, |frame| match frame {
            Frame::Connected { state, .. } => {
                println!(
                    "  {} connected (status: {})",
                    "•".dimmed(),
                    colorize_status(state.status)
                );
            }
            Frame::Event(event) => {
                let stage = event.stage_name.as_deref().unwrap_or("engine");
                println!("  [{}] {}: {:?}", stage.cyan(), event.kind_name(), event.kind);
            }
            Frame::State(state) => {
                println!(
                    "  {} status={} progress={:.0}%",
                    "state".dimmed(),
                    colorize_status(state.status),
                    state.progress * 100.0
                );
            }
            Frame::Error { message } => {
                println!("  {} {}", "!".red().bold(), message);
            }
        })
        .await?;

    println!("\n  {} Stream closed.", "✓".green());
    Ok(())
}

async fn stop(client: &TaskforgeClient, args: TaskIdArgs) -> anyhow::Result<()> {
    client.stop_task(&args.task_id).await?;
    println!("  {} Cancellation requested for {}", "✓".yellow(), args.task_id);
    Ok(())
}

async fn delete(client: &TaskforgeClient, args: TaskIdArgs) -> anyhow::Result<()> {
    client.delete_task(&args.task_id).await?;
    println!("  {} Deleted {}", "✓".green(), args.task_id);
    Ok(())
}

fn colorize_status(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => status.to_string().dimmed(),
        TaskStatus::Running => status.to_string().cyan(),
        TaskStatus::Succeeded => status.to_string().green(),
        TaskStatus::Failed => status.to_string().red(),
        TaskStatus::Cancelled => status.to_string().yellow(),
    }
}
