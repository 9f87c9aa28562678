use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use clipforge::core::context::{ContextStore, EntryKind, SqliteJournal};
use clipforge::core::pipeline::{Pipeline, PipelineState, TaskReport};
use clipforge::core::terminal::{
    GuideSection, print_info, print_report, print_step, print_success, print_warn,
};
use clipforge::core::tools::ToolRegistry;
use clipforge::core::types::{Task, TaskMode, TaskRequest};
use clipforge::PipelineConfig;

use super::{has_flag, parse_string_flag, positional};

fn task_id_arg(args: &[String], command: &str) -> Result<String> {
    parse_string_flag(args, 2, &["--task", "-t"])
        .or_else(|| positional(args, 2))
        .ok_or_else(|| anyhow!("usage: clipforge {} <task-id>", command))
}

/// Shape of a `--request` file: the task mode next to the request fields.
#[derive(Debug, Deserialize)]
struct RequestFile {
    #[serde(default = "default_mode")]
    mode: TaskMode,
    #[serde(flatten)]
    request: TaskRequest,
}

fn default_mode() -> TaskMode {
    TaskMode::FullyGenerative
}

fn load_request(args: &[String]) -> Result<(TaskMode, TaskRequest)> {
    let (mut mode, mut request) = match parse_string_flag(args, 2, &["--request", "-r"]) {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading request file {}", path))?;
            let file: RequestFile = serde_json::from_str(&content)
                .with_context(|| format!("parsing request file {}", path))?;
            (file.mode, file.request)
        }
        None => (default_mode(), TaskRequest::default()),
    };

    if let Some(name) = parse_string_flag(args, 2, &["--mode", "-m"]) {
        mode = TaskMode::from_name(&name).ok_or_else(|| {
            anyhow!(
                "unknown mode '{}': expected fully_generative, semi_generative or pure_editing",
                name
            )
        })?;
    }
    if let Some(prompt) = parse_string_flag(args, 2, &["--prompt", "-p"]) {
        request.prompt = prompt;
    }
    if request.prompt.trim().is_empty() {
        bail!("a prompt is required: pass --prompt or a --request file with one");
    }
    Ok((mode, request))
}

async fn open_journal(config: &PipelineConfig) -> Result<Arc<SqliteJournal>> {
    let path = config.journal_path()?;
    let journal = SqliteJournal::open(&path)
        .await
        .with_context(|| format!("opening journal {}", path.display()))?;
    Ok(Arc::new(journal))
}

fn build_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    let registry = ToolRegistry::from_config(&config)?;
    Ok(Pipeline::new(Arc::new(registry), config))
}

/// A token that Ctrl+C cancels.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            print_warn("Cancel requested: discarding in-flight tool calls.");
            watcher.cancel();
        }
    });
    cancel
}

fn finish(report: &TaskReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_report(report);
    }
    if report.state == PipelineState::Failed {
        bail!("task {} failed", report.task_id);
    }
    Ok(())
}

pub async fn run(args: &[String], config: PipelineConfig) -> Result<()> {
    let (mode, request) = load_request(args)?;
    let journal = open_journal(&config).await?;
    let task = Task::new(mode, request);
    print_step(&format!("Starting task {} ({})", task.id, mode.as_str()));

    let store = ContextStore::with_journal(task.id.clone(), journal);
    let pipeline = build_pipeline(config)?;
    let run = pipeline.run(task, store, cancel_on_ctrl_c()).await?;
    finish(&run.report, has_flag(args, 2, "--json"))
}

pub async fn resume(args: &[String], config: PipelineConfig) -> Result<()> {
    let task_id = task_id_arg(args, "resume")?;
    let journal = open_journal(&config).await?;
    let store = ContextStore::load(&task_id, journal).await?;
    if store.is_empty() {
        bail!("no context log for task {}", task_id);
    }
    print_step(&format!("Resuming task {} ({} entries)", task_id, store.len()));

    let pipeline = build_pipeline(config)?;
    let run = pipeline.resume(store, cancel_on_ctrl_c()).await?;
    finish(&run.report, has_flag(args, 2, "--json"))
}

pub async fn inspect(args: &[String], config: PipelineConfig) -> Result<()> {
    let task_id = task_id_arg(args, "inspect")?;
    let journal = open_journal(&config).await?;
    let store = ContextStore::load(&task_id, journal).await?;
    if store.is_empty() {
        bail!("no context log for task {}", task_id);
    }

    if has_flag(args, 2, "--json") {
        println!("{}", serde_json::to_string_pretty(store.entries())?);
        return Ok(());
    }
    if has_flag(args, 2, "--entries") {
        for entry in store.entries() {
            println!(
                "{:>5}  {:<20} {:>6}  {}",
                entry.seq,
                entry.kind.as_str(),
                entry
                    .caused_by_seq
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                &entry.payload_ref[..entry.payload_ref.len().min(12)]
            );
        }
        return Ok(());
    }

    let snapshot = store.snapshot()?;
    let mut section = GuideSection::new(&format!("Task {}", task_id)).status(
        "State",
        snapshot.state.map(|s| s.as_str()).unwrap_or("unknown"),
    );
    if let Some(task) = &snapshot.task {
        section = section
            .status("Mode", task.mode.as_str())
            .status("Prompt", &task.request.prompt);
    }
    if let Some(plan) = &snapshot.plan {
        section = section.status(
            "Plan",
            &format!(
                "revision {} of {:?}, {} segments, {:.1}s",
                plan.revision,
                snapshot.revisions,
                plan.segments.len(),
                plan.total_duration_secs()
            ),
        );
        for seg in &plan.segments {
            let produced = snapshot.artifacts.get(&seg.ordinal).map_or(0, Vec::len);
            let accepted = snapshot
                .accepted
                .get(&seg.ordinal)
                .map(|a| a.content_ref.as_str())
                .unwrap_or("not accepted");
            section = section.status(
                &format!("Segment {}", seg.ordinal),
                &format!("{} artifacts, {}", produced, accepted),
            );
        }
    }
    section = section.status(
        "Tool calls",
        &store.of_kind(EntryKind::ToolInvoked).count().to_string(),
    );
    section.print();

    if let Some(video) = &snapshot.final_video {
        print_success(&format!("Rendered {}", video.uri));
    }
    if let Some(failure) = &snapshot.failure {
        print_warn(&failure.error);
    }
    Ok(())
}

pub async fn list(config: PipelineConfig) -> Result<()> {
    let journal = open_journal(&config).await?;
    let tasks = journal.list_tasks().await?;
    if tasks.is_empty() {
        print_info("No tasks recorded yet.");
        return Ok(());
    }
    let mut section = GuideSection::new("Tasks");
    for task in tasks {
        section = section.status(
            &task.task_id,
            &format!("{} / {} (updated {})", task.mode, task.status, task.updated_at),
        );
    }
    section.print();
    Ok(())
}

pub fn tools(config: PipelineConfig) -> Result<()> {
    let registry = ToolRegistry::from_config(&config)?;
    let descriptors = registry.descriptors();
    if descriptors.is_empty() {
        print_info("No tools registered. Declare [[http_tools]] in clipforge.toml.");
        return Ok(());
    }
    let mut section = GuideSection::new("Tools");
    for d in descriptors {
        section = section.status(
            &d.name,
            &format!(
                "{} (cost {:?} x{}, latency {:?})",
                d.capability.as_str(),
                d.cost_class,
                d.cost_units,
                d.latency_class
            ),
        );
    }
    section.print();
    Ok(())
}
