// ABOUTME: Command implementations for the taskchain CLI
// ABOUTME: Runs a process task through the engine and prints results or the effective config

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::args::{Args, OutputMode};
use super::config::Config;
use crate::engine::{Payload, TaskAffinity, TaskError, TaskManager};
use crate::process::{ProcessManager, ProcessStartInfo, ProcessTask};

/// Everything `taskchain run` needs to launch one process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub output: OutputMode,
    pub affinity: TaskAffinity,
    pub cwd: Option<PathBuf>,
    pub env: Vec<String>,
    pub idle_timeout_ms: Option<u64>,
    pub timeout: Option<u64>,
}

/// Run one process as a task and print its result
pub async fn run_process(request: RunRequest, config: &Config) -> Result<()> {
    let (program, arguments) = request
        .command
        .split_first()
        .context("No program given")?;

    let mut settings = config.process.clone();
    if let Some(idle) = request.idle_timeout_ms {
        settings.idle_timeout_ms = idle;
    }
    if let Some(timeout) = request.timeout {
        settings.exit_timeout_seconds = Some(timeout);
    }

    let mut info = ProcessStartInfo::new(program).args(arguments.iter().cloned());
    for (key, value) in Args::parse_variables(&request.env)? {
        info = info.env(key, value);
    }
    if let Some(cwd) = &request.cwd {
        info = info.working_directory(cwd);
    }

    let tasks = TaskManager::new(&config.scheduler).context("Failed to start task manager")?;
    let processes = ProcessManager::new(&tasks, settings);
    info!("Running '{}' [{}]", info.command_line(), request.affinity);

    let output = match request.output {
        OutputMode::FirstLine => {
            let task = ProcessTask::first_line(&processes, info).with_affinity(request.affinity);
            await_task(&tasks, &task).await?.unwrap_or_default()
        }
        OutputMode::Lines => {
            let task = ProcessTask::lines(&processes, info).with_affinity(request.affinity);
            let lines = await_task(&tasks, &task).await?;
            serde_json::to_string_pretty(&lines)?
        }
        OutputMode::Text => {
            let task = ProcessTask::simple(&processes, info).with_affinity(request.affinity);
            await_task(&tasks, &task).await?
        }
    };

    if !output.is_empty() {
        println!("{}", output);
    }
    tasks.scheduler().shutdown();
    Ok(())
}

/// Start `task` and wait for it, stopping everything on Ctrl-C.
async fn await_task<R>(tasks: &TaskManager, task: &ProcessTask<R>) -> Result<R>
where
    R: Payload + Default,
{
    let result = task.start_as_async();
    tokio::pin!(result);

    let outcome = tokio::select! {
        outcome = &mut result => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping running processes");
            tasks.stop();
            match tokio::time::timeout(Duration::from_secs(5), &mut result).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::Cancelled),
            }
        }
    };

    outcome.map_err(|e| match e.as_process_error() {
        Some(process) => anyhow::anyhow!("{} (exit code {})", process, process.error_code()),
        None => anyhow::Error::new(e),
    })
    .context(format!("Task '{}' failed", task.name()))
}

/// Print the effective configuration
pub fn show_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    print!("{}", yaml);
    Ok(())
}
