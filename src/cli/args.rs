// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the main CLI structure and subcommands for taskchain

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::engine::TaskAffinity;

#[derive(Parser)]
#[command(name = "taskchain")]
#[command(about = "Run external processes as supervised task chains")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a process as a task and print its result
    Run {
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Program followed by its arguments"
        )]
        command: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputMode::Text)]
        output: OutputMode,

        #[arg(short, long, default_value = "concurrent", help = "Task affinity")]
        affinity: TaskAffinity,

        #[arg(long, help = "Working directory of the process")]
        cwd: Option<PathBuf>,

        #[arg(
            short = 'e',
            long = "env",
            help = "Extra environment variables (key=value)"
        )]
        env: Vec<String>,

        #[arg(long, help = "Idle window in milliseconds once cancellation is requested")]
        idle_timeout_ms: Option<u64>,

        #[arg(long, help = "Fail when the process runs longer than this many seconds")]
        timeout: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

/// How the output of a process is turned into a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// First non-empty line
    FirstLine,
    /// Every line, printed as a JSON list
    Lines,
    /// The whole output
    Text,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse variables from key=value format
    pub fn parse_variables(vars: &[String]) -> anyhow::Result<indexmap::IndexMap<String, String>> {
        let mut variables = indexmap::IndexMap::new();

        for var in vars {
            if let Some((key, value)) = var.split_once('=') {
                variables.insert(key.to_string(), value.to_string());
            } else {
                return Err(anyhow::anyhow!(
                    "Invalid variable format '{}'. Expected 'key=value'",
                    var
                ));
            }
        }

        Ok(variables)
    }
}
