// ABOUTME: Launch descriptors and the environment applied to spawned processes
// ABOUTME: Composes PATH from search paths and injects the working directory variables

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use super::ProcessSettings;

/// Everything needed to launch one process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessStartInfo {
    pub executable: PathBuf,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Overlay on top of the inherited environment.
    #[serde(default)]
    pub environment: IndexMap<String, String>,

    #[serde(default = "default_redirect")]
    pub redirect_input: bool,

    #[serde(default = "default_redirect")]
    pub redirect_output: bool,

    #[serde(default = "default_redirect")]
    pub redirect_error: bool,
}

fn default_redirect() -> bool {
    true
}

impl ProcessStartInfo {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            working_directory: None,
            environment: IndexMap::new(),
            redirect_input: true,
            redirect_output: true,
            redirect_error: true,
        }
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn redirect_input(mut self, redirect: bool) -> Self {
        self.redirect_input = redirect;
        self
    }

    /// Arguments joined the way a shell would display them.
    pub fn arguments_line(&self) -> String {
        self.arguments
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("\"{}\"", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn command_line(&self) -> String {
        let arguments = self.arguments_line();
        if arguments.is_empty() {
            self.executable.display().to_string()
        } else {
            format!("{} {}", self.executable.display(), arguments)
        }
    }

    /// Whether the arguments carry credential material that must not be logged.
    pub fn has_credentials(&self) -> bool {
        self.arguments
            .iter()
            .any(|arg| arg.to_ascii_lowercase().contains("credential"))
    }
}

/// Prepares launch descriptors: working directory, `PATH` and the variables every process gets.
#[derive(Debug, Clone)]
pub struct ProcessEnvironment {
    search_paths: Vec<PathBuf>,
    variables: IndexMap<String, String>,
    default_working_directory: PathBuf,
}

impl ProcessEnvironment {
    pub fn new(settings: &ProcessSettings) -> Self {
        Self {
            search_paths: settings.search_paths.clone(),
            variables: settings.environment.clone(),
            default_working_directory: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_default_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.default_working_directory = directory.into();
        self
    }

    /// Search paths followed by the inherited `PATH`.
    pub fn path(&self) -> String {
        let mut entries: Vec<PathBuf> = self.search_paths.clone();
        if let Some(existing) = env::var_os("PATH") {
            entries.extend(env::split_paths(&existing));
        }
        match env::join_paths(entries.iter()) {
            Ok(joined) => joined.to_string_lossy().into_owned(),
            Err(_) => env::var("PATH").unwrap_or_default(),
        }
    }

    /// Fill in the working directory and environment of `info`.
    ///
    /// Variables already present on `info` win over the configured ones; `PATH`,
    /// `PROCESS_WORKINGDIR` and `PROCESS_FULLPATH` are always set.
    pub fn configure(&self, info: &mut ProcessStartInfo, working_directory: Option<&Path>) {
        let directory = working_directory
            .map(Path::to_path_buf)
            .or_else(|| info.working_directory.clone())
            .unwrap_or_else(|| self.default_working_directory.clone());
        let directory = normalize(&directory);
        let path = self.path();

        for (key, value) in &self.variables {
            info.environment
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        info.environment.insert(
            "PROCESS_WORKINGDIR".to_string(),
            directory.display().to_string(),
        );
        info.environment
            .insert("PROCESS_FULLPATH".to_string(), path.clone());
        info.environment.insert("PATH".to_string(), path);
        info.working_directory = Some(directory);
    }
}

fn normalize(directory: &Path) -> PathBuf {
    directory
        .canonicalize()
        .unwrap_or_else(|_| directory.to_path_buf())
}
