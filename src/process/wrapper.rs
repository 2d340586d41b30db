// ABOUTME: Supervises one OS process: launch, output streaming, idle detection, stop and detach
// ABOUTME: Feeds stdout to an output processor and turns abnormal termination into ProcessError

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::environment::ProcessStartInfo;
use super::error::{ProcessError, Result, UNKNOWN_LAUNCH_CODE};
use super::ProcessSettings;
use crate::output::OutputProcessor;

const TICK: Duration = Duration::from_millis(20);
const INTERRUPT: &[u8] = b"\x03\n";

enum StdinCommand {
    Write(Vec<u8>),
    Close,
}

/// Control surface of a running process, handed to start callbacks.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<StdinCommand>>,
    stop: CancellationToken,
    detach: CancellationToken,
    dont_wait: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("stopping", &self.is_stopping())
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl ProcessHandle {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Queue `line` for the process's stdin. Never blocks.
    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send(StdinCommand::Write(bytes))
    }

    /// Close stdin once everything queued so far has been written.
    pub fn close_input(&self) -> std::io::Result<()> {
        self.send(StdinCommand::Close)
    }

    /// Ask the process to stop: interrupt, grace period unless `dont_wait`, then kill.
    pub fn stop(&self, dont_wait: bool) {
        self.dont_wait.store(dont_wait, Ordering::SeqCst);
        self.stop.cancel();
    }

    /// Let the process keep running on its own; the wrapper returns without waiting.
    pub fn detach(&self) {
        self.detach.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_detached(&self) -> bool {
        self.detach.is_cancelled()
    }

    fn send(&self, command: StdinCommand) -> std::io::Result<()> {
        let sender = self.stdin.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is not redirected")
        })?;
        sender
            .send(command)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is closed"))
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Captured stderr lines.
    pub errors: Vec<String>,
    pub detached: bool,
}

/// Launches and supervises a single process.
pub struct ProcessWrapper {
    name: String,
    info: ProcessStartInfo,
    settings: ProcessSettings,
    token: CancellationToken,
}

impl ProcessWrapper {
    pub fn new(
        name: impl Into<String>,
        info: ProcessStartInfo,
        settings: ProcessSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            info,
            settings,
            token,
        }
    }

    pub fn info(&self) -> &ProcessStartInfo {
        &self.info
    }

    /// Run the process to completion.
    ///
    /// `on_start` sees the handle right after launch, `on_entry` every entry the processor
    /// raises and `on_error_line` every stderr line. The processor receives `None` exactly once.
    pub async fn run<P, S, E, L>(
        &self,
        processor: &mut P,
        mut on_start: S,
        mut on_entry: E,
        mut on_error_line: L,
    ) -> Result<ProcessOutcome>
    where
        P: OutputProcessor,
        S: FnMut(&ProcessHandle),
        E: FnMut(P::Entry),
        L: FnMut(&str),
    {
        if self.token.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        debug!(
            "Running '{}' in '{}'",
            self.display_command(),
            self.working_directory()
        );
        let mut child = self.build_command().spawn().map_err(|e| {
            let launch = self.launch_error(&e);
            error!("Failed to start process '{}': {}", self.name, e);
            launch
        })?;
        let pid = child.id();
        info!("Started process '{}' (pid {:?})", self.name, pid);

        let stdin = child.stdin.take().map(spawn_stdin_writer);
        let handle = ProcessHandle {
            pid,
            stdin,
            stop: CancellationToken::new(),
            detach: CancellationToken::new(),
            dont_wait: Arc::new(AtomicBool::new(false)),
        };

        let mut stdout = child.stdout.take().map(spawn_line_reader);
        let mut stderr = child.stderr.take().map(spawn_line_reader);

        on_start(&handle);

        let mut errors = Vec::new();
        let mut exit: Option<ExitStatus> = None;
        let mut stopped = false;
        let mut timed_out = false;
        let mut last_activity = Instant::now();
        let deadline = self.settings.exit_timeout().map(|t| Instant::now() + t);
        let mut ticker = time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if exit.is_some() && stdout.is_none() && stderr.is_none() {
                break;
            }

            tokio::select! {
                biased;

                _ = handle.detach.cancelled() => {
                    info!("Detached from process '{}' (pid {:?})", self.name, pid);
                    if let Some(entry) = processor.process(None) {
                        on_entry(entry);
                    }
                    return Ok(ProcessOutcome {
                        pid,
                        exit_code: None,
                        errors,
                        detached: true,
                    });
                }

                _ = handle.stop.cancelled(), if !stopped && exit.is_none() => {
                    stopped = true;
                    let dont_wait = handle.dont_wait.load(Ordering::SeqCst);
                    self.stop_process(&mut child, &handle, dont_wait).await;
                }

                line = recv(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        last_activity = Instant::now();
                        if let Some(entry) = processor.process(Some(&line)) {
                            on_entry(entry);
                        }
                    }
                    None => stdout = None,
                },

                line = recv(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        last_activity = Instant::now();
                        on_error_line(&line);
                        errors.push(line);
                    }
                    None => stderr = None,
                },

                status = child.wait(), if exit.is_none() => {
                    last_activity = Instant::now();
                    exit = Some(status.map_err(|e| ProcessError::Exited {
                        code: UNKNOWN_LAUNCH_CODE,
                        message: e.to_string(),
                    })?);
                }

                _ = ticker.tick() => {
                    let idle = last_activity.elapsed();
                    if exit.is_some() {
                        if idle >= self.settings.exit_drain() {
                            break;
                        }
                    } else if self.token.is_cancelled() && idle >= self.settings.idle_timeout() {
                        warn!("Process '{}' idle after cancellation, stopping it", self.name);
                        self.stop_process(&mut child, &handle, true).await;
                        timed_out = true;
                        break;
                    } else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        warn!("Process '{}' exceeded its exit timeout, stopping it", self.name);
                        self.stop_process(&mut child, &handle, false).await;
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        if let Some(entry) = processor.process(None) {
            on_entry(entry);
        }

        if timed_out {
            return Err(ProcessError::TimedOut);
        }

        let code = exit.map(exit_code).unwrap_or(UNKNOWN_LAUNCH_CODE);
        debug!("Process '{}' exited with code {}", self.name, code);
        if code != 0 {
            if stopped {
                return Err(ProcessError::Cancelled);
            }
            return Err(ProcessError::exited(code, &errors));
        }

        Ok(ProcessOutcome {
            pid,
            exit_code: Some(code),
            errors,
            detached: false,
        })
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.info.executable);
        command
            .args(&self.info.arguments)
            .envs(&self.info.environment)
            .kill_on_drop(false)
            .stdin(redirect(self.info.redirect_input, Stdio::null))
            .stdout(redirect(self.info.redirect_output, Stdio::inherit))
            .stderr(redirect(self.info.redirect_error, Stdio::inherit));
        if let Some(directory) = &self.info.working_directory {
            command.current_dir(directory);
        }
        command
    }

    async fn stop_process(&self, child: &mut Child, handle: &ProcessHandle, dont_wait: bool) {
        warn!("Stopping process '{}' (pid {:?})", self.name, handle.pid);
        if self.info.redirect_input {
            let _ = handle.send(StdinCommand::Write(INTERRUPT.to_vec()));
        }
        if !dont_wait
            && time::timeout(self.settings.stop_grace(), child.wait())
                .await
                .is_ok()
        {
            return;
        }
        if let Err(e) = child.start_kill() {
            debug!("Kill of process '{}' failed: {}", self.name, e);
        }
        let _ = time::timeout(self.settings.kill_grace(), child.wait()).await;
    }

    fn display_command(&self) -> String {
        if self.info.has_credentials() {
            format!("{} {}", self.info.executable.display(), self.name)
        } else {
            self.info.command_line()
        }
    }

    fn working_directory(&self) -> String {
        self.info
            .working_directory
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default()
    }

    fn launch_error(&self, error: &std::io::Error) -> ProcessError {
        let code = error.raw_os_error().unwrap_or(UNKNOWN_LAUNCH_CODE);
        let mut lines = vec![
            format!("Error code {}", code),
            error.to_string(),
            format!("'{}'", self.display_command()),
        ];
        if code == 2 {
            lines.push("The system cannot find the file specified.".to_string());
        }
        lines.push(format!("Working directory: {}", self.working_directory()));
        for (key, value) in &self.info.environment {
            lines.push(format!("{}:{}", key, value));
        }
        ProcessError::Launch {
            code,
            message: lines.join("\n"),
        }
    }
}

fn redirect(enabled: bool, otherwise: fn() -> Stdio) -> Stdio {
    if enabled {
        Stdio::piped()
    } else {
        otherwise()
    }
}

async fn recv(receiver: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => None,
    }
}

fn spawn_line_reader<R>(stream: R) -> mpsc::UnboundedReceiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        let mut forwarding = true;
        // Keep draining once the receiver is gone so a detached child never
        // writes into a closed pipe.
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) if forwarding => {
                    let line = String::from_utf8_lossy(&buffer);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    forwarding = sender.send(line).is_ok();
                }
                Ok(_) => {}
            }
        }
    });
    receiver
}

fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<StdinCommand> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                StdinCommand::Write(bytes) => {
                    if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
                StdinCommand::Close => break,
            }
        }
    });
    sender
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::{SimpleListOutputProcessor, SimpleOutputProcessor};

    fn wrapper(script: &str, settings: ProcessSettings) -> ProcessWrapper {
        ProcessWrapper::new(
            "test",
            ProcessStartInfo::new("sh").arg("-c").arg(script),
            settings,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_stdout_lines_reach_processor() {
        let mut processor = SimpleListOutputProcessor::new();
        let mut entries = Vec::new();
        let outcome = wrapper("printf 'a\\r\\nb\\n'", ProcessSettings::default())
            .run(&mut processor, |_| {}, |e| entries.push(e), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(processor.result(), vec!["a", "b"]);
        assert_eq!(entries, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let mut processor = SimpleOutputProcessor::new();
        let mut stderr = Vec::new();
        let error = wrapper("echo boom >&2; exit 137", ProcessSettings::default())
            .run(&mut processor, |_| {}, |_| {}, |line| stderr.push(line.to_string()))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            ProcessError::Exited {
                code: 137,
                message: "boom".to_string()
            }
        );
        assert_eq!(stderr, vec!["boom"]);
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let wrapper = ProcessWrapper::new(
            "missing",
            ProcessStartInfo::new("/definitely/not/here"),
            ProcessSettings::default(),
            CancellationToken::new(),
        );
        let mut processor = SimpleOutputProcessor::new();
        let error = wrapper
            .run(&mut processor, |_| {}, |_| {}, |_| {})
            .await
            .unwrap_err();
        match error {
            ProcessError::Launch { code, message } => {
                assert_eq!(code, 2);
                assert!(message.contains("Error code 2"));
                assert!(message.contains("The system cannot find the file specified."));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_credentials_are_redacted() {
        let wrapper = ProcessWrapper::new(
            "login",
            ProcessStartInfo::new("/definitely/not/here").arg("--credential=hunter2"),
            ProcessSettings::default(),
            CancellationToken::new(),
        );
        let mut processor = SimpleOutputProcessor::new();
        let error = wrapper
            .run(&mut processor, |_| {}, |_| {}, |_| {})
            .await
            .unwrap_err();
        assert!(!error.to_string().contains("hunter2"));
        assert!(error.to_string().contains("login"));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let mut processor = SimpleOutputProcessor::new();
        wrapper("read line; echo \"got $line\"", ProcessSettings::default())
            .run(
                &mut processor,
                |handle| {
                    handle.write_line("hello").unwrap();
                    handle.close_input().unwrap();
                },
                |_| {},
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(processor.result(), "got hello");
    }

    #[tokio::test]
    async fn test_cancelled_idle_process_times_out() {
        let token = CancellationToken::new();
        let settings = ProcessSettings {
            idle_timeout_ms: 100,
            stop_grace_ms: 50,
            ..ProcessSettings::default()
        };
        let wrapper = ProcessWrapper::new(
            "sleeper",
            ProcessStartInfo::new("sleep").arg("30"),
            settings,
            token.clone(),
        );
        let mut processor = SimpleOutputProcessor::new();
        let started = Instant::now();
        let error = wrapper
            .run(&mut processor, |_| token.cancel(), |_| {}, |_| {})
            .await
            .unwrap_err();
        assert_eq!(error, ProcessError::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sub_second_exit_timeout() {
        let settings = ProcessSettings {
            exit_timeout_ms: Some(300),
            stop_grace_ms: 50,
            ..ProcessSettings::default()
        };
        let mut processor = SimpleOutputProcessor::new();
        let started = Instant::now();
        let error = wrapper("sleep 30", settings)
            .run(&mut processor, |_| {}, |_| {}, |_| {})
            .await
            .unwrap_err();
        assert_eq!(error, ProcessError::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_stop_cancels_process() {
        let mut processor = SimpleOutputProcessor::new();
        let error = wrapper("sleep 30", ProcessSettings::default())
            .run(&mut processor, |handle| handle.stop(true), |_| {}, |_| {})
            .await
            .unwrap_err();
        assert_eq!(error, ProcessError::Cancelled);
    }

    #[tokio::test]
    async fn test_detach_returns_immediately() {
        let mut processor = SimpleOutputProcessor::new();
        let mut pid = None;
        let outcome = wrapper("sleep 2", ProcessSettings::default())
            .run(
                &mut processor,
                |handle| {
                    pid = handle.id();
                    handle.detach();
                },
                |_| {},
                |_| {},
            )
            .await
            .unwrap();
        assert!(outcome.detached);
        assert_eq!(outcome.pid, pid);
        assert_eq!(outcome.exit_code, None);
    }
}
