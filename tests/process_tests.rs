// ABOUTME: Integration tests for process tasks
// ABOUTME: Tests output processing, failures, stdin, detaching, cancellation and the process registry

#![cfg(unix)]

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use taskchain::engine::{TaskAffinity, TaskError};
use taskchain::output::LineProcessor;
use taskchain::process::{ProcessError, ProcessTask};

mod common;
use common::{manager, process_manager, sh, signal, Recorder, WAIT};

/// Whether `pid` names a live process rather than an exited or reaped one.
fn is_running(pid: u32) -> bool {
    Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .map(|output| {
            output.status.success()
                && !String::from_utf8_lossy(&output.stdout)
                    .trim_start()
                    .starts_with('Z')
        })
        .unwrap_or(false)
}

#[test]
fn test_simple_output() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let task = ProcessTask::simple(&processes, sh("echo ok"));
    assert_eq!(task.start_and_wait().unwrap(), "ok");
    assert_eq!(task.name(), "sh -c \"echo ok\"");
}

#[test]
fn test_line_and_first_line_output() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let lines = ProcessTask::lines(&processes, sh("echo ok; echo second"));
    assert_eq!(lines.start_and_wait().unwrap(), vec!["ok", "second"]);

    let first = ProcessTask::first_line(&processes, sh("echo; echo '  first  '; echo later"));
    assert_eq!(first.start_and_wait().unwrap().as_deref(), Some("first"));

    let silent = ProcessTask::first_line(&processes, sh("true"));
    assert_eq!(silent.start_and_wait().unwrap(), None);
}

#[test]
fn test_custom_processor_raises_entries() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let recorder = Recorder::new();

    let task = ProcessTask::with_processor(
        &processes,
        sh("printf '1\\nx\\n3\\n'"),
        LineProcessor::new(|line: &str| line.parse::<u32>().ok()),
    );
    let seen = recorder.clone();
    task.on_data::<u32, _>(move |n| seen.record(n.to_string()));

    assert_eq!(task.start_and_wait().unwrap(), vec![1, 3]);
    assert_eq!(recorder.events(), vec!["1", "3"]);
}

#[test]
fn test_non_zero_exit_carries_stderr_and_code() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let recorder = Recorder::new();

    let task = ProcessTask::simple(&processes, sh("echo boom >&2; exit 137"));
    let errors = recorder.clone();
    task.on_error_data(move |data| errors.record(data));

    let error = task.start_and_wait().unwrap_err();
    assert_eq!(
        error.as_process_error(),
        Some(&ProcessError::Exited {
            code: 137,
            message: "boom".to_string()
        })
    );
    assert_eq!(error.as_process_error().map(|e| e.error_code()), Some(137));
    assert_eq!(recorder.events(), vec!["boom"]);
}

#[test]
fn test_failed_process_skips_continuations() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let recorder = Recorder::new();

    let ran = recorder.clone();
    let next = ProcessTask::simple(&processes, sh("exit 3")).then_action(move |_| {
        ran.record("next");
        Ok(())
    });

    let error = next.start_and_wait().unwrap_err();
    assert_eq!(error.to_string(), "Process exited with code 3");
    assert!(recorder.events().is_empty());
}

#[test]
fn test_missing_executable_fails_to_launch() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let task = ProcessTask::simple(
        &processes,
        taskchain::process::ProcessStartInfo::new("/no/such/program"),
    );
    match task.start_and_wait() {
        Err(TaskError::Process(ProcessError::Launch { code, message })) => {
            assert_eq!(code, 2);
            assert!(message.contains("/no/such/program"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_process_results_flow_into_chain() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let count = ProcessTask::lines(&processes, sh("printf 'a\\nb\\nc\\n'"))
        .then_func(|_, lines: Option<Vec<String>>| Ok(lines.unwrap_or_default().len()));
    assert_eq!(count.start_and_wait().unwrap(), 3);
}

#[test]
fn test_stdin_is_written_from_start_hook() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let task = ProcessTask::simple(&processes, sh("cat"));
    task.on_start_process(|handle| {
        handle.write_line("hello").unwrap();
        handle.write_line("world").unwrap();
        handle.close_input().unwrap();
    });
    assert_eq!(task.start_and_wait().unwrap(), "hello\nworld");
}

#[test]
fn test_working_directory_and_environment() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let task = ProcessTask::lines(
        &processes,
        sh("pwd; echo \"$PROCESS_WORKINGDIR\"; echo \"$GREETING\"").env("GREETING", "hi"),
    )
    .with_working_directory(dir.path());

    let lines = task.start_and_wait().unwrap();
    assert_eq!(lines[0], expected.display().to_string());
    assert_eq!(lines[1], expected.display().to_string());
    assert_eq!(lines[2], "hi");
}

#[test]
fn test_detached_process_keeps_running() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let task = ProcessTask::simple(&processes, sh("sleep 5"));
    task.on_start_process(|handle| handle.detach());

    assert_eq!(task.start_and_wait().unwrap(), "");
    let pid = task.process_id().unwrap();
    assert!(is_running(pid));

    let _ = Command::new("kill").arg(pid.to_string()).status();
}

#[test]
fn test_detached_process_keeps_writing() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let task = ProcessTask::simple(
        &processes,
        sh("sleep 1; while true; do echo tick; echo tock >&2; sleep 0.1; done"),
    );
    task.on_start_process(|handle| handle.detach());

    assert_eq!(task.start_and_wait().unwrap(), "");
    let pid = task.process_id().unwrap();
    thread::sleep(Duration::from_secs(3));
    let alive = is_running(pid);

    let _ = Command::new("kill").arg(pid.to_string()).status();
    assert!(alive, "detached process died once its output was no longer read");
}

#[test]
fn test_stopping_manager_times_out_idle_process() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let (tx, rx) = signal();

    let task = ProcessTask::simple(&processes, sh("sleep 30")).long_running();
    task.on_start_process(move |_| tx.send(()).unwrap());
    let (done_tx, done_rx) = signal();
    task.on_end(move |_, _, error| done_tx.send(error.cloned()).unwrap());
    task.start();

    rx.recv_timeout(WAIT).unwrap();
    tasks.stop();

    let error = done_rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(error.as_process_error(), Some(&ProcessError::TimedOut));
    assert_eq!(task.affinity(), TaskAffinity::LongRunning);
}

#[test]
fn test_exit_timeout_fails_task() {
    let tasks = manager();
    let processes = process_manager(&tasks);

    let task = ProcessTask::simple(&processes, sh("sleep 30"))
        .with_exit_timeout(Duration::from_millis(300));
    let started = Instant::now();
    let error = task.start_and_wait().unwrap_err();
    assert_eq!(error.as_process_error(), Some(&ProcessError::TimedOut));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_registry_tracks_and_stops_processes() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let (tx, rx) = signal();

    let task = ProcessTask::simple(&processes, sh("sleep 30"));
    task.on_start_process(move |handle| tx.send(handle.id()).unwrap());
    let (done_tx, done_rx) = signal();
    task.on_end(move |_, _, error| done_tx.send(error.cloned()).unwrap());
    task.start();

    let pid = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(processes.running(), vec![pid]);
    assert_eq!(task.process_id(), Some(pid));

    processes.stop_all();
    let error = done_rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(error.as_process_error(), Some(&ProcessError::Cancelled));
    assert!(processes.running().is_empty());
}

#[test]
fn test_catch_sees_user_stop() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let recorder = Recorder::new();

    let task = ProcessTask::simple(&processes, sh("sleep 30"));
    task.on_start_process(|handle| handle.stop(true));
    let caught = recorder.clone();
    task.catch(move |error| {
        if error.as_process_error() == Some(&ProcessError::Cancelled) {
            caught.record("stopped");
        }
    });

    let error = task.start_and_wait().unwrap_err();
    assert!(!error.is_cancelled());
    assert_eq!(recorder.events(), vec!["stopped"]);
}

#[test]
fn test_end_hook_sees_finished_process() {
    let tasks = manager();
    let processes = process_manager(&tasks);
    let recorder = Recorder::new();

    let task = ProcessTask::simple(&processes, sh("echo done"));
    let started = recorder.clone();
    task.on_start_process(move |_| started.record("start"));
    let ended = recorder.clone();
    task.on_end_process(move |handle| {
        ended.record(format!("end {}", handle.id().is_some()));
    });

    task.start_and_wait().unwrap();
    assert_eq!(recorder.events(), vec!["start", "end true"]);
}
