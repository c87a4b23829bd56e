//! In-process test runtime: real child process, real output plumbing and
//! wall timeout, no isolation whatsoever. Unit tests only, never wired
//! into a serving configuration.

use super::{
    append_capped, ExecOutcome, ExecSpec, LogStream, SandboxError, SandboxRuntime,
};
use sandrun_protocol::FailureReason;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
pub struct FakeSandbox;

impl SandboxRuntime for FakeSandbox {
    fn run(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Setup("empty command".into()))?;

        let usage_before = children_usage();

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env_root) = &spec.env_root {
            command.env("SANDRUN_ENV_ROOT", env_root);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExecOutcome {
                    exit_code: None,
                    failure: Some(FailureReason::Exec {
                        detail: e.to_string(),
                    }),
                    cpu_seconds: 0.0,
                    memory_peak_bytes: 0,
                    timed_out: false,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    log_truncated: false,
                })
            }
        };

        // One reader thread per stream; chunks funnel into the supervisor
        // loop over a channel so caps and fan-out live in one place.
        let (tx, rx) = mpsc::channel::<(LogStream, Vec<u8>)>();
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let stdout_reader = spawn_reader(LogStream::Stdout, stdout, tx.clone());
        let stderr_reader = spawn_reader(LogStream::Stderr, stderr, tx);

        let cap = spec.limits.max_output_bytes;
        let deadline = Instant::now() + spec.limits.wall;
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut truncated = false;
        let mut timed_out = false;
        let mut status = None;

        loop {
            while let Ok((stream, chunk)) = rx.try_recv() {
                let buffer = match stream {
                    LogStream::Stdout => &mut stdout_buf,
                    LogStream::Stderr => &mut stderr_buf,
                };
                append_capped(buffer, &chunk, cap, &mut truncated, stream, &spec.log_tx);
            }

            if status.is_none() {
                status = child.try_wait()?;
                if status.is_some() {
                    continue; // drain whatever the readers still hold
                }
                if Instant::now() >= deadline || spec.cancel.is_cancelled() {
                    debug!(command = %program, "fake sandbox killing child");
                    let _ = child.kill();
                    timed_out = true;
                    status = Some(child.wait()?);
                    continue;
                }
                std::thread::sleep(POLL_INTERVAL);
            } else {
                // Child is gone; readers finish at EOF.
                break;
            }
        }

        let _ = stdout_reader.join();
        let _ = stderr_reader.join();
        // Readers are done; pick up any chunks still in flight.
        while let Ok((stream, chunk)) = rx.try_recv() {
            let buffer = match stream {
                LogStream::Stdout => &mut stdout_buf,
                LogStream::Stderr => &mut stderr_buf,
            };
            append_capped(buffer, &chunk, cap, &mut truncated, stream, &spec.log_tx);
        }

        let status = status.expect("loop exits with status");
        let (cpu_seconds, memory_peak_bytes) = usage_delta(usage_before);

        let (exit_code, failure) = if timed_out {
            (None, Some(FailureReason::TimedOut))
        } else if let Some(code) = status.code() {
            (Some(code), None)
        } else {
            let signal = exit_signal(&status);
            (None, Some(FailureReason::Signal { signal }))
        };

        Ok(ExecOutcome {
            exit_code,
            failure,
            cpu_seconds,
            memory_peak_bytes,
            timed_out,
            stdout: stdout_buf,
            stderr: stderr_buf,
            log_truncated: truncated,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: LogStream,
    mut reader: R,
    tx: mpsc::Sender<(LogStream, Vec<u8>)>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
    0
}

/// Cumulative (cpu seconds, max rss bytes) over reaped children. The fake
/// reports a delta, which is approximate when tests run children in
/// parallel; the native runtime reads per-child counters instead.
#[cfg(unix)]
fn children_usage() -> (f64, u64) {
    use nix::sys::resource::{getrusage, UsageWho};
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            let cpu = (user.tv_sec() + system.tv_sec()) as f64
                + (user.tv_usec() + system.tv_usec()) as f64 / 1e6;
            (cpu, usage.max_rss() as u64 * 1024)
        }
        Err(_) => (0.0, 0),
    }
}

#[cfg(not(unix))]
fn children_usage() -> (f64, u64) {
    (0.0, 0)
}

fn usage_delta(before: (f64, u64)) -> (f64, u64) {
    let after = children_usage();
    ((after.0 - before.0).max(0.0), after.1)
}
