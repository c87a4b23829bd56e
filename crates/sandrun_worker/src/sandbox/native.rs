//! Native Linux sandbox: fresh namespaces, a pivoted tmpfs root, rlimits
//! and a seccomp allowlist around one supervised child.
//!
//! Two processes besides the server: an intermediate child that unshares
//! the namespaces, assembles the private root and spawns the payload, and
//! the payload itself (PID 1 of the new pid namespace). The parent stays
//! in the host namespaces, writes the uid/gid maps, pumps the output
//! pipes, enforces the wall clock, and reads back a counters file the
//! intermediate child writes from authoritative rusage.
//!
//! Mount teardown is free: every mount lives in the child's mount
//! namespace and vanishes with it. The parent only ever deletes plain
//! directories.

use super::{
    append_capped, ExecOutcome, ExecSpec, LogStream, NetworkPolicy, SandboxError, SandboxRuntime,
    TERM_GRACE,
};
use crate::sandbox::seccomp;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{getrusage, setrlimit, Resource, UsageWho};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, fork, getgid, getuid, pipe, pivot_root, read, sethostname, setsid,
    write, ForkResult, Pid};
use sandrun_protocol::FailureReason;
use seccompiler::BpfProgram;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// Intermediate-child exit codes distinguishing setup from exec failures.
const EXIT_SETUP: i32 = 126;
const EXIT_EXEC: i32 = 127;

/// Slack between the soft CPU cap (SIGXCPU) and the hard one (SIGKILL).
const CPU_HARD_SLACK: u64 = 2;

const SUPERVISE_TICK_MS: u16 = 200;

/// Counters the intermediate child writes after the payload is reaped.
/// The fd is opened before the root pivot so it still reaches the job
/// root afterwards.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChildCounters {
    exit_code: Option<i32>,
    signal: Option<i32>,
    cpu_seconds: f64,
    max_rss_kb: i64,
    /// Syscall number from the seccomp notification listener; the kill
    /// that follows is ours, so this field, not the signal, is the record
    blocked_syscall: Option<i64>,
    exec_error: Option<String>,
}

enum ChildError {
    Setup(String),
    Exec(String),
}

/// Both compiled programs travel into the fork: the notify variant is
/// preferred, the kill variant covers kernels without user-notification.
struct SandboxFilters {
    notify: BpfProgram,
    kill: BpfProgram,
}

#[derive(Debug, Clone)]
pub struct NativeSandbox {
    /// In-namespace uid/gid the payload runs as. Non-zero, so exec clears
    /// every capability the intermediate child needed for mount setup.
    map_uid: u32,
}

impl Default for NativeSandbox {
    fn default() -> Self {
        Self { map_uid: 1000 }
    }
}

impl NativeSandbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SandboxRuntime for NativeSandbox {
    fn run(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError> {
        if spec.command.is_empty() {
            return Err(SandboxError::Setup("empty command".into()));
        }
        if !spec.work_dir.is_dir() {
            return Err(SandboxError::Setup(format!(
                "work dir missing: {}",
                spec.work_dir.display()
            )));
        }
        // Compile the filters before forking; the child only applies them.
        let filters = SandboxFilters {
            notify: seccomp::notify_filter().map_err(SandboxError::Setup)?,
            kill: seccomp::kill_filter().map_err(SandboxError::Setup)?,
        };

        let setup = |e: nix::Error| SandboxError::Setup(format!("pipe: {e}"));
        let (ready_r, ready_w) = pipe().map_err(setup)?;
        let (go_r, go_w) = pipe().map_err(setup)?;
        let (out_r, out_w) = pipe().map_err(setup)?;
        let (err_r, err_w) = pipe().map_err(setup)?;

        match unsafe { fork() }.map_err(|e| SandboxError::Setup(format!("fork: {e}")))? {
            ForkResult::Parent { child } => {
                drop(ready_w);
                drop(go_r);
                drop(out_w);
                drop(err_w);
                self.supervise(child, &spec, ready_r, go_w, out_r, err_r)
            }
            ForkResult::Child => {
                drop(ready_r);
                drop(go_w);
                drop(out_r);
                drop(err_r);
                let code = child_main(&spec, filters, ready_w, go_r, out_w, err_w);
                std::process::exit(code);
            }
        }
    }
}

impl NativeSandbox {
    fn supervise(
        &self,
        child: Pid,
        spec: &ExecSpec,
        ready_r: OwnedFd,
        go_w: OwnedFd,
        out_r: OwnedFd,
        err_r: OwnedFd,
    ) -> Result<ExecOutcome, SandboxError> {
        // The child signals once its user namespace exists; only then do
        // the map files appear under /proc.
        if read_sync_byte(&ready_r) {
            if let Err(e) = write_uid_gid_maps(child, self.map_uid) {
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
                return Err(SandboxError::Setup(format!("uid/gid map: {e}")));
            }
            let _ = write(go_w.as_fd(), b"ok");
        }
        drop(ready_r);
        drop(go_w);

        // Poll drives the loop; reads must never block it.
        for fd in [&out_r, &err_r] {
            unsafe {
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK);
            }
        }

        let cap = spec.limits.max_output_bytes;
        let deadline = Instant::now() + spec.limits.wall;
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut truncated = false;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut wait_status: Option<WaitStatus> = None;
        let mut terminated = false;
        let mut kill_at: Option<Instant> = None;
        let mut buf = [0u8; 4096];

        while stdout_open || stderr_open {
            {
                let mut fds = Vec::with_capacity(2);
                if stdout_open {
                    fds.push(PollFd::new(out_r.as_fd(), PollFlags::POLLIN));
                }
                if stderr_open {
                    fds.push(PollFd::new(err_r.as_fd(), PollFlags::POLLIN));
                }
                let _ = poll(&mut fds, PollTimeout::from(SUPERVISE_TICK_MS));
            }

            if stdout_open {
                match read(out_r.as_raw_fd(), &mut buf) {
                    Ok(0) => stdout_open = false,
                    Ok(n) => append_capped(
                        &mut stdout_buf,
                        &buf[..n],
                        cap,
                        &mut truncated,
                        LogStream::Stdout,
                        &spec.log_tx,
                    ),
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                    Err(_) => stdout_open = false,
                }
            }
            if stderr_open {
                match read(err_r.as_raw_fd(), &mut buf) {
                    Ok(0) => stderr_open = false,
                    Ok(n) => append_capped(
                        &mut stderr_buf,
                        &buf[..n],
                        cap,
                        &mut truncated,
                        LogStream::Stderr,
                        &spec.log_tx,
                    ),
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                    Err(_) => stderr_open = false,
                }
            }

            if wait_status.is_none() {
                match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => {}
                    Ok(status) => wait_status = Some(status),
                    Err(_) => {
                        stdout_open = false;
                        stderr_open = false;
                    }
                }
            }

            if wait_status.is_none() && (Instant::now() >= deadline || spec.cancel.is_cancelled())
            {
                match kill_at {
                    None => {
                        debug!(child = %child, "wall limit reached, sending SIGTERM");
                        terminated = true;
                        let _ = killpg(child, Signal::SIGTERM);
                        kill_at = Some(Instant::now() + TERM_GRACE);
                    }
                    Some(at) if Instant::now() >= at => {
                        debug!(child = %child, "grace expired, sending SIGKILL");
                        let _ = killpg(child, Signal::SIGKILL);
                        kill_at = Some(Instant::now() + Duration::from_secs(3600));
                    }
                    Some(_) => {}
                }
            }
        }

        let status = match wait_status {
            Some(status) => status,
            None => waitpid(child, None)
                .map_err(|e| SandboxError::Setup(format!("waitpid: {e}")))?,
        };

        let counters = read_counters(&spec.job_root.join("counters.json"));
        let (cpu_seconds, memory_peak_bytes) = counters
            .as_ref()
            .map(|c| (c.cpu_seconds, c.max_rss_kb.max(0) as u64 * 1024))
            .unwrap_or((0.0, 0));

        if terminated {
            return Ok(ExecOutcome {
                exit_code: None,
                failure: Some(FailureReason::TimedOut),
                cpu_seconds,
                memory_peak_bytes,
                timed_out: true,
                stdout: stdout_buf,
                stderr: stderr_buf,
                log_truncated: truncated,
            });
        }

        let (exit_code, failure) = match status {
            WaitStatus::Exited(_, 0) => {
                let counters = counters.ok_or_else(|| {
                    SandboxError::Setup("supervisor child left no counters".into())
                })?;
                classify_payload(&counters, spec.limits.cpu_seconds)
            }
            WaitStatus::Exited(_, EXIT_SETUP) => {
                let detail = counters
                    .and_then(|c| c.exec_error)
                    .unwrap_or_else(|| "unknown setup failure".into());
                return Err(SandboxError::Setup(detail));
            }
            WaitStatus::Exited(_, EXIT_EXEC) => {
                let detail = counters
                    .and_then(|c| c.exec_error)
                    .unwrap_or_else(|| "unknown exec failure".into());
                (None, Some(FailureReason::Exec { detail }))
            }
            WaitStatus::Exited(_, other) => {
                return Err(SandboxError::Setup(format!(
                    "supervisor child exited unexpectedly with {other}"
                )));
            }
            other => {
                return Err(SandboxError::Setup(format!(
                    "supervisor child ended unexpectedly: {other:?}"
                )));
            }
        };

        Ok(ExecOutcome {
            exit_code,
            failure,
            cpu_seconds,
            memory_peak_bytes,
            timed_out: false,
            stdout: stdout_buf,
            stderr: stderr_buf,
            log_truncated: truncated,
        })
    }
}

/// Map the payload's fate onto the failure taxonomy using the counters the
/// intermediate child recorded.
fn classify_payload(
    counters: &ChildCounters,
    cpu_limit: u64,
) -> (Option<i32>, Option<FailureReason>) {
    // A recorded violation outranks everything else the tree did before
    // the supervisor killed it.
    if let Some(nr) = counters.blocked_syscall {
        return (None, Some(FailureReason::BlockedSyscall { nr }));
    }
    if let Some(code) = counters.exit_code {
        return (Some(code), None);
    }
    match counters.signal {
        Some(sig) if sig == libc::SIGSYS => {
            // Fallback kill filter (no user-notification support): the
            // kernel kept the syscall number; -1 stands for "unknown".
            (None, Some(FailureReason::BlockedSyscall { nr: -1 }))
        }
        Some(sig) if sig == libc::SIGXCPU => (None, Some(FailureReason::CpuExceeded)),
        Some(sig) if sig == libc::SIGKILL => {
            // A hard-rlimit CPU kill and a kernel OOM kill both arrive as
            // SIGKILL; the counters tell them apart.
            if counters.cpu_seconds + 0.5 >= cpu_limit as f64 {
                (None, Some(FailureReason::CpuExceeded))
            } else {
                (None, Some(FailureReason::Oom))
            }
        }
        Some(sig) => (None, Some(FailureReason::Signal { signal: sig })),
        None => (
            None,
            Some(FailureReason::Exec {
                detail: "payload vanished without status".into(),
            }),
        ),
    }
}

// ---------------------------------------------------------------------------
// Intermediate child
// ---------------------------------------------------------------------------

/// Everything below runs in the forked child. No tracing here: the
/// subscriber's locks may be held by threads that do not exist on this
/// side of the fork. Failures are reported through the counters file.
fn child_main(
    spec: &ExecSpec,
    filters: SandboxFilters,
    ready_w: OwnedFd,
    go_r: OwnedFd,
    out_w: OwnedFd,
    err_w: OwnedFd,
) -> i32 {
    let counters_file = match File::create(spec.job_root.join("counters.json")) {
        Ok(file) => file,
        Err(_) => return EXIT_SETUP,
    };
    match run_child(spec, filters, ready_w, go_r, out_w, err_w) {
        Ok(counters) => {
            write_counters(&counters_file, &counters);
            0
        }
        Err(ChildError::Setup(detail)) => {
            write_counters(
                &counters_file,
                &ChildCounters {
                    exec_error: Some(detail),
                    ..Default::default()
                },
            );
            EXIT_SETUP
        }
        Err(ChildError::Exec(detail)) => {
            write_counters(
                &counters_file,
                &ChildCounters {
                    exec_error: Some(detail),
                    ..Default::default()
                },
            );
            EXIT_EXEC
        }
    }
}

fn run_child(
    spec: &ExecSpec,
    filters: SandboxFilters,
    ready_w: OwnedFd,
    go_r: OwnedFd,
    out_w: OwnedFd,
    err_w: OwnedFd,
) -> Result<ChildCounters, ChildError> {
    let setup = |stage: &str| {
        let stage = stage.to_string();
        move |e: nix::Error| ChildError::Setup(format!("{stage}: {e}"))
    };

    // Own process group so the supervisor can signal the whole tree.
    let _ = setsid();

    // User namespace first; the parent writes our uid/gid maps.
    unshare(CloneFlags::CLONE_NEWUSER).map_err(setup("unshare user"))?;
    write(ready_w.as_fd(), b"ns").map_err(setup("sync ready"))?;
    drop(ready_w);
    let mut ack = [0u8; 2];
    match read(go_r.as_raw_fd(), &mut ack) {
        Ok(2) if &ack == b"ok" => {}
        _ => return Err(ChildError::Setup("uid/gid map handshake failed".into())),
    }
    drop(go_r);

    unshare(
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWNET,
    )
    .map_err(setup("unshare"))?;

    sethostname("sandrun").map_err(setup("sethostname"))?;

    match spec.network {
        // A fresh network namespace has no interfaces; isolation is the
        // default state, not something to construct.
        NetworkPolicy::Isolated => {}
        NetworkPolicy::LoopbackOnly => bring_up_loopback()?,
    }

    // Stop our mounts from propagating back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(setup("make / private"))?;

    build_private_root(spec)?;

    let mut command = Command::new(&spec.command[0]);
    command
        .args(&spec.command[1..])
        .current_dir("/work")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_w))
        .stderr(Stdio::from(err_w))
        .env_clear()
        .env("HOME", "/work")
        .env("TMPDIR", "/tmp")
        .env("LANG", "C.UTF-8")
        .env("HOSTNAME", "sandrun");
    if spec.env_root.is_some() {
        command
            .env(
                "PATH",
                "/env/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
            )
            .env("PYTHONPATH", "/env/packages");
    } else {
        command.env(
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        );
    }
    if spec.gpu_enabled {
        command.env("CUDA_VISIBLE_DEVICES", "0");
    }

    // The payload sends its seccomp notification listener back over this
    // pair (both ends close-on-exec, so the sandboxed code keeps neither).
    let (notify_parent, notify_child) = socket_pair()
        .map_err(|e| ChildError::Setup(format!("notify socketpair: {e}")))?;
    let notify_child_fd = notify_child.as_raw_fd();

    let limits = spec.limits.clone();
    unsafe {
        command.pre_exec(move || {
            // We are PID 1 of the new pid namespace; give it a matching /proc.
            mount(
                Some("proc"),
                "/proc",
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .map_err(nix_to_io)?;

            setrlimit(Resource::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes)
                .map_err(nix_to_io)?;
            setrlimit(
                Resource::RLIMIT_CPU,
                limits.cpu_seconds,
                limits.cpu_seconds + CPU_HARD_SLACK,
            )
            .map_err(nix_to_io)?;
            setrlimit(
                Resource::RLIMIT_NPROC,
                limits.max_processes as u64,
                limits.max_processes as u64,
            )
            .map_err(nix_to_io)?;
            setrlimit(Resource::RLIMIT_NOFILE, 256, 256).map_err(nix_to_io)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(nix_to_io)?;

            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            match seccomp::install_with_listener(&filters.notify) {
                Ok(listener) => {
                    // The filter is live from here on: only allowlisted
                    // syscalls (sendmsg, close, execve) may follow.
                    send_listener(notify_child_fd, listener.as_raw_fd())?;
                }
                Err(_) => {
                    // Pre-5.0 kernel. Announce no listener, then arm the
                    // plain kill filter; violations lose their number.
                    let marker = [b'K'];
                    libc::write(notify_child_fd, marker.as_ptr().cast(), 1);
                    seccompiler::apply_filter(&filters.kill)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                }
            }
            Ok(())
        });
    }

    let mut payload = command
        .spawn()
        .map_err(|e| ChildError::Exec(format!("{}: {e}", spec.command[0])))?;
    // Spawn succeeding means pre_exec ran to completion, so the marker (and
    // listener, if any) is already in the socket buffer.
    drop(notify_child);
    let listener = recv_listener(notify_parent.as_raw_fd());
    drop(notify_parent);

    let (status, blocked_syscall) = match listener {
        Some(listener) => wait_with_listener(&mut payload, &listener)?,
        None => (
            payload
                .wait()
                .map_err(|e| ChildError::Exec(format!("wait: {e}")))?,
            None,
        ),
    };

    // Authoritative accounting: rusage of reaped children, not anything the
    // payload claimed about itself.
    let usage = getrusage(UsageWho::RUSAGE_CHILDREN)
        .map_err(|e| ChildError::Exec(format!("getrusage: {e}")))?;
    let user = usage.user_time();
    let system = usage.system_time();
    let cpu_seconds = (user.tv_sec() + system.tv_sec()) as f64
        + (user.tv_usec() + system.tv_usec()) as f64 / 1e6;

    use std::os::unix::process::ExitStatusExt;
    Ok(ChildCounters {
        exit_code: status.code(),
        signal: status.signal(),
        cpu_seconds,
        max_rss_kb: usage.max_rss(),
        blocked_syscall,
        exec_error: None,
    })
}

/// Wait for the payload while watching the seccomp listener. A pending
/// notification means some process in the tree hit a blocked syscall:
/// record the number and kill the payload; it is PID 1 of its namespace,
/// so its death takes every descendant (including the parked offender).
fn wait_with_listener(
    payload: &mut Child,
    listener: &OwnedFd,
) -> Result<(ExitStatus, Option<i64>), ChildError> {
    let mut blocked: Option<i64> = None;
    loop {
        if let Some(status) = payload
            .try_wait()
            .map_err(|e| ChildError::Exec(format!("wait: {e}")))?
        {
            // Harvest a violation that raced the exit (a descendant may
            // have tripped the filter just before the payload finished).
            if blocked.is_none() && poll_listener(listener, 0) {
                blocked = seccomp::read_blocked_syscall(listener);
            }
            return Ok((status, blocked));
        }
        if poll_listener(listener, 100) {
            if let Some(nr) = seccomp::read_blocked_syscall(listener) {
                if blocked.is_none() {
                    blocked = Some(nr);
                }
                let _ = payload.kill();
            }
        }
    }
}

fn poll_listener(listener: &OwnedFd, timeout_ms: libc::c_int) -> bool {
    let mut pfd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    rc > 0 && pfd.revents & libc::POLLIN != 0
}

fn socket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Ship the listener fd to the supervising side: one marker byte plus an
/// SCM_RIGHTS control message. Runs under the live seccomp filter, so it
/// sticks to sendmsg.
fn send_listener(sock: RawFd, listener: RawFd) -> io::Result<()> {
    let marker = [b'L'];
    let mut iov = libc::iovec {
        iov_base: marker.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    // u64-backed buffer keeps the control message aligned.
    let mut cmsg_buf = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(4) } as _;

    unsafe {
        let cmsg = &mut *libc::CMSG_FIRSTHDR(&msg);
        cmsg.cmsg_level = libc::SOL_SOCKET;
        cmsg.cmsg_type = libc::SCM_RIGHTS;
        cmsg.cmsg_len = libc::CMSG_LEN(4) as _;
        *(libc::CMSG_DATA(cmsg) as *mut RawFd) = listener;
        if libc::sendmsg(sock, &msg, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Counterpart of [`send_listener`]: None when the payload announced the
/// kill-filter fallback (or nothing intelligible arrived).
fn recv_listener(sock: RawFd) -> Option<OwnedFd> {
    // The marker is already buffered once spawn returns; the poll is a
    // guard against a wedged peer, not a wait.
    let mut pfd = libc::pollfd {
        fd: sock,
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut pfd, 1, 5_000) } <= 0 {
        return None;
    }

    let mut marker = 0u8;
    let mut iov = libc::iovec {
        iov_base: (&mut marker as *mut u8).cast(),
        iov_len: 1,
    };
    let mut cmsg_buf = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

    if unsafe { libc::recvmsg(sock, &mut msg, 0) } < 1 {
        return None;
    }
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return None;
    }
    let cmsg = unsafe { &*cmsg };
    if cmsg.cmsg_level != libc::SOL_SOCKET || cmsg.cmsg_type != libc::SCM_RIGHTS {
        return None;
    }
    let fd = unsafe { *(libc::CMSG_DATA(cmsg) as *const RawFd) };
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bring 127.0.0.1 up inside the fresh network namespace. The `ip` binary
/// hides in different places across distributions.
fn bring_up_loopback() -> Result<(), ChildError> {
    let candidates = ["/usr/sbin/ip", "/sbin/ip", "/usr/bin/ip", "/bin/ip", "ip"];
    let mut last_error = String::new();
    for ip in candidates {
        match Command::new(ip).args(["link", "set", "lo", "up"]).output() {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                last_error = String::from_utf8_lossy(&output.stderr).into_owned();
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(ChildError::Setup(format!(
        "failed to bring up loopback: {last_error}"
    )))
}

/// Assemble the payload's root: a fresh tmpfs with read-only grafts of the
/// host toolchain, minimal device nodes, the writable work dir, and the
/// read-only environment clone. Then pivot into it and detach the host
/// root.
fn build_private_root(spec: &ExecSpec) -> Result<(), ChildError> {
    let root = spec.job_root.join("root");
    let setup = |stage: &str, e: &dyn std::fmt::Display| {
        ChildError::Setup(format!("{stage}: {e}"))
    };

    fs::create_dir_all(&root).map_err(|e| setup("mkdir root", &e))?;
    mount(
        Some("tmpfs"),
        &root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=755,size=16m"),
    )
    .map_err(|e| setup("mount root tmpfs", &e))?;

    for dir in [
        "dev", "proc", "tmp", "work", "env", ".oldroot",
    ] {
        fs::create_dir_all(root.join(dir)).map_err(|e| setup("mkdir", &e))?;
    }
    // World-writable private /tmp inside the sandbox.
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(root.join("tmp"), fs::Permissions::from_mode(0o1777));
    }

    // Read-only views of the host toolchain. On merged-usr systems some of
    // these are symlinks; replicate the link instead of binding.
    for name in ["usr", "bin", "sbin", "lib", "lib64", "etc", "opt"] {
        graft_system_path(name, &root)?;
    }

    // Minimal device nodes; mknod is off-limits in a user namespace, so
    // each is a bind of the host node.
    for dev in ["null", "zero", "urandom", "random"] {
        bind_device(Path::new("/dev").join(dev), &root)?;
    }
    if spec.gpu_enabled {
        if let Ok(entries) = fs::read_dir("/dev") {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with("nvidia") {
                    bind_device(entry.path(), &root)?;
                }
            }
        }
    }

    mount(
        Some(&spec.work_dir),
        &root.join("work"),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| setup("bind work", &e))?;

    if let Some(env_root) = &spec.env_root {
        let target = root.join("env");
        mount(
            Some(env_root.as_path()),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| setup("bind env", &e))?;
        remount_readonly(&target);
    }

    pivot_root(&root, &root.join(".oldroot")).map_err(|e| setup("pivot_root", &e))?;
    chdir("/").map_err(|e| setup("chdir /", &e))?;
    umount2("/.oldroot", MntFlags::MNT_DETACH).map_err(|e| setup("detach old root", &e))?;
    let _ = fs::remove_dir("/.oldroot");

    Ok(())
}

fn graft_system_path(name: &str, root: &Path) -> Result<(), ChildError> {
    let source = Path::new("/").join(name);
    let Ok(meta) = fs::symlink_metadata(&source) else {
        return Ok(()); // not every system has every dir
    };
    let target = root.join(name);
    if meta.file_type().is_symlink() {
        let link = fs::read_link(&source)
            .map_err(|e| ChildError::Setup(format!("readlink {name}: {e}")))?;
        std::os::unix::fs::symlink(link, &target)
            .map_err(|e| ChildError::Setup(format!("symlink {name}: {e}")))?;
        return Ok(());
    }
    if !meta.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(&target).map_err(|e| ChildError::Setup(format!("mkdir {name}: {e}")))?;
    mount(
        Some(&source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| ChildError::Setup(format!("bind {name}: {e}")))?;
    remount_readonly(&target);
    Ok(())
}

/// Best effort: hosts with locked mount flags refuse the remount inside a
/// user namespace, and the namespace fences still hold without it.
fn remount_readonly(target: &Path) {
    let _ = mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
        None::<&str>,
    );
}

fn bind_device(source: std::path::PathBuf, root: &Path) -> Result<(), ChildError> {
    // Device nodes only; control directories like /dev/nvidia-caps are not
    // bind targets we can touch into existence.
    match fs::symlink_metadata(&source) {
        Ok(meta) if !meta.is_dir() && !meta.file_type().is_symlink() => {}
        _ => return Ok(()),
    }
    let name = source
        .file_name()
        .ok_or_else(|| ChildError::Setup("device without a name".into()))?;
    let target = root.join("dev").join(name);
    File::create(&target).map_err(|e| ChildError::Setup(format!("touch device: {e}")))?;
    mount(
        Some(&source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| ChildError::Setup(format!("bind {}: {e}", source.display())))
}

// ---------------------------------------------------------------------------
// Parent-side helpers
// ---------------------------------------------------------------------------

/// Map a single unprivileged uid/gid into the child's user namespace.
/// `setgroups` must be denied before gid_map is writable.
fn write_uid_gid_maps(child: Pid, inner_id: u32) -> io::Result<()> {
    let uid = getuid().as_raw();
    let gid = getgid().as_raw();
    fs::write(
        format!("/proc/{child}/uid_map"),
        format!("{inner_id} {uid} 1\n"),
    )?;
    fs::write(format!("/proc/{child}/setgroups"), "deny\n")?;
    fs::write(
        format!("/proc/{child}/gid_map"),
        format!("{inner_id} {gid} 1\n"),
    )?;
    Ok(())
}

/// Wait for the child's readiness token; false when the child died first.
fn read_sync_byte(fd: &OwnedFd) -> bool {
    let mut buf = [0u8; 2];
    loop {
        match read(fd.as_raw_fd(), &mut buf) {
            Ok(2) => return &buf == b"ns",
            Err(nix::errno::Errno::EINTR) => continue,
            _ => return false,
        }
    }
}

fn write_counters(mut file: &File, counters: &ChildCounters) {
    if let Ok(bytes) = serde_json::to_vec(counters) {
        let _ = file.write_all(&bytes);
        let _ = file.flush();
    }
}

fn read_counters(path: &Path) -> Option<ChildCounters> {
    let bytes = fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(&bytes).ok()
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::sandbox::ExecLimits;

    fn spec_for(job_root: &Path, command: &[&str]) -> ExecSpec {
        let work = job_root.join("work");
        fs::create_dir_all(&work).unwrap();
        ExecSpec {
            job_root: job_root.to_path_buf(),
            work_dir: work,
            env_root: None,
            command: command.iter().map(|s| s.to_string()).collect(),
            limits: ExecLimits {
                wall: Duration::from_secs(10),
                cpu_seconds: 5,
                memory_bytes: 256 << 20,
                max_processes: 16,
                max_output_bytes: 64 * 1024,
            },
            network: NetworkPolicy::Isolated,
            gpu_enabled: false,
            cancel: CancellationToken::new(),
            log_tx: None,
        }
    }

    /// Namespaced execution needs unprivileged user namespaces; skip
    /// gracefully where the kernel or container runtime forbids them.
    fn run_or_skip(spec: ExecSpec) -> Option<ExecOutcome> {
        match NativeSandbox::new().run(spec) {
            Ok(outcome) => Some(outcome),
            Err(SandboxError::Setup(detail)) => {
                eprintln!("skipping native sandbox test: {detail}");
                None
            }
            Err(e) => panic!("unexpected sandbox error: {e}"),
        }
    }

    #[test]
    fn isolated_hello_world() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for(dir.path(), &["sh", "-c", "echo hi"]);
        fs::write(dir.path().join("work/unused.txt"), b"x").unwrap();
        let Some(outcome) = run_or_skip(spec) else { return };
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.stdout, b"hi\n");
    }

    #[test]
    fn child_sees_private_root_and_pid_one() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for(dir.path(), &["sh", "-c", "echo $$; ls /"]);
        let Some(outcome) = run_or_skip(spec) else { return };
        let stdout = String::from_utf8_lossy(&outcome.stdout);
        // PID 1 in its namespace, and a root with only our grafts.
        assert!(stdout.starts_with("1\n"), "stdout: {stdout}");
        assert!(stdout.contains("work"));
        assert!(!stdout.contains(".oldroot"));
    }

    #[test]
    fn writes_land_in_work_dir_only() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for(
            dir.path(),
            &["sh", "-c", "echo data > out.txt && ! touch /usr/forbidden 2>/dev/null"],
        );
        let Some(outcome) = run_or_skip(spec) else { return };
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(
            fs::read(dir.path().join("work/out.txt")).unwrap(),
            b"data\n"
        );
    }

    #[test]
    fn wall_timeout_terminates_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_for(dir.path(), &["sh", "-c", "sleep 30"]);
        spec.limits.wall = Duration::from_millis(500);
        let started = Instant::now();
        let Some(outcome) = run_or_skip(spec) else { return };
        assert!(outcome.timed_out);
        assert_eq!(outcome.failure, Some(FailureReason::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_entrypoint_reports_exec_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for(dir.path(), &["sandrun-no-such-interpreter"]);
        let Some(outcome) = run_or_skip(spec) else { return };
        assert!(matches!(outcome.failure, Some(FailureReason::Exec { .. })));
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn blocked_syscall_reports_its_number() {
        let dir = tempfile::tempdir().unwrap();
        // The shell's kill builtin issues kill(2), which is off the
        // allowlist (tgkill covers abort; signaling is not a job's
        // business).
        let spec = spec_for(dir.path(), &["sh", "-c", "kill -0 $$"]);
        let Some(outcome) = run_or_skip(spec) else { return };
        match outcome.failure {
            Some(FailureReason::BlockedSyscall { nr }) => {
                // -1 only on kernels without user-notification support.
                if nr != -1 {
                    assert_eq!(nr, libc::SYS_kill);
                }
            }
            other => panic!("expected a blocked syscall, got {other:?}"),
        }
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn counters_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");
        let file = File::create(&path).unwrap();
        write_counters(
            &file,
            &ChildCounters {
                exit_code: Some(2),
                signal: None,
                cpu_seconds: 1.25,
                max_rss_kb: 2048,
                blocked_syscall: None,
                exec_error: None,
            },
        );
        let counters = read_counters(&path).unwrap();
        assert_eq!(counters.exit_code, Some(2));
        assert_eq!(counters.max_rss_kb, 2048);
    }

    #[test]
    fn signal_classification() {
        // Notification path: the recorded number wins, even over the
        // SIGKILL the supervisor used to fell the tree.
        let counters = ChildCounters {
            blocked_syscall: Some(libc::SYS_socket),
            signal: Some(libc::SIGKILL),
            ..Default::default()
        };
        assert_eq!(
            classify_payload(&counters, 10).1,
            Some(FailureReason::BlockedSyscall {
                nr: libc::SYS_socket
            })
        );

        // Fallback path: SIGSYS with no listener, number unknown.
        let counters = ChildCounters {
            signal: Some(libc::SIGSYS),
            ..Default::default()
        };
        assert_eq!(
            classify_payload(&counters, 10).1,
            Some(FailureReason::BlockedSyscall { nr: -1 })
        );

        let counters = ChildCounters {
            signal: Some(libc::SIGKILL),
            cpu_seconds: 0.1,
            ..Default::default()
        };
        assert_eq!(classify_payload(&counters, 10).1, Some(FailureReason::Oom));

        let counters = ChildCounters {
            signal: Some(libc::SIGKILL),
            cpu_seconds: 10.2,
            ..Default::default()
        };
        assert_eq!(
            classify_payload(&counters, 10).1,
            Some(FailureReason::CpuExceeded)
        );

        let counters = ChildCounters {
            exit_code: Some(7),
            ..Default::default()
        };
        assert_eq!(classify_payload(&counters, 10), (Some(7), None));
    }
}
