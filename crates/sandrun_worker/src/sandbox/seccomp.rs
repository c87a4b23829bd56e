//! Syscall allowlist for sandboxed children.
//!
//! Sized for interpreted workloads: file and memory syscalls, time, futex,
//! process bookkeeping. Network, tracing and event-loop families are
//! absent; the network namespace is the second fence.
//!
//! Violations kill the payload, and the supervisor must report which
//! syscall was blocked. The kernel never tells a plain `waitpid` caller
//! the number, so the filter is installed with a seccomp user-notification
//! listener: a violation parks the offending thread and surfaces
//! `seccomp_data.nr` on the listener fd, where the supervisor records it
//! and kills the payload tree. Kernels without `SECCOMP_RET_USER_NOTIF`
//! (pre-5.0) fall back to a plain kill filter; there the number is
//! unrecoverable and reported as unknown.
//!
//! seccompiler has no user-notification action, so the notify program is
//! the kill program with its return constants rewritten.

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Syscalls available on every supported architecture. Glibc probes some
/// newer variants (`faccessat2`, `renameat2`, `clone3`) before falling
/// back, so both generations stay listed; `sendmsg` carries the listener
/// fd handshake and nothing else once the socketpair is gone.
const ALLOWED: &[i64] = &[
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_writev,
    libc::SYS_pread64,
    libc::SYS_pwrite64,
    libc::SYS_close,
    libc::SYS_fstat,
    libc::SYS_newfstatat,
    libc::SYS_statx,
    libc::SYS_lseek,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_munmap,
    libc::SYS_mremap,
    libc::SYS_madvise,
    libc::SYS_brk,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_rt_sigreturn,
    libc::SYS_sigaltstack,
    libc::SYS_ioctl,
    libc::SYS_openat,
    libc::SYS_faccessat,
    libc::SYS_faccessat2,
    libc::SYS_getdents64,
    libc::SYS_getcwd,
    libc::SYS_chdir,
    libc::SYS_fcntl,
    libc::SYS_mkdirat,
    libc::SYS_unlinkat,
    libc::SYS_renameat,
    libc::SYS_renameat2,
    libc::SYS_readlinkat,
    libc::SYS_fchmodat,
    libc::SYS_ftruncate,
    libc::SYS_utimensat,
    libc::SYS_fsync,
    libc::SYS_fdatasync,
    libc::SYS_umask,
    libc::SYS_clock_gettime,
    libc::SYS_clock_nanosleep,
    libc::SYS_getpid,
    libc::SYS_getppid,
    libc::SYS_gettid,
    libc::SYS_getpgid,
    libc::SYS_getuid,
    libc::SYS_geteuid,
    libc::SYS_getgid,
    libc::SYS_getegid,
    libc::SYS_getrandom,
    libc::SYS_futex,
    libc::SYS_set_tid_address,
    libc::SYS_set_robust_list,
    libc::SYS_rseq,
    libc::SYS_uname,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_wait4,
    libc::SYS_clone,
    libc::SYS_clone3,
    libc::SYS_execve,
    libc::SYS_dup3,
    libc::SYS_pipe2,
    libc::SYS_prlimit64,
    libc::SYS_tgkill,
    libc::SYS_ppoll,
    libc::SYS_sendmsg,
];

/// Legacy aliases glibc and the shells still reach for on x86-64; the
/// asm-generic table never had them.
#[cfg(target_arch = "x86_64")]
const ALLOWED_ARCH: &[i64] = &[
    libc::SYS_open,
    libc::SYS_stat,
    libc::SYS_lstat,
    libc::SYS_access,
    libc::SYS_poll,
    libc::SYS_select,
    libc::SYS_dup2,
    libc::SYS_pipe,
    libc::SYS_readlink,
    libc::SYS_mkdir,
    libc::SYS_unlink,
    libc::SYS_rename,
    libc::SYS_chmod,
    libc::SYS_getpgrp,
    libc::SYS_arch_prctl,
];

#[cfg(not(target_arch = "x86_64"))]
const ALLOWED_ARCH: &[i64] = &[];

const SECCOMP_RET_KILL_PROCESS_K: u32 = 0x8000_0000;
const SECCOMP_RET_USER_NOTIF_K: u32 = 0x7fc0_0000;

const SECCOMP_SET_MODE_FILTER: libc::c_long = 1;
const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_long = 8;

/// `_IOWR('!', 0, struct seccomp_notif)`: dir=RW, size=80, type='!'.
const SECCOMP_IOCTL_NOTIF_RECV: u64 = 0xc050_2100;

// Kernel-owned layouts for SECCOMP_IOCTL_NOTIF_RECV; only `nr` is read
// here, the rest must pad out the struct exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct SeccompData {
    nr: i32,
    arch: u32,
    instruction_pointer: u64,
    args: [u64; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct SeccompNotif {
    id: u64,
    pid: u32,
    flags: u32,
    data: SeccompData,
}

fn compile() -> Result<BpfProgram, String> {
    let arch = TargetArch::try_from(std::env::consts::ARCH)
        .map_err(|_| format!("unsupported seccomp arch: {}", std::env::consts::ARCH))?;
    let rules: BTreeMap<i64, Vec<SeccompRule>> = ALLOWED
        .iter()
        .chain(ALLOWED_ARCH.iter())
        .map(|nr| (*nr, vec![]))
        .collect();
    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        arch,
    )
    .map_err(|e| e.to_string())?;
    BpfProgram::try_from(filter).map_err(|e| e.to_string())
}

/// The fallback program: violations kill the offending process outright.
pub(crate) fn kill_filter() -> Result<BpfProgram, String> {
    compile()
}

/// The preferred program: every kill return (mismatched syscall or
/// mismatched arch, both fatal either way) is rewritten to a
/// user-notification, so the listener learns the syscall number before
/// the supervisor kills the tree.
pub(crate) fn notify_filter() -> Result<BpfProgram, String> {
    let mut bpf = compile()?;
    for insn in bpf.iter_mut() {
        if insn.k == SECCOMP_RET_KILL_PROCESS_K {
            insn.k = SECCOMP_RET_USER_NOTIF_K;
        }
    }
    Ok(bpf)
}

/// Install `bpf` on the calling process via `seccomp(2)` and return the
/// notification listener fd. Fails on kernels without user-notification
/// support; the caller falls back to [`kill_filter`] through seccompiler.
///
/// Runs between fork and exec; no-new-privs must already be set.
pub(crate) fn install_with_listener(bpf: &BpfProgram) -> io::Result<OwnedFd> {
    let mut prog = libc::sock_fprog {
        len: bpf.len() as libc::c_ushort,
        filter: bpf.as_ptr() as *mut libc::sock_filter,
    };
    let fd = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_NEW_LISTENER,
            &mut prog as *mut libc::sock_fprog,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Drain one pending notification from the listener and return the
/// offending syscall number. None when nothing is pending or the offender
/// already died.
pub(crate) fn read_blocked_syscall(listener: &OwnedFd) -> Option<i64> {
    use std::os::fd::AsRawFd;
    // The kernel requires the notif struct zeroed before RECV.
    let mut notif: SeccompNotif = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_RECV as _,
            &mut notif,
        )
    };
    if rc < 0 {
        return None;
    }
    Some(notif.data.nr as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_compile_for_this_arch() {
        assert!(!kill_filter().unwrap().is_empty());
        assert!(!notify_filter().unwrap().is_empty());
    }

    #[test]
    fn notify_filter_swaps_every_kill_for_a_notification() {
        let kill = kill_filter().unwrap();
        let notify = notify_filter().unwrap();
        assert_eq!(kill.len(), notify.len());
        assert!(kill.iter().any(|i| i.k == SECCOMP_RET_KILL_PROCESS_K));
        assert!(!notify.iter().any(|i| i.k == SECCOMP_RET_KILL_PROCESS_K));
        assert!(notify.iter().any(|i| i.k == SECCOMP_RET_USER_NOTIF_K));
    }

    #[test]
    fn allowlist_size_is_deliberate() {
        // Growing either list is a security decision, not a convenience;
        // update these counts (and the docs) consciously.
        assert_eq!(ALLOWED.len(), 67);
        #[cfg(target_arch = "x86_64")]
        assert_eq!(ALLOWED_ARCH.len(), 15);
    }

    #[test]
    fn network_and_event_loop_families_stay_blocked() {
        for nr in [
            libc::SYS_socket,
            libc::SYS_connect,
            libc::SYS_bind,
            libc::SYS_ptrace,
            libc::SYS_mount,
            libc::SYS_kill,
            libc::SYS_epoll_create1,
            libc::SYS_epoll_ctl,
        ] {
            assert!(
                !ALLOWED.contains(&nr) && !ALLOWED_ARCH.contains(&nr),
                "syscall {nr} must not be allowlisted"
            );
        }
    }

    #[test]
    fn notif_layout_matches_the_ioctl_number() {
        // The RECV ioctl encodes sizeof(struct seccomp_notif); a struct
        // drift here would corrupt the read.
        assert_eq!(std::mem::size_of::<SeccompNotif>(), 80);
        assert_eq!((SECCOMP_IOCTL_NOTIF_RECV >> 16) & 0x3fff, 80);
    }
}
