//! Syscall-level path tracing.
//!
//! A reference MPI run is executed under `ptrace`; every path-accepting
//! syscall of the launcher and all of its children is recorded at entry.
//! Only the path argument is decoded, nothing else.

use std::path::{Component, Path, PathBuf};

use crate::errors::*;

/// Result of one traced execution.
#[derive(Debug)]
pub struct Trace {
    /// Exit code of the root child.
    pub status: i32,
    /// Ordered path observations; duplicates preserved.
    pub paths: Vec<PathBuf>,
}

/// Lexical path normalization: `.` removed, `..` collapsed. No filesystem
/// access, symlinks are the classifier's business.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            comp => out.push(comp.as_os_str()),
        }
    }
    out
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use std::collections::HashSet;
    use std::ffi::CString;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use nix::sys::ptrace;
    use nix::sys::signal::{raise, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{execvp, fork, setpgid, ForkResult, Pid};

    use super::{normalize, Trace};
    use crate::errors::*;
    use crate::shell::MessageInfo;

    /// Exit code the child uses when the kernel refused `PTRACE_TRACEME`.
    const TRACEME_FAILED: i32 = 66;

    const PATH_MAX: usize = 4096;

    /// Path-accepting syscalls and which argument register holds the path.
    /// `Second` covers the `*at` family where the first argument is a dirfd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PathArg {
        First,
        Second,
    }

    fn path_argument(sysno: u64) -> Option<PathArg> {
        match sysno as i64 {
            libc::SYS_open
            | libc::SYS_execve
            | libc::SYS_stat
            | libc::SYS_lstat
            | libc::SYS_access
            | libc::SYS_readlink => Some(PathArg::First),
            libc::SYS_openat
            | libc::SYS_newfstatat
            | libc::SYS_statx
            | libc::SYS_faccessat
            | libc::SYS_readlinkat => Some(PathArg::Second),
            _ => None,
        }
    }

    pub fn trace(
        argv: &[String],
        envs: &[(String, String)],
        msg_info: &mut MessageInfo,
    ) -> Result<Trace> {
        if argv.is_empty() {
            eyre::bail!("cannot trace an empty command");
        }
        msg_info.debug(format!("tracing `{}`", argv.join(" ")));

        // SAFETY: the child only calls async-signal-safe functions before
        // execvp (setpgid, ptrace, raise).
        match unsafe { fork() }.wrap_err("could not fork the traced child")? {
            ForkResult::Child => {
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).ok();
                for (key, value) in envs {
                    std::env::set_var(key, value);
                }
                if ptrace::traceme().is_err() {
                    std::process::exit(TRACEME_FAILED);
                }
                raise(Signal::SIGSTOP).ok();
                let program = CString::new(argv[0].as_bytes()).unwrap_or_default();
                let args: Vec<CString> = argv
                    .iter()
                    .filter_map(|a| CString::new(a.as_bytes()).ok())
                    .collect();
                let _ = execvp(&program, &args);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                FOREGROUND_PGID.store(child.as_raw(), Ordering::SeqCst);
                let result = supervise(child, msg_info);
                FOREGROUND_PGID.store(0, Ordering::SeqCst);
                result
            }
        }
    }

    fn supervise(root: Pid, msg_info: &mut MessageInfo) -> Result<Trace> {
        // wait for the child's initial SIGSTOP
        match waitpid(root, None).wrap_err("could not wait for the traced child")? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            WaitStatus::Exited(_, code) if code == TRACEME_FAILED => {
                return Err(TraceError::PtraceDenied("PTRACE_TRACEME failed".to_owned()))
                    .suggestion("check `sysctl kernel.yama.ptrace_scope`, or skip detection and populate the profile by hand");
            }
            WaitStatus::Exited(..) => return Err(TraceError::ChildLost.into()),
            other => eyre::bail!("unexpected first stop of traced child: {other:?}"),
        }

        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_EXITKILL;
        ptrace::setoptions(root, options)
            .map_err(|e| TraceError::PtraceDenied(e.to_string()))
            .suggestion("check `sysctl kernel.yama.ptrace_scope`")?;
        ptrace::syscall(root, None).wrap_err("could not resume the traced child")?;

        let mut tracees: HashSet<Pid> = HashSet::from([root]);
        let mut paths = vec![];
        let mut status = 0;

        while !tracees.is_empty() {
            let waited = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(waited) => waited,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).wrap_err("waitpid failed while tracing"),
            };
            match waited {
                WaitStatus::PtraceSyscall(pid) => {
                    tracees.insert(pid);
                    if let Some(path) = syscall_path(pid) {
                        paths.push(path);
                    }
                    ptrace::syscall(pid, None).ok();
                }
                WaitStatus::PtraceEvent(pid, _, _) => {
                    tracees.insert(pid);
                    ptrace::syscall(pid, None).ok();
                }
                WaitStatus::Stopped(pid, signal) => {
                    tracees.insert(pid);
                    // the attach stop of a new child carries SIGSTOP, which
                    // must not be delivered
                    let deliver = match signal {
                        Signal::SIGSTOP => None,
                        other => Some(other),
                    };
                    ptrace::syscall(pid, deliver).ok();
                }
                WaitStatus::Exited(pid, code) => {
                    tracees.remove(&pid);
                    if pid == root {
                        status = code;
                    }
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    tracees.remove(&pid);
                    if pid == root {
                        status = 128 + signal as i32;
                    }
                }
                _ => {}
            }
        }

        msg_info.debug(format!("trace recorded {} path(s)", paths.len()));
        Ok(Trace { status, paths })
    }

    /// At syscall entry, decodes the path argument if the syscall takes one.
    fn syscall_path(pid: Pid) -> Option<PathBuf> {
        let regs = ptrace::getregs(pid).ok()?;
        // entry stop: the kernel parks -ENOSYS in rax
        if regs.rax as i64 != -(libc::ENOSYS as i64) {
            return None;
        }
        let addr = match path_argument(regs.orig_rax)? {
            PathArg::First => regs.rdi,
            PathArg::Second => regs.rsi,
        };
        let raw = read_string(pid, addr)?;
        if raw.is_empty() {
            return None;
        }
        let path = PathBuf::from(raw);
        let absolute = if path.is_absolute() {
            path
        } else {
            child_cwd(pid)?.join(path)
        };
        Some(normalize(&absolute))
    }

    fn child_cwd(pid: Pid) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/{pid}/cwd")).ok()
    }

    /// Reads a NUL-terminated string out of the tracee, one word at a time.
    fn read_string(pid: Pid, addr: u64) -> Option<String> {
        let mut bytes = vec![];
        let mut offset = 0u64;
        while bytes.len() < PATH_MAX {
            let word = ptrace::read(pid, (addr + offset) as ptrace::AddressType).ok()?;
            for byte in word.to_ne_bytes() {
                if byte == 0 {
                    return String::from_utf8(bytes).ok();
                }
                bytes.push(byte);
            }
            offset += std::mem::size_of::<libc::c_long>() as u64;
        }
        None
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn trace(
    argv: &[String],
    envs: &[(String, String)],
    msg_info: &mut crate::shell::MessageInfo,
) -> Result<Trace> {
    imp::trace(argv, envs, msg_info)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub fn trace(
    _argv: &[String],
    _envs: &[(String, String)],
    _msg_info: &mut crate::shell::MessageInfo,
) -> Result<Trace> {
    Err(TraceError::Unsupported.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize(Path::new("/usr/lib/../lib64/./libmpi.so")),
            PathBuf::from("/usr/lib64/libmpi.so")
        );
        assert_eq!(normalize(Path::new("/a/b/c/../../d")), PathBuf::from("/a/d"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn trace_observes_paths() {
        let mut msg_info = crate::shell::MessageInfo::default();
        let argv = vec!["/bin/ls".to_owned(), "/".to_owned()];
        match trace(&argv, &[], &mut msg_info) {
            Ok(trace) => {
                assert_eq!(trace.status, 0);
                // the dynamic linker always touches the loader cache
                assert!(trace
                    .paths
                    .iter()
                    .any(|p| p.to_string_lossy().contains("ld.so") || p.starts_with("/lib") || p.starts_with("/etc")));
            }
            // tracing may legitimately be denied in restricted sandboxes
            Err(e) => {
                assert!(e.downcast_ref::<TraceError>().is_some(), "{e}");
            }
        }
    }
}
