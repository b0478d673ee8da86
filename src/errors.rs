use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

pub use color_eyre::Section;
pub use eyre::Context;
pub use eyre::Result;

pub static TERMINATED: AtomicBool = AtomicBool::new(false);

/// Process group of the launcher or traced child, if one is running.
/// Signal handlers forward termination to it before exiting.
pub static FOREGROUND_PGID: AtomicI32 = AtomicI32::new(0);

/// Grace period between forwarding SIGTERM and escalating to SIGKILL.
pub const TERMINATION_GRACE_SECS: u64 = 10;

pub fn install_panic_hook() -> Result<()> {
    color_eyre::config::HookBuilder::new()
        .display_env_section(false)
        .install()
}

fn termination_handler() {
    if TERMINATED.swap(true, Ordering::SeqCst) {
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pgid = FOREGROUND_PGID.load(Ordering::SeqCst);
        if pgid > 0 {
            let group = Pid::from_raw(-pgid);
            kill(group, Signal::SIGTERM).ok();
            std::thread::sleep(std::time::Duration::from_secs(TERMINATION_GRACE_SECS));
            // group still alive after the grace period, stop waiting for it
            if kill(group, None).is_ok() {
                kill(group, Signal::SIGKILL).ok();
            }
        }
    }

    // EOWNERDEAD, seems to be the same on linux, macos, and bash on windows.
    std::process::exit(130);
}

pub fn install_termination_hook() -> Result<()> {
    ctrlc::set_handler(termination_handler).map_err(Into::into)
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("`{1}` failed with exit code: {0}")]
    NonZeroExitCode(std::process::ExitStatus, String),
    #[error("could not execute `{0}`")]
    CouldNotExecute(#[source] Box<dyn std::error::Error + Send + Sync>, String),
    #[error("`{0:?}` output was not UTF-8")]
    Utf8Error(#[source] std::string::FromUtf8Error, std::process::Output),
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("no profile named `{0}`")]
    NotFound(String),
    #[error("a profile named `{0}` already exists")]
    AlreadyExists(String),
    #[error("profile `{0}` is selected; unselect it before deleting")]
    DeleteSelected(String),
    #[error("profile names may not be empty")]
    EmptyName,
    #[error("`{0}` appears in both the library and file sets")]
    Overlap(PathBuf),
    #[error("the system-level store is read-only")]
    ReadOnlyStore,
    #[error("no profile is selected")]
    NothingSelected,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("ptrace was denied by the kernel ({0})")]
    PtraceDenied(String),
    #[error("syscall tracing is not supported on this platform")]
    Unsupported,
    #[error("traced child exited before execve")]
    ChildLost,
}

/// Missing tools, bad images, denied ptrace. Reported with exit code 2
/// instead of the generic 1.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EnvironmentError(pub String);

/// Exit code the top level should use for an error report.
pub fn exit_code(report: &eyre::Report) -> i32 {
    if report.downcast_ref::<EnvironmentError>().is_some()
        || report.downcast_ref::<TraceError>().is_some()
        || report.downcast_ref::<which::Error>().is_some()
    {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_errors_exit_2() {
        let report = eyre::Report::new(EnvironmentError("no such backend".to_owned()));
        assert_eq!(exit_code(&report), 2);
        let report = eyre::Report::new(TraceError::Unsupported);
        assert_eq!(exit_code(&report), 2);
    }

    #[test]
    fn user_errors_exit_1() {
        let report = eyre::Report::new(ProfileError::NotFound("mvapich".to_owned()));
        assert_eq!(exit_code(&report), 1);
        let report = eyre::eyre!("malformed configuration");
        assert_eq!(exit_code(&report), 1);
    }
}
