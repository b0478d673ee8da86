use std::env;

use owo_colors::{OwoColorize, Stream};

/// Verbosity and color state threaded through every operation that talks to
/// the user. Rank workers get a rank prefix so interleaved launcher output
/// stays attributable.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub verbosity: u8,
    pub rank: Option<u32>,
    pub ranked_log: bool,
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MessageInfo {
    pub fn new(verbosity: u8) -> Self {
        MessageInfo {
            verbosity,
            rank: rank_from_env(),
            ranked_log: true,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbosity > 0
    }

    fn prefix(&self) -> String {
        match (self.ranked_log, self.rank) {
            (true, Some(rank)) => format!("[{rank}] "),
            _ => String::new(),
        }
    }

    /// Unconditional, uncolored output.
    pub fn print(&mut self, message: impl AsRef<str>) {
        println!("{}{}", self.prefix(), message.as_ref());
    }

    /// Progress chatter; suppressed for ranks when ranked logging is off.
    pub fn status(&mut self, message: impl AsRef<str>) {
        if self.rank.is_some() && !self.ranked_log {
            return;
        }
        eprintln!("{}{}", self.prefix(), message.as_ref());
    }

    /// Only shown with `--verbose`.
    pub fn debug(&mut self, message: impl AsRef<str>) {
        if self.is_verbose() {
            eprintln!("{}{}", self.prefix(), message.as_ref());
        }
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        eprintln!(
            "{}{}: {}",
            self.prefix(),
            "warning".if_supports_color(Stream::Stderr, |t| t.yellow().to_string()),
            message.as_ref()
        );
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        eprintln!(
            "{}{}: {}",
            self.prefix(),
            "error".if_supports_color(Stream::Stderr, |t| t.red().to_string()),
            message.as_ref()
        );
    }
}

/// MPI rank of this process, when a launcher told us. First launcher
/// convention that is set wins.
pub fn rank_from_env() -> Option<u32> {
    ["PMI_RANK", "OMPI_COMM_WORLD_RANK", "SLURM_PROCID", "PMIX_RANK"]
        .iter()
        .find_map(|var| env::var(var).ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_prefix() {
        let mut info = MessageInfo::new(0);
        info.rank = Some(3);
        assert_eq!(info.prefix(), "[3] ");
        // prefix only applies when ranked logging is on
        info.ranked_log = false;
        assert_eq!(info.prefix(), "");
    }

    #[test]
    fn verbosity_gate() {
        let info = MessageInfo::new(0);
        assert!(!info.is_verbose());
        let info = MessageInfo::new(2);
        assert!(info.is_verbose());
    }
}
