#![deny(missing_debug_implementations, rust_2018_idioms)]

pub mod commands;
pub mod config;
pub mod container;
pub mod elf;
pub mod errors;
pub mod extensions;
pub mod launcher;
pub mod mpi;
pub mod profile;
pub mod resolve;
pub mod script;
pub mod shell;
pub mod trace;
pub mod wi4mpi;

pub use self::config::Config;
pub use self::container::Backend;
pub use self::errors::{install_panic_hook, install_termination_hook, Result};
pub use self::extensions::CommandExt;
pub use self::profile::{PathKind, PathRecord, Profile, ProfileStore, StorageLevel};

/// In-container bind root when neither configuration nor environment says
/// otherwise.
pub const CONTAINER_DIR: &str = "/.e4s-cl";

/// Subdirectory of the bind root where host libraries appear in-container.
pub const HOST_LIBS_DIR: &str = "hostlibs";

/// Name of the entry script inside the bind root.
pub const ENTRY_SCRIPT: &str = "entry";
