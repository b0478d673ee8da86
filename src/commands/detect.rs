//! `profile detect`: trace a reference MPI execution and persist every
//! library and file the host runtime touched.

use clap::Args;

use crate::errors::*;
use crate::launcher;
use crate::profile::Stores;
use crate::resolve::{self, ClassifyPolicy};
use crate::shell::MessageInfo;
use crate::trace;

/// Helper binary exercising one point-to-point and one collective call,
/// shipped alongside the launcher integration.
const PROBE_BINARY: &str = "e4s-cl-probe";

#[derive(Args, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Detect {
    /// Profile to store the results in (defaults to the selected profile).
    #[clap(long)]
    pub profile: Option<String>,
    /// Reference command to trace; a built-in probe run is assembled when
    /// omitted.
    #[clap(allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Detect {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let target = match &self.profile {
            Some(name) => name.clone(),
            None => stores
                .user
                .selected()?
                .ok_or(ProfileError::NothingSelected)
                .suggestion("select a profile first, or pass --profile")?,
        };
        // fail early if the target does not exist; a system-level profile
        // is materialized in the user store so the merge has a home
        let existing = stores
            .get(&target)?
            .ok_or_else(|| ProfileError::NotFound(target.clone()))?;
        if stores.user.get(&target)?.is_none() {
            stores.user.create(existing)?;
        }

        let argv = self.sample_command(msg_info)?;
        let policy = ClassifyPolicy::new();

        let mut classified = run_and_classify(&argv, &policy, msg_info)?;
        if classified.libraries.is_empty() && classified.files.is_empty() {
            msg_info.warn("the traced run touched nothing of interest; retrying with verbose tracing");
            let mut verbose = msg_info.clone();
            verbose.verbosity = verbose.verbosity.max(1);
            classified = run_and_classify(&argv, &policy, &mut verbose)?;
            if classified.libraries.is_empty() && classified.files.is_empty() {
                eyre::bail!("detection produced an empty profile");
            }
        }

        for (path, reason) in &classified.rejected {
            msg_info.warn(format!("ignoring `{}`: {reason}", path.display()));
        }
        resolve::complete_libraries(&mut classified.libraries, &policy, msg_info);

        let libraries = classified.libraries;
        let mut files = classified.files;
        files.extend(classified.directories);
        stores.user.modify(|document| {
            let profile = document
                .profiles
                .iter_mut()
                .find(|p| p.name == target)
                .ok_or_else(|| ProfileError::NotFound(target.clone()))?;
            for record in &libraries {
                profile.libraries.insert(record.identity(), record.clone());
            }
            for record in &files {
                profile
                    .files
                    .insert(record.host_path.display().to_string(), record.clone());
            }
            Ok(())
        })?;

        msg_info.status(format!(
            "recorded {} libraries and {} files into `{target}`",
            libraries.len(),
            files.len()
        ));
        Ok(())
    }

    /// The traced invocation: the user's command verbatim, or a two-rank
    /// probe under whatever launcher is on PATH.
    fn sample_command(&self, msg_info: &mut MessageInfo) -> Result<Vec<String>> {
        if !self.command.is_empty() {
            return Ok(self.command.clone());
        }

        let launcher_bin = ["mpirun", "mpiexec", "srun", "aprun", "jsrun"]
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                EnvironmentError("no MPI launcher found on PATH to build a probe run".to_owned())
            })?
            .display()
            .to_string();

        let payload = match which::which(PROBE_BINARY) {
            Ok(probe) => probe.display().to_string(),
            Err(_) => {
                msg_info.warn(format!(
                    "`{PROBE_BINARY}` not found; falling back to `hostname`, MPI-specific paths may be missed"
                ));
                "hostname".to_owned()
            }
        };

        msg_info.warn(
            "tracing on this host only; libraries resolved on remote nodes may be missed",
        );
        Ok(vec![
            launcher_bin.clone(),
            launcher::nproc_flag(&launcher_bin).to_owned(),
            "2".to_owned(),
            payload,
        ])
    }
}

fn run_and_classify(
    argv: &[String],
    policy: &ClassifyPolicy,
    msg_info: &mut MessageInfo,
) -> Result<resolve::Classification> {
    let trace = trace::trace(argv, &[], msg_info)
        .suggestion("if tracing is unavailable here, populate the profile with `profile edit --add-libraries`")?;
    if trace.status != 0 {
        msg_info.warn(format!(
            "the traced command exited with status {}; results may be incomplete",
            trace.status
        ));
    }
    Ok(resolve::classify(trace.paths, policy))
}
