//! `e4s-cl profile` subcommands: the management surface of the profile
//! store.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::errors::*;
use crate::profile::{self, Profile, StorageLevel, Stores};
use crate::shell::MessageInfo;

use super::classify_arguments;

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    /// Create an empty profile.
    Create(Create),
    /// Copy an existing profile under a new name.
    Copy(Copy),
    /// Delete a profile.
    Delete(Delete),
    /// Modify fields of an existing profile.
    Edit(Edit),
    /// List profiles, optionally restricted to one storage level.
    List(List),
    /// Show one profile in detail.
    Show(Show),
    /// Mark a profile as selected.
    Select(Select),
    /// Clear the selection.
    Unselect,
    /// Trace a reference MPI run and store what it touches.
    Detect(super::detect::Detect),
    /// Print a storage level as deterministic JSON.
    Dump(Dump),
    /// Show the differences between two profiles.
    Diff(Diff),
}

impl ProfileCommand {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        match self {
            ProfileCommand::Create(args) => args.run(stores, msg_info),
            ProfileCommand::Copy(args) => args.run(stores, msg_info),
            ProfileCommand::Delete(args) => args.run(stores, msg_info),
            ProfileCommand::Edit(args) => args.run(stores, msg_info),
            ProfileCommand::List(args) => args.run(stores, msg_info),
            ProfileCommand::Show(args) => args.run(stores, msg_info),
            ProfileCommand::Select(args) => args.run(stores, msg_info),
            ProfileCommand::Unselect => {
                stores.user.unselect()?;
                Ok(())
            }
            ProfileCommand::Detect(args) => args.run(stores, msg_info),
            ProfileCommand::Dump(args) => args.run(stores, msg_info),
            ProfileCommand::Diff(args) => args.run(stores, msg_info),
        }
    }
}

#[derive(Args, Debug)]
pub struct Create {
    /// Name of the new profile.
    pub name: String,
    /// Container backend.
    #[clap(long)]
    pub backend: Option<String>,
    /// Container image identifier.
    #[clap(long)]
    pub image: Option<String>,
    /// Script sourced inside the container.
    #[clap(long)]
    pub source: Option<PathBuf>,
    /// Translation layer installation path.
    #[clap(long)]
    pub wi4mpi: Option<PathBuf>,
    /// Storage level to create the profile in.
    #[clap(long, default_value = "user")]
    pub level: StorageLevel,
}

impl Create {
    pub fn run(self, stores: &Stores, _msg_info: &mut MessageInfo) -> Result<()> {
        let mut profile = Profile::new(&self.name);
        profile.backend = self.backend;
        profile.image = self.image;
        profile.source = self.source;
        profile.wi4mpi = self.wi4mpi;
        stores.writable(Some(self.level))?.create(profile)
    }
}

#[derive(Args, Debug)]
pub struct Copy {
    /// Profile to copy.
    pub src: String,
    /// Name of the copy.
    pub dst: String,
}

impl Copy {
    pub fn run(self, stores: &Stores, _msg_info: &mut MessageInfo) -> Result<()> {
        let mut profile = stores
            .get(&self.src)?
            .ok_or_else(|| ProfileError::NotFound(self.src.clone()))?;
        profile.name = self.dst;
        stores.user.create(profile)
    }
}

#[derive(Args, Debug)]
pub struct Delete {
    /// Profile to delete.
    pub name: String,
}

impl Delete {
    pub fn run(self, stores: &Stores, _msg_info: &mut MessageInfo) -> Result<()> {
        stores.user.delete(&self.name)
    }
}

#[derive(Args, Debug)]
pub struct Edit {
    /// Profile to edit.
    pub name: String,
    /// Rename the profile.
    #[clap(long)]
    pub new_name: Option<String>,
    /// Set the backend.
    #[clap(long)]
    pub backend: Option<String>,
    /// Set the image.
    #[clap(long)]
    pub image: Option<String>,
    /// Set the setup script.
    #[clap(long)]
    pub source: Option<PathBuf>,
    /// Set the translation layer path.
    #[clap(long)]
    pub wi4mpi: Option<PathBuf>,
    /// Set extra translation layer options.
    #[clap(long)]
    pub wi4mpi_options: Option<String>,
    /// Libraries to add, comma separated.
    #[clap(long, value_delimiter = ',')]
    pub add_libraries: Vec<PathBuf>,
    /// Library sonames or paths to remove.
    #[clap(long, value_delimiter = ',')]
    pub remove_libraries: Vec<String>,
    /// Files or directories to add, comma separated.
    #[clap(long, value_delimiter = ',')]
    pub add_files: Vec<PathBuf>,
    /// File paths to remove.
    #[clap(long, value_delimiter = ',')]
    pub remove_files: Vec<String>,
}

impl Edit {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let mut profile = stores
            .get(&self.name)?
            .ok_or_else(|| ProfileError::NotFound(self.name.clone()))?;

        if let Some(new_name) = self.new_name {
            profile.name = new_name;
        }
        if let Some(backend) = self.backend {
            profile.backend = Some(backend);
        }
        if let Some(image) = self.image {
            profile.image = Some(image);
        }
        if let Some(source) = self.source {
            profile.source = Some(source);
        }
        if let Some(wi4mpi) = self.wi4mpi {
            profile.wi4mpi = Some(wi4mpi);
        }
        if let Some(options) = self.wi4mpi_options {
            profile.wi4mpi_options = Some(options);
        }

        for record in classify_arguments(&self.add_libraries, msg_info)? {
            profile.add_library(record)?;
        }
        for record in classify_arguments(&self.add_files, msg_info)? {
            match record.kind {
                crate::PathKind::Library => profile.add_library(record)?,
                _ => profile.add_file(record)?,
            }
        }
        for key in &self.remove_libraries {
            let removed = profile.libraries.remove(key).is_some();
            if !removed {
                profile
                    .libraries
                    .retain(|_, record| record.host_path != PathBuf::from(key));
            }
        }
        for key in &self.remove_files {
            profile.files.remove(key);
        }

        stores.user.update(&self.name, profile)
    }
}

#[derive(Args, Debug)]
pub struct List {
    /// Restrict the listing to one storage level.
    #[clap(long)]
    pub level: Option<StorageLevel>,
}

impl List {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let selected = stores.user.selected()?;
        for (level, profile) in stores.list(self.level)? {
            let marker = if selected.as_deref() == Some(&profile.name) {
                "*"
            } else {
                " "
            };
            msg_info.print(format!(
                "{marker} {:<24} {:<8} backend={:<12} libraries={:<4} files={}",
                profile.name,
                level,
                profile.backend.as_deref().unwrap_or("-"),
                profile.libraries.len(),
                profile.files.len(),
            ));
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct Show {
    /// Profile to show (defaults to the selected profile).
    pub name: Option<String>,
}

impl Show {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let profile = match &self.name {
            Some(name) => stores
                .get(name)?
                .ok_or_else(|| ProfileError::NotFound(name.clone()))?,
            None => stores
                .selected()?
                .ok_or(ProfileError::NothingSelected)?,
        };

        msg_info.print(format!("name:    {}", profile.name));
        msg_info.print(format!(
            "backend: {}",
            profile.backend.as_deref().unwrap_or("-")
        ));
        msg_info.print(format!(
            "image:   {}",
            profile.image.as_deref().unwrap_or("-")
        ));
        if let Some(source) = &profile.source {
            msg_info.print(format!("source:  {}", source.display()));
        }
        if let Some(wi4mpi) = &profile.wi4mpi {
            msg_info.print(format!("wi4mpi:  {}", wi4mpi.display()));
        }
        if let Some(options) = &profile.wi4mpi_options {
            msg_info.print(format!("wi4mpi options: {options}"));
        }
        if !profile.libraries.is_empty() {
            msg_info.print("libraries:");
            for (identity, record) in &profile.libraries {
                msg_info.print(format!("  {identity} => {}", record.host_path.display()));
            }
        }
        if !profile.files.is_empty() {
            msg_info.print("files:");
            for record in profile.files.values() {
                msg_info.print(format!("  {}", record.host_path.display()));
            }
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct Select {
    /// Profile to select.
    pub name: String,
}

impl Select {
    pub fn run(self, stores: &Stores, _msg_info: &mut MessageInfo) -> Result<()> {
        // system-level profiles are selectable; the selection itself always
        // lives in the user store
        if stores.user.get(&self.name)?.is_none() {
            let profile = stores
                .get(&self.name)?
                .ok_or_else(|| ProfileError::NotFound(self.name.clone()))?;
            stores.user.create(profile)?;
        }
        stores.user.select(&self.name)
    }
}

#[derive(Args, Debug)]
pub struct Dump {
    /// Storage level to dump.
    #[clap(long, default_value = "user")]
    pub level: StorageLevel,
}

impl Dump {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let store = stores
            .level(self.level)
            .ok_or_else(|| eyre::eyre!("storage level `{}` is unavailable", self.level))?;
        let document = store.read()?;
        msg_info.print(profile::render(&document)?);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct Diff {
    /// First profile.
    pub a: String,
    /// Second profile.
    pub b: String,
}

impl Diff {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let a = stores
            .get(&self.a)?
            .ok_or_else(|| ProfileError::NotFound(self.a.clone()))?;
        let b = stores
            .get(&self.b)?
            .ok_or_else(|| ProfileError::NotFound(self.b.clone()))?;
        for line in profile::diff(&a, &b) {
            msg_info.print(line);
        }
        Ok(())
    }
}
