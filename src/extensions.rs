use std::borrow::Cow;
use std::fmt;
use std::process::{Command, ExitStatus, Output};

use crate::errors::*;
use crate::shell::MessageInfo;

pub trait CommandExt {
    fn print_command(&self) -> String;

    fn status_result(&self, status: ExitStatus) -> Result<(), CommandError>;

    /// Runs the command to completion, attached to the parent's stdio.
    fn run(&mut self, msg_info: &mut MessageInfo) -> Result<()>;

    /// Runs the command to completion and returns its exit status.
    fn run_and_get_status(&mut self, msg_info: &mut MessageInfo) -> Result<ExitStatus>;

    /// Runs the command and returns its stdout.
    fn run_and_get_stdout(&mut self, msg_info: &mut MessageInfo) -> Result<String>;

    /// Runs the command and returns the full output, captured.
    fn run_and_get_output(&mut self, msg_info: &mut MessageInfo) -> Result<Output>;
}

impl CommandExt for Command {
    fn print_command(&self) -> String {
        let mut s = escape(self.get_program().to_string_lossy()).into_owned();
        for arg in self.get_args() {
            s.push(' ');
            s.push_str(&escape(arg.to_string_lossy()));
        }
        s
    }

    fn status_result(&self, status: ExitStatus) -> Result<(), CommandError> {
        if status.success() {
            Ok(())
        } else {
            Err(CommandError::NonZeroExitCode(status, self.print_command()))
        }
    }

    fn run(&mut self, msg_info: &mut MessageInfo) -> Result<()> {
        let status = self.run_and_get_status(msg_info)?;
        self.status_result(status).map_err(Into::into)
    }

    fn run_and_get_status(&mut self, msg_info: &mut MessageInfo) -> Result<ExitStatus> {
        msg_info.debug(format!("+ {}", self.print_command()));
        self.status()
            .map_err(|e| CommandError::CouldNotExecute(Box::new(e), self.print_command()))
            .map_err(Into::into)
    }

    fn run_and_get_stdout(&mut self, msg_info: &mut MessageInfo) -> Result<String> {
        let output = self.run_and_get_output(msg_info)?;
        self.status_result(output.status)?;
        String::from_utf8(output.stdout.clone())
            .map_err(|e| CommandError::Utf8Error(e, output))
            .map_err(Into::into)
    }

    fn run_and_get_output(&mut self, msg_info: &mut MessageInfo) -> Result<Output> {
        msg_info.debug(format!("+ {}", self.print_command()));
        self.output()
            .map_err(|e| CommandError::CouldNotExecute(Box::new(e), self.print_command()))
            .map_err(Into::into)
    }
}

fn escape(arg: Cow<'_, str>) -> Cow<'_, str> {
    shell_escape::escape(arg)
}

/// A command that formats itself as a copy-pastable shell line.
#[derive(Debug, Clone)]
pub struct SafeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SafeCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        SafeCommand {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }
}

impl fmt::Display for SafeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape(Cow::from(&self.program)))?;
        for arg in &self.args {
            f.write_str(" ")?;
            f.write_str(&escape(Cow::from(arg)))?;
        }
        Ok(())
    }
}

impl From<SafeCommand> for Command {
    fn from(s: SafeCommand) -> Self {
        let mut cmd = Command::new(&s.program);
        cmd.args(&s.args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_command_display_quotes() {
        let mut cmd = SafeCommand::new("mpirun");
        cmd.args(["-n", "4", "a.out", "arg with space"]);
        assert_eq!(cmd.to_string(), "mpirun -n 4 a.out 'arg with space'");
    }

    #[test]
    fn status_result_reports_command() {
        let mut cmd = Command::new("false");
        cmd.arg("--flag");
        let mut msg_info = MessageInfo::default();
        let status = cmd.run_and_get_status(&mut msg_info).unwrap();
        let err = cmd.status_result(status).unwrap_err();
        assert!(err.to_string().contains("false --flag"));
    }
}
