//! Modify command parsing.
//!
//! The command surface is a single `modify` command with a sub-command
//! name and free-form arguments, which this module turns into a typed
//! request for the coordinator.

use std::fmt;

use crate::error::{ModifyError, ModifyResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyCommand {
    Pause { role: String },
    Resume { role: String },
    Trigger { source_role: String, target_role: String },
    Insert { after_role: String },
    Grow { role: String },
    Restart { role: String },
    Describe,
}

/// A command name and its arguments, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyOptions {
    pub command: String,
    pub args: Vec<String>,
}

impl ModifyOptions {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
        }
    }

    pub fn parse(&self) -> ModifyResult<ModifyCommand> {
        let arg = |n: usize, command: &'static str, name: &'static str| {
            self.args
                .get(n)
                .cloned()
                .ok_or(ModifyError::MissingArgument { command, arg: name })
        };
        match self.command.to_ascii_lowercase().as_str() {
            "pause" => Ok(ModifyCommand::Pause {
                role: arg(0, "pause", "role")?,
            }),
            "resume" => Ok(ModifyCommand::Resume {
                role: arg(0, "resume", "role")?,
            }),
            "trigger" => Ok(ModifyCommand::Trigger {
                source_role: arg(0, "trigger", "source-role")?,
                target_role: arg(1, "trigger", "target-role")?,
            }),
            "insert" => Ok(ModifyCommand::Insert {
                after_role: arg(0, "insert", "after-role")?,
            }),
            "grow" => Ok(ModifyCommand::Grow {
                role: arg(0, "grow", "role")?,
            }),
            "restart" => Ok(ModifyCommand::Restart {
                role: arg(0, "restart", "role")?,
            }),
            "describe" => Ok(ModifyCommand::Describe),
            _ => Err(ModifyError::UnknownCommand(self.command.clone())),
        }
    }
}

impl fmt::Display for ModifyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifyCommand::Pause { role } => write!(f, "pause {role}"),
            ModifyCommand::Resume { role } => write!(f, "resume {role}"),
            ModifyCommand::Trigger {
                source_role,
                target_role,
            } => write!(f, "trigger {source_role} -> {target_role}"),
            ModifyCommand::Insert { after_role } => write!(f, "insert after {after_role}"),
            ModifyCommand::Grow { role } => write!(f, "grow {role}"),
            ModifyCommand::Restart { role } => write!(f, "restart {role}"),
            ModifyCommand::Describe => f.write_str("describe"),
        }
    }
}
