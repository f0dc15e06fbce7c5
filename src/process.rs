//! Detached process spawning
//!
//! The daemon, the media player and the fallback application are all started
//! as independent processes with no ties to the parent's lifetime.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from spawning external processes
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Empty command line for {0}")]
    EmptyCommand(&'static str),

    #[error("Program '{0}' not found")]
    NotFound(String),

    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A program plus its leading arguments, as configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Split a configured `[program, args...]` list; `purpose` names it in errors
    pub fn from_config(parts: &[String], purpose: &'static str) -> Result<Self, LaunchError> {
        let (program, args) = parts
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or(LaunchError::EmptyCommand(purpose))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Append trailing arguments
    pub fn with_args<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(extra.into_iter().map(Into::into));
        self
    }
}

/// Starts processes that outlive their parent
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn `command` detached and return its pid
    fn spawn_detached(&self, command: &CommandLine) -> Result<u32, LaunchError>;
}

/// Spawns real OS processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessSupervisor for SystemProcesses {
    fn spawn_detached(&self, command: &CommandLine) -> Result<u32, LaunchError> {
        debug!("Spawning {} {:?}", command.program, command.args);

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    LaunchError::NotFound(command.program.clone())
                } else {
                    LaunchError::SpawnFailed {
                        program: command.program.clone(),
                        source: e,
                    }
                }
            })?;

        let pid = child.id();
        info!("Started {} with PID {}", command.program, pid);

        // Reap the child when it exits so a long-running daemon doesn't collect zombies
        let mut child = child;
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(pid)
    }
}

/// Records spawn requests instead of running anything
#[derive(Debug, Default)]
pub struct RecordingProcesses {
    spawned: Mutex<Vec<CommandLine>>,
}

impl RecordingProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands spawned so far, in order
    pub fn spawned(&self) -> Vec<CommandLine> {
        self.spawned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl ProcessSupervisor for RecordingProcesses {
    fn spawn_detached(&self, command: &CommandLine) -> Result<u32, LaunchError> {
        let mut spawned = self
            .spawned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        spawned.push(command.clone());
        Ok(10_000 + spawned.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_line_from_config() {
        let cmd = CommandLine::from_config(&parts(&["mpv", "--no-terminal"]), "playback").unwrap();
        assert_eq!(cmd.program, "mpv");
        assert_eq!(cmd.args, vec!["--no-terminal"]);

        let cmd = cmd.with_args(["http://localhost:1/stream?f=x"]);
        assert_eq!(cmd.args.len(), 2);
    }

    #[test]
    fn test_empty_command_line() {
        assert!(matches!(
            CommandLine::from_config(&[], "fallback"),
            Err(LaunchError::EmptyCommand("fallback"))
        ));
        assert!(matches!(
            CommandLine::from_config(&parts(&[" "]), "playback"),
            Err(LaunchError::EmptyCommand("playback"))
        ));
    }

    #[test]
    fn test_missing_program() {
        let cmd = CommandLine::from_config(&parts(&["tori-definitely-not-installed"]), "playback")
            .unwrap();
        let result = SystemProcesses.spawn_detached(&cmd);
        assert!(matches!(result, Err(LaunchError::NotFound(_))));
    }

    #[test]
    fn test_recording_processes() {
        let recorder = RecordingProcesses::new();
        let cmd = CommandLine::from_config(&parts(&["vlc"]), "playback").unwrap();
        let pid = recorder.spawn_detached(&cmd).unwrap();
        assert!(pid > 0);
        assert_eq!(recorder.spawned(), vec![cmd]);
    }
}
