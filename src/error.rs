use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

/// The operation that was underway when a spawn-time system error occurred.
///
/// `Pipe`, `Fork` and `Wait` are detected in the parent; the remaining steps
/// happen between fork and exec and are reported back by the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStep {
    /// Creating the status pipe or a stdio pipe.
    Pipe,
    /// Forking the child process.
    Fork,
    /// Opening /dev/null for a nulled stream.
    Null,
    /// Duplicating a descriptor onto stdin/stdout/stderr.
    Dup,
    /// Applying the requested process-creation flags.
    Flags,
    /// Replacing the child image with the target executable.
    Exec,
    /// Collecting the child's exit status.
    Wait,
}

impl SpawnStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnStep::Pipe => "pipe",
            SpawnStep::Fork => "fork",
            SpawnStep::Null => "null-open",
            SpawnStep::Dup => "dup",
            SpawnStep::Flags => "flags",
            SpawnStep::Exec => "exec",
            SpawnStep::Wait => "wait",
        }
    }
}

impl fmt::Display for SpawnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for subproc operations
#[derive(Error, Debug)]
pub enum SubprocError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Child process was already waited on")]
    AlreadyWaited,

    #[error("System error during {step}: {errno}")]
    System { step: SpawnStep, errno: Errno },
}

impl SubprocError {
    pub(crate) fn system(step: SpawnStep, errno: Errno) -> Self {
        SubprocError::System { step, errno }
    }

    /// Map the error onto the shell's spawn-failure exit conventions:
    /// 127 for a missing executable, 126 for any other exec failure,
    /// 2 for caller mistakes and 125 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            SubprocError::InvalidArguments(_) => 2,
            SubprocError::AlreadyWaited => 2,
            SubprocError::System {
                step: SpawnStep::Exec,
                errno: Errno::ENOENT,
            } => 127,
            SubprocError::System {
                step: SpawnStep::Exec,
                ..
            } => 126,
            SubprocError::System { .. } => 125,
        }
    }
}

/// Result type alias for subproc operations
pub type Result<T> = std::result::Result<T, SubprocError>;

impl From<SubprocError> for i32 {
    fn from(error: SubprocError) -> Self {
        error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_enoent_maps_to_command_not_found() {
        let err = SubprocError::system(SpawnStep::Exec, Errno::ENOENT);
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn exec_eacces_maps_to_not_executable() {
        let err = SubprocError::system(SpawnStep::Exec, Errno::EACCES);
        assert_eq!(err.exit_code(), 126);
    }

    #[test]
    fn usage_errors_map_to_two() {
        assert_eq!(SubprocError::InvalidArguments("empty".into()).exit_code(), 2);
        assert_eq!(SubprocError::AlreadyWaited.exit_code(), 2);
    }

    #[test]
    fn other_system_errors_map_to_generic_failure() {
        let err = SubprocError::system(SpawnStep::Fork, Errno::EAGAIN);
        assert_eq!(err.exit_code(), 125);
    }
}
