// Platform-specific compilation guard
#[cfg(not(target_os = "linux"))]
compile_error!("subproc requires Linux: it spawns with fork/exec and applies \
                clone-style namespace flags, which other platforms lack.");

#[cfg(target_os = "linux")]
pub mod cli;
#[cfg(target_os = "linux")]
mod errpipe;
#[cfg(target_os = "linux")]
pub mod error;
#[cfg(target_os = "linux")]
pub mod process;
#[cfg(target_os = "linux")]
pub mod stdio;

#[cfg(target_os = "linux")]
pub use error::{Result, SpawnStep, SubprocError};
#[cfg(target_os = "linux")]
pub use process::{ExitStatus, Subprocess};
#[cfg(target_os = "linux")]
pub use stdio::{SpawnOptions, StdStream, StdioUse};

// The flag and signal types that appear in the public API.
#[cfg(target_os = "linux")]
pub use nix::sched::CloneFlags;
#[cfg(target_os = "linux")]
pub use nix::sys::signal::Signal;
#[cfg(target_os = "linux")]
pub use nix::unistd::Pid;
