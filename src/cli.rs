use clap::{Parser, ValueEnum};
use nix::sched::CloneFlags;

use crate::error::{Result, SubprocError};
use crate::stdio::{SpawnOptions, StdioUse};

/// How the runner wires one of the child's standard streams.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPolicy {
    /// Share the runner's own stream
    Inherit,
    /// Attach the stream to /dev/null
    Null,
    /// Pipe the stream through the runner
    Pipe,
}

impl From<StreamPolicy> for StdioUse {
    fn from(policy: StreamPolicy) -> Self {
        match policy {
            StreamPolicy::Inherit => StdioUse::Inherit,
            StreamPolicy::Null => StdioUse::Null,
            StreamPolicy::Pipe => StdioUse::Pipe,
        }
    }
}

/// Namespace kinds the child can be unshared into before it starts.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Pid,
    Mount,
    Net,
    Ipc,
    Uts,
    User,
}

impl Namespace {
    pub fn flag(self) -> CloneFlags {
        match self {
            Namespace::Pid => CloneFlags::CLONE_NEWPID,
            Namespace::Mount => CloneFlags::CLONE_NEWNS,
            Namespace::Net => CloneFlags::CLONE_NEWNET,
            Namespace::Ipc => CloneFlags::CLONE_NEWIPC,
            Namespace::Uts => CloneFlags::CLONE_NEWUTS,
            Namespace::User => CloneFlags::CLONE_NEWUSER,
        }
    }
}

/// subproc - run a command with explicit stdio wiring
///
/// Spawns an executable with each standard stream either inherited,
/// silenced with /dev/null, or piped through this process, optionally
/// inside freshly unshared namespaces.
#[derive(Parser, Debug)]
#[command(
    name = "subproc",
    version = "0.1.0",
    about = "Run a command with per-stream stdio redirection",
    long_about = "Runs an executable given by full path. Each standard stream can be\n\
                  inherited from this process, attached to /dev/null, or piped back\n\
                  through it; the child can also be unshared into fresh namespaces\n\
                  before it starts. Failures between fork and exec are reported with\n\
                  the failing step and OS error instead of a silent dead child."
)]
pub struct Cli {
    /// What to do with the child's stdin
    #[arg(long = "stdin", value_name = "policy", value_enum, default_value = "inherit")]
    pub stdin: StreamPolicy,

    /// What to do with the child's stdout
    #[arg(long = "stdout", value_name = "policy", value_enum, default_value = "inherit")]
    pub stdout: StreamPolicy,

    /// What to do with the child's stderr
    #[arg(long = "stderr", value_name = "policy", value_enum, default_value = "inherit")]
    pub stderr: StreamPolicy,

    /// Comma-separated namespaces to unshare the child into
    #[arg(
        short = 'n',
        long = "unshare",
        value_name = "ns",
        value_enum,
        value_delimiter = ','
    )]
    pub unshare: Vec<Namespace>,

    /// Command and its arguments to execute (full path, no PATH search)
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Validate the parsed arguments
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(SubprocError::InvalidArguments(
                "no command specified".to_string(),
            ));
        }
        Ok(())
    }

    /// Spawn policy corresponding to the parsed flags.
    pub fn spawn_options(&self) -> SpawnOptions {
        let mut opts = SpawnOptions::new();
        opts.stdin(self.stdin.into())
            .stdout(self.stdout.into())
            .stderr(self.stderr.into())
            .clone_with_flags(self.clone_flags());
        opts
    }

    fn clone_flags(&self) -> CloneFlags {
        self.unshare
            .iter()
            .fold(CloneFlags::empty(), |acc, ns| acc | ns.flag())
    }
}
