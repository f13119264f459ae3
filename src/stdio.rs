use std::os::unix::io::RawFd;

use nix::sched::CloneFlags;

/// The three standard streams a spawn policy can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    pub(crate) const ALL: [StdStream; 3] =
        [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr];

    pub(crate) fn index(self) -> usize {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }

    /// Descriptor number the stream occupies in the child.
    pub(crate) fn target_fd(self) -> RawFd {
        self.index() as RawFd
    }

    /// Whether bytes flow from the parent into the child on this stream.
    /// Stdin is the only input stream; stdout and stderr carry output.
    pub(crate) fn is_input(self) -> bool {
        matches!(self, StdStream::Stdin)
    }
}

/// What to do with one standard stream in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioUse {
    /// Leave the stream attached to whatever the parent has there.
    #[default]
    Inherit,
    /// Attach the stream to /dev/null.
    Null,
    /// Attach the stream to a fresh pipe whose other end the parent keeps.
    Pipe,
}

/// Redirection policy and process-creation flags for a spawn.
///
/// This is pure configuration: it holds no descriptors and performs no I/O,
/// so one value can be cloned or reused across any number of spawns. Pipes
/// for `Pipe` streams are created by [`crate::Subprocess::spawn`] each time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    streams: [StdioUse; 3],
    clone_flags: CloneFlags,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        SpawnOptions {
            streams: [StdioUse::Inherit; 3],
            clone_flags: CloneFlags::empty(),
        }
    }
}

impl SpawnOptions {
    /// Policy that inherits all three streams and sets no flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the action for the child's stdin. A later call overwrites an
    /// earlier one.
    pub fn stdin(&mut self, action: StdioUse) -> &mut Self {
        self.streams[StdStream::Stdin.index()] = action;
        self
    }

    /// Set the action for the child's stdout. A later call overwrites an
    /// earlier one.
    pub fn stdout(&mut self, action: StdioUse) -> &mut Self {
        self.streams[StdStream::Stdout.index()] = action;
        self
    }

    /// Set the action for the child's stderr. A later call overwrites an
    /// earlier one.
    pub fn stderr(&mut self, action: StdioUse) -> &mut Self {
        self.streams[StdStream::Stderr.index()] = action;
        self
    }

    /// Flags to apply in the child before exec, typically namespace
    /// isolation bits such as `CLONE_NEWPID`. The flags are forwarded to
    /// the kernel uninterpreted.
    pub fn clone_with_flags(&mut self, flags: CloneFlags) -> &mut Self {
        self.clone_flags = flags;
        self
    }

    pub(crate) fn action(&self, stream: StdStream) -> StdioUse {
        self.streams[stream.index()]
    }

    pub(crate) fn flags(&self) -> CloneFlags {
        self.clone_flags
    }
}
