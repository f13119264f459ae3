use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe2, read, write};

use crate::error::{Result, SpawnStep, SubprocError};

/// Exit code for a child whose setup failed before exec. The parent learns
/// the real cause from the status pipe, not from this code.
const CHILD_SETUP_EXIT: i32 = 127;

/// One record sent by the child when a setup step fails: which step, and
/// the errno it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FailureReport {
    pub(crate) step: SpawnStep,
    pub(crate) errno: Errno,
}

impl FailureReport {
    pub(crate) const WIRE_LEN: usize = 5;

    pub(crate) fn new(step: SpawnStep, errno: Errno) -> Self {
        FailureReport { step, errno }
    }

    /// One tag byte followed by the errno as a little-endian i32.
    pub(crate) fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0] = step_code(self.step);
        buf[1..].copy_from_slice(&(self.errno as i32).to_le_bytes());
        buf
    }

    /// Decode a non-empty payload. A truncated record or an unknown tag is
    /// treated as a failed exec with EPROTO; our own writer never produces
    /// either, so this only defines behavior for a corrupted channel.
    pub(crate) fn decode(buf: &[u8]) -> FailureReport {
        if buf.len() == Self::WIRE_LEN {
            if let Some(step) = step_from_code(buf[0]) {
                let raw = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                return FailureReport {
                    step,
                    errno: Errno::from_raw(raw),
                };
            }
        }
        FailureReport {
            step: SpawnStep::Exec,
            errno: Errno::EPROTO,
        }
    }

    pub(crate) fn into_error(self) -> SubprocError {
        SubprocError::System {
            step: self.step,
            errno: self.errno,
        }
    }
}

fn step_code(step: SpawnStep) -> u8 {
    match step {
        SpawnStep::Null => 1,
        SpawnStep::Dup => 2,
        SpawnStep::Flags => 3,
        SpawnStep::Exec => 4,
        // Parent-detected steps never cross the pipe but still encode, so
        // the wire mapping is total.
        SpawnStep::Pipe => 5,
        SpawnStep::Fork => 6,
        SpawnStep::Wait => 7,
    }
}

fn step_from_code(code: u8) -> Option<SpawnStep> {
    match code {
        1 => Some(SpawnStep::Null),
        2 => Some(SpawnStep::Dup),
        3 => Some(SpawnStep::Flags),
        4 => Some(SpawnStep::Exec),
        5 => Some(SpawnStep::Pipe),
        6 => Some(SpawnStep::Fork),
        7 => Some(SpawnStep::Wait),
        _ => None,
    }
}

/// Close-on-exec pipe over which the forked child reports setup failures.
///
/// Created before fork; both processes then hold both ends. The child keeps
/// only the raw write end and the parent drops its copy of the write end
/// before reading, so a successful exec closes the last writer and the
/// parent sees EOF with no payload.
pub(crate) struct ErrorPipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl ErrorPipe {
    pub(crate) fn new() -> Result<ErrorPipe> {
        let (read_end, write_end) =
            cloexec_pipe().map_err(|e| SubprocError::system(SpawnStep::Pipe, e))?;
        Ok(ErrorPipe {
            read_end,
            write_end,
        })
    }

    /// Raw write end for the forked child. The child must not touch the
    /// owned ends; it reports through this descriptor or lets exec close it.
    pub(crate) fn child_fd(&self) -> RawFd {
        self.write_end.as_raw_fd()
    }

    /// Raw read end, which belongs to the parent. The forked child closes
    /// its copy of this descriptor right after fork.
    pub(crate) fn parent_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Parent side: give up the local write end, then read the child's
    /// verdict. `None` means the pipe closed without a payload, i.e. exec
    /// succeeded.
    pub(crate) fn read_verdict(self) -> Result<Option<FailureReport>> {
        drop(self.write_end);
        let mut buf = [0u8; FailureReport::WIRE_LEN];
        let mut filled = 0;
        while filled < buf.len() {
            match read(self.read_end.as_raw_fd(), &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SubprocError::system(SpawnStep::Pipe, e)),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        Ok(Some(FailureReport::decode(&buf[..filled])))
    }
}

/// Create a close-on-exec pipe with both ends outside the standard
/// stream range.
///
/// A caller with one of fds 0-2 closed would otherwise receive pipe ends
/// on those numbers, and the forked child's dup2 onto a standard fd
/// would overwrite a live pipe end instead of an empty slot. Ends that
/// land in the range are moved at creation, so the child only ever
/// duplicates from above it.
pub(crate) fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((above_stdio(read_end)?, above_stdio(write_end)?))
}

fn above_stdio(fd: OwnedFd) -> nix::Result<OwnedFd> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    let moved = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))?;
    // `fd` drops on return, closing the low original.
    Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

/// Report a setup failure from the forked child and terminate it.
///
/// Only async-signal-safe operations: the record is assembled on the stack
/// and written to the raw descriptor with EINTR retry. A write error cannot
/// be reported anywhere, so the child just exits and the parent will see a
/// truncated or empty payload.
pub(crate) fn report_and_exit(fd: RawFd, step: SpawnStep, errno: Errno) -> ! {
    let buf = FailureReport::new(step, errno).encode();
    let pipe = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut written = 0;
    while written < buf.len() {
        match write(pipe, &buf[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    unsafe { libc::_exit(CHILD_SETUP_EXIT) }
}
