use std::ffi::CString;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execv, fork, ForkResult, Pid};

use crate::errpipe::{self, ErrorPipe};
use crate::error::{Result, SpawnStep, SubprocError};
use crate::stdio::{SpawnOptions, StdStream, StdioUse};

/// How a finished child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// True when the child exited normally with code zero.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Exit code for a normal exit, `None` for a signaled child.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    /// Terminating signal, `None` for a normal exit.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(*signal),
        }
    }
}

/// What the forked child does with one of its standard streams.
#[derive(Debug, Clone, Copy)]
enum ChildAction {
    Inherit,
    Null { oflag: OFlag },
    Dup { src: RawFd },
}

/// Pipe ends and per-stream actions prepared before forking.
struct StdioPlan {
    parent_ends: [Option<OwnedFd>; 3],
    child_ends: [Option<OwnedFd>; 3],
    actions: [ChildAction; 3],
}

fn prepare_stdio(opts: &SpawnOptions) -> Result<StdioPlan> {
    let mut plan = StdioPlan {
        parent_ends: [None, None, None],
        child_ends: [None, None, None],
        actions: [ChildAction::Inherit; 3],
    };
    for stream in StdStream::ALL {
        match opts.action(stream) {
            StdioUse::Inherit => {}
            StdioUse::Null => {
                plan.actions[stream.index()] = ChildAction::Null {
                    oflag: if stream.is_input() {
                        OFlag::O_RDONLY
                    } else {
                        OFlag::O_WRONLY
                    },
                };
            }
            StdioUse::Pipe => {
                let (read_end, write_end) = errpipe::cloexec_pipe()
                    .map_err(|e| SubprocError::system(SpawnStep::Pipe, e))?;
                // The parent writes into the child's stdin and reads from
                // its stdout/stderr.
                let (parent_end, child_end) = if stream.is_input() {
                    (write_end, read_end)
                } else {
                    (read_end, write_end)
                };
                plan.actions[stream.index()] = ChildAction::Dup {
                    src: child_end.as_raw_fd(),
                };
                plan.parent_ends[stream.index()] = Some(parent_end);
                plan.child_ends[stream.index()] = Some(child_end);
            }
        }
    }
    Ok(plan)
}

/// A spawned child process.
///
/// Holds the child's pid, the parent-side ends of any requested stdio
/// pipes, and whether the child has been waited on. Movable but not
/// clonable; dropping the handle closes the remaining pipe ends but does
/// not wait for the child.
#[derive(Debug)]
pub struct Subprocess {
    pid: Pid,
    pipes: [Option<OwnedFd>; 3],
    waited: bool,
}

impl Subprocess {
    /// Fork and exec `argv` under the given redirection policy.
    ///
    /// `argv[0]` must be the full path to the executable; no PATH search
    /// happens. The call only returns a handle once the child has
    /// successfully replaced its image: any failure between fork and exec
    /// is reported back over a close-on-exec status pipe, the failed child
    /// is reaped, and the error carries the failing step and errno.
    ///
    /// # Arguments
    /// * `argv` - Executable path followed by its arguments
    /// * `opts` - Per-stream redirection policy and process-creation flags
    ///
    /// # Returns
    /// A Subprocess handle on success
    pub fn spawn<S: AsRef<str>>(argv: &[S], opts: &SpawnOptions) -> Result<Subprocess> {
        if argv.is_empty() {
            return Err(SubprocError::InvalidArguments(
                "no command specified".to_string(),
            ));
        }

        // Everything the child needs is prepared before forking; after
        // fork only async-signal-safe calls happen on the child side.
        let argv_c = argv
            .iter()
            .map(|s| {
                CString::new(s.as_ref()).map_err(|e| {
                    SubprocError::InvalidArguments(format!(
                        "invalid argument '{}': {}",
                        s.as_ref(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<CString>>>()?;

        let StdioPlan {
            parent_ends,
            child_ends,
            actions,
        } = prepare_stdio(opts)?;
        let status_pipe = ErrorPipe::new()?;

        let mut close_in_child: [Option<RawFd>; 4] = [None, None, None, None];
        for (slot, fd) in close_in_child.iter_mut().zip(parent_ends.iter()) {
            *slot = fd.as_ref().map(|f| f.as_raw_fd());
        }
        close_in_child[3] = Some(status_pipe.parent_fd());
        let err_fd = status_pipe.child_fd();
        let flags = opts.flags();

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(child_ends);
                match status_pipe.read_verdict() {
                    Ok(None) => {
                        debug!("spawned child {} running {:?}", child, argv_c[0]);
                        Ok(Subprocess {
                            pid: child,
                            pipes: parent_ends,
                            waited: false,
                        })
                    }
                    Ok(Some(report)) => {
                        let _ = wait_for_exit(child);
                        debug!(
                            "child {} setup failed during {}: {}",
                            child, report.step, report.errno
                        );
                        Err(report.into_error())
                    }
                    Err(e) => {
                        // Without a verdict the child's fate is unknown;
                        // take it down so the failed spawn leaves nothing
                        // behind.
                        let _ = kill(child, Signal::SIGKILL);
                        let _ = wait_for_exit(child);
                        Err(e)
                    }
                }
            }
            Ok(ForkResult::Child) => run_child(&argv_c, &actions, &close_in_child, flags, err_fd),
            Err(e) => Err(SubprocError::system(SpawnStep::Fork, e)),
        }
    }

    /// Process identifier of the child.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent-side end of the child's stdin pipe, if stdin was piped.
    /// This is the write end: bytes written here reach the child.
    pub fn stdin_pipe(&self) -> Option<BorrowedFd<'_>> {
        self.stream_pipe(StdStream::Stdin)
    }

    /// Parent-side end of the child's stdout pipe, if stdout was piped.
    pub fn stdout_pipe(&self) -> Option<BorrowedFd<'_>> {
        self.stream_pipe(StdStream::Stdout)
    }

    /// Parent-side end of the child's stderr pipe, if stderr was piped.
    pub fn stderr_pipe(&self) -> Option<BorrowedFd<'_>> {
        self.stream_pipe(StdStream::Stderr)
    }

    fn stream_pipe(&self, stream: StdStream) -> Option<BorrowedFd<'_>> {
        self.pipes[stream.index()].as_ref().map(|fd| fd.as_fd())
    }

    /// Transfer ownership of a stream's parent-side pipe end out of the
    /// handle, e.g. to close the stdin end and deliver EOF, or to wrap an
    /// output end in a `std::fs::File`. Returns `None` when the stream was
    /// not piped or the end was already taken.
    pub fn take_pipe(&mut self, stream: StdStream) -> Option<OwnedFd> {
        self.pipes[stream.index()].take()
    }

    /// Block until the child terminates and collect how it went.
    ///
    /// The child can be waited on exactly once; a second call returns
    /// `AlreadyWaited` without blocking. Pipe ends held by the handle are
    /// not touched.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if self.waited {
            return Err(SubprocError::AlreadyWaited);
        }
        let status = wait_for_exit(self.pid)?;
        self.waited = true;
        Ok(status)
    }
}

/// Blocking waitpid with EINTR retry, mapped onto [`ExitStatus`].
fn wait_for_exit(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitStatus::Signaled(signal)),
            // Without WUNTRACED/WCONTINUED no other status is reported;
            // keep waiting for termination regardless.
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SubprocError::system(SpawnStep::Wait, e)),
        }
    }
}

/// Set up stdio and flags in the forked child, then exec.
///
/// Runs between fork and exec: only async-signal-safe calls, no
/// allocation, no logging. Every failure is reported through the status
/// pipe and ends the child; on success exec replaces the image and
/// close-on-exec delivers the empty verdict.
fn run_child(
    argv: &[CString],
    actions: &[ChildAction; 3],
    close_first: &[Option<RawFd>; 4],
    flags: CloneFlags,
    err_fd: RawFd,
) -> ! {
    // The parent's pipe ends must not survive in the child, or the
    // parent would never see EOF on them.
    for fd in close_first.iter().flatten() {
        let _ = close(*fd);
    }

    for stream in StdStream::ALL {
        let target = stream.target_fd();
        match actions[stream.index()] {
            ChildAction::Inherit => {}
            ChildAction::Null { oflag } => {
                let src = match open("/dev/null", oflag, Mode::empty()) {
                    Ok(fd) => fd,
                    Err(e) => errpipe::report_and_exit(err_fd, SpawnStep::Null, e),
                };
                if src != target {
                    if let Err(e) = dup2(src, target) {
                        errpipe::report_and_exit(err_fd, SpawnStep::Dup, e);
                    }
                    if src > 2 {
                        let _ = close(src);
                    }
                }
            }
            ChildAction::Dup { src } => {
                if src == target {
                    // Already on its target number; dup2 would be a no-op
                    // that leaves close-on-exec set, so clear the flag in
                    // place instead.
                    if let Err(e) = fcntl(src, FcntlArg::F_SETFD(FdFlag::empty())) {
                        errpipe::report_and_exit(err_fd, SpawnStep::Dup, e);
                    }
                } else if let Err(e) = dup2(src, target) {
                    errpipe::report_and_exit(err_fd, SpawnStep::Dup, e);
                }
            }
        }
    }

    // Installed streams are in place; drop the pipe originals. An original
    // inside the stdio range is either an installed target or already
    // overwritten, never close it.
    for stream in StdStream::ALL {
        if let ChildAction::Dup { src } = actions[stream.index()] {
            if src != stream.target_fd() && src > 2 {
                let _ = close(src);
            }
        }
    }

    if !flags.is_empty() {
        if let Err(e) = unshare(flags) {
            errpipe::report_and_exit(err_fd, SpawnStep::Flags, e);
        }
    }

    match execv(&argv[0], argv) {
        Ok(infallible) => match infallible {},
        Err(e) => errpipe::report_and_exit(err_fd, SpawnStep::Exec, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::WaitPidFlag;
    use serial_test::serial;
    use std::fs::File;
    use std::io::{Read, Write};

    fn read_all(fd: OwnedFd) -> String {
        let mut out = String::new();
        File::from(fd).read_to_string(&mut out).unwrap();
        out
    }

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    #[serial]
    fn captures_stdout_through_a_pipe() {
        let mut opts = SpawnOptions::new();
        opts.stdout(StdioUse::Pipe);
        let mut child = Subprocess::spawn(&["/bin/echo", "hello"], &opts).unwrap();

        assert!(child.stdout_pipe().is_some());
        assert!(child.stdin_pipe().is_none());
        assert!(child.stderr_pipe().is_none());

        let out = read_all(child.take_pipe(StdStream::Stdout).unwrap());
        assert_eq!(out, "hello\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    #[serial]
    fn feeds_stdin_through_a_pipe() {
        let mut opts = SpawnOptions::new();
        opts.stdin(StdioUse::Pipe).stdout(StdioUse::Pipe);
        let mut child = Subprocess::spawn(&["/bin/cat"], &opts).unwrap();

        let stdin = child.take_pipe(StdStream::Stdin).unwrap();
        let mut writer = File::from(stdin);
        writer.write_all(b"ping\n").unwrap();
        drop(writer); // EOF for cat

        let out = read_all(child.take_pipe(StdStream::Stdout).unwrap());
        assert_eq!(out, "ping\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    #[serial]
    fn piped_stdin_with_inherited_stdout_exits_cleanly() {
        let mut opts = SpawnOptions::new();
        opts.stdin(StdioUse::Pipe);
        let mut child = Subprocess::spawn(&["/bin/cat"], &opts).unwrap();

        // Closing the write end is the only signal cat gets.
        drop(child.take_pipe(StdStream::Stdin));
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    #[serial]
    fn empty_argv_is_rejected() {
        let result = Subprocess::spawn(&[] as &[&str], &SpawnOptions::new());
        assert!(matches!(result, Err(SubprocError::InvalidArguments(_))));
        // The precheck fires before fork, so there is no child to reap.
        let reap = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG));
        assert_eq!(reap, Err(Errno::ECHILD));
    }

    #[test]
    fn nul_bytes_in_argv_are_rejected() {
        let result = Subprocess::spawn(&["/bin/echo", "bad\0arg"], &SpawnOptions::new());
        assert!(matches!(result, Err(SubprocError::InvalidArguments(_))));
    }

    #[test]
    #[serial]
    fn missing_executable_reports_exec_step() {
        let result = Subprocess::spawn(&["/no/such/binary"], &SpawnOptions::new());
        match result {
            Err(SubprocError::System { step, errno }) => {
                assert_eq!(step, SpawnStep::Exec);
                assert_eq!(errno, Errno::ENOENT);
            }
            other => panic!("expected exec failure, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn failed_spawn_leaks_no_descriptors() {
        let mut opts = SpawnOptions::new();
        opts.stdin(StdioUse::Pipe)
            .stdout(StdioUse::Pipe)
            .stderr(StdioUse::Pipe);

        let before = open_fd_count();
        for _ in 0..3 {
            let result = Subprocess::spawn(&["/no/such/binary"], &opts);
            assert!(result.is_err());
        }
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    #[serial]
    fn spawn_failure_stays_visible_with_standard_streams_closed() {
        // A caller with fds 0-2 closed hands those numbers to freshly
        // created descriptors; a stream installed over one of them must
        // not swallow the child's failure report. Run the scenario in a
        // throwaway fork so the harness keeps its own stdio.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                for fd in 0..3 {
                    let _ = close(fd);
                }
                let mut opts = SpawnOptions::new();
                opts.stdout(StdioUse::Null);
                let code = match Subprocess::spawn(&["/no/such/binary"], &opts) {
                    Err(SubprocError::System {
                        step: SpawnStep::Exec,
                        errno: Errno::ENOENT,
                    }) => 0,
                    Err(_) => 1,
                    Ok(_) => 2,
                };
                unsafe { libc::_exit(code) };
            }
            Ok(ForkResult::Parent { child }) => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
            Err(e) => panic!("fork failed: {}", e),
        }
    }

    #[test]
    #[serial]
    fn double_wait_is_a_usage_error() {
        let mut opts = SpawnOptions::new();
        opts.stdout(StdioUse::Null);
        let mut child = Subprocess::spawn(&["/bin/echo", "once"], &opts).unwrap();

        assert!(child.wait().is_ok());
        assert!(matches!(child.wait(), Err(SubprocError::AlreadyWaited)));
    }

    #[test]
    #[serial]
    fn null_stdin_reads_eof() {
        let mut opts = SpawnOptions::new();
        opts.stdin(StdioUse::Null).stdout(StdioUse::Pipe);
        let mut child = Subprocess::spawn(&["/bin/cat"], &opts).unwrap();

        let out = read_all(child.take_pipe(StdStream::Stdout).unwrap());
        assert_eq!(out, "");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    #[serial]
    fn null_outputs_are_discarded() {
        let mut opts = SpawnOptions::new();
        opts.stdout(StdioUse::Null).stderr(StdioUse::Null);
        let mut child =
            Subprocess::spawn(&["/bin/sh", "-c", "echo out; echo err >&2"], &opts).unwrap();

        assert!(child.stdout_pipe().is_none());
        assert!(child.stderr_pipe().is_none());
        assert!(child.wait().unwrap().success());
    }

    #[test]
    #[serial]
    fn captures_stderr_through_a_pipe() {
        let mut opts = SpawnOptions::new();
        opts.stdout(StdioUse::Null).stderr(StdioUse::Pipe);
        let mut child = Subprocess::spawn(&["/bin/sh", "-c", "echo oops >&2"], &opts).unwrap();

        let out = read_all(child.take_pipe(StdStream::Stderr).unwrap());
        assert_eq!(out, "oops\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    #[serial]
    fn inherit_policy_exposes_no_pipes() {
        let mut child = Subprocess::spawn(&["/bin/sh", "-c", "exit 0"], &SpawnOptions::new())
            .unwrap();
        assert!(child.stdin_pipe().is_none());
        assert!(child.stdout_pipe().is_none());
        assert!(child.stderr_pipe().is_none());
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    #[serial]
    fn take_pipe_yields_each_end_once() {
        let mut opts = SpawnOptions::new();
        opts.stdout(StdioUse::Pipe);
        let mut child = Subprocess::spawn(&["/bin/echo", "x"], &opts).unwrap();

        let first = child.take_pipe(StdStream::Stdout);
        assert!(first.is_some());
        assert!(child.take_pipe(StdStream::Stdout).is_none());
        assert!(child.stdout_pipe().is_none());
        drop(first);
        assert!(child.wait().is_ok());
    }

    #[test]
    #[serial]
    fn one_policy_spawns_many_children() {
        let mut opts = SpawnOptions::new();
        opts.stdout(StdioUse::Pipe);

        for word in ["first", "second"] {
            let mut child = Subprocess::spawn(&["/bin/echo", word], &opts).unwrap();
            let out = read_all(child.take_pipe(StdStream::Stdout).unwrap());
            assert_eq!(out.trim_end(), word);
            assert!(child.wait().unwrap().success());
        }
    }

    #[test]
    #[serial]
    fn exit_code_is_propagated() {
        let mut child =
            Subprocess::spawn(&["/bin/sh", "-c", "exit 7"], &SpawnOptions::new()).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status, ExitStatus::Exited(7));
        assert!(!status.success());
        assert_eq!(status.code(), Some(7));
        assert_eq!(status.signal(), None);
    }

    #[test]
    #[serial]
    fn signaled_child_reports_the_signal() {
        let mut child =
            Subprocess::spawn(&["/bin/sh", "-c", "kill -KILL $$"], &SpawnOptions::new()).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status, ExitStatus::Signaled(Signal::SIGKILL));
        assert!(!status.success());
        assert_eq!(status.code(), None);
        assert_eq!(status.signal(), Some(Signal::SIGKILL));
    }

    #[test]
    #[serial]
    fn unshare_flags_reach_the_child() {
        let mut opts = SpawnOptions::new();
        opts.clone_with_flags(CloneFlags::CLONE_NEWUTS);
        match Subprocess::spawn(&["/bin/sh", "-c", "exit 0"], &opts) {
            Ok(mut child) => assert!(child.wait().unwrap().success()),
            // Unprivileged environments refuse namespace creation; the
            // failure must still come through tagged correctly.
            Err(SubprocError::System { step, .. }) => assert_eq!(step, SpawnStep::Flags),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
