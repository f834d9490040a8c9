// Hot restart module
// Descriptor handoff to a replacement process and adoption of the inherited listener

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, getppid, Pid};
use socket2::{SockRef, Socket, Type};

use crate::error::GraceError;

/// Environment variable marking a process spawned by a restart.
pub const RESTART_ENV_KEY: &str = "_GRACE_RESTART";

/// Value of [`RESTART_ENV_KEY`] that requests descriptor inheritance.
pub const RESTART_ENV_VALUE: &str = "1";

/// Descriptor slot of the inherited listener: right after stdin, stdout, stderr.
pub const INHERITED_FD: RawFd = 3;

/// Whether this process was started by a restart and should inherit its listener.
pub fn restart_requested() -> bool {
    std::env::var_os(RESTART_ENV_KEY).is_some_and(|v| v == RESTART_ENV_VALUE)
}

/// `true` once the original parent has exited and init adopted this process.
pub fn parent_is_init() -> bool {
    getppid() == Pid::from_raw(1)
}

/// Ask `pid` to start draining (`SIGQUIT`).
pub fn notify_drain(pid: Pid) -> Result<(), GraceError> {
    kill(pid, Signal::SIGQUIT).map_err(|source| GraceError::Signal {
        pid: pid.as_raw(),
        source,
    })
}

/// Build the environment of a replacement process: every entry of `vars`
/// except stale restart markers, followed by exactly one fresh marker.
pub fn child_environment<I>(vars: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = vars
        .into_iter()
        .filter(|(key, _)| key != RESTART_ENV_KEY)
        .collect();
    env.push((RESTART_ENV_KEY.into(), RESTART_ENV_VALUE.into()));
    env
}

/// Locate an executable the way a shell would.
///
/// A name containing `/` is used as given (relative to the working
/// directory); anything else is searched in `PATH`. The path is not
/// canonicalised, so a symlink that was repointed to a new binary is
/// followed at spawn time.
pub fn look_path(name: &Path) -> Result<PathBuf, GraceError> {
    let not_found = |source: io::Error| GraceError::Executable {
        name: name.to_path_buf(),
        source,
    };

    if name.as_os_str().as_bytes().contains(&b'/') {
        return check_executable(name)
            .map(|()| name.to_path_buf())
            .map_err(not_found);
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                Path::new(".").join(name)
            } else {
                dir.join(name)
            }
        })
        .find(|candidate| check_executable(candidate).is_ok())
        .ok_or_else(|| {
            not_found(io::Error::new(
                io::ErrorKind::NotFound,
                "executable file not found in $PATH",
            ))
        })
}

fn check_executable(path: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_dir() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "not an executable file",
        ));
    }
    Ok(())
}

/// Everything a replacement process receives.
#[derive(Debug)]
pub struct Relaunch {
    pub program: PathBuf,
    /// Full argument vector, `args[0]` included.
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub cwd: PathBuf,
    /// Placed at [`INHERITED_FD`] in the child.
    pub listener_fd: OwnedFd,
}

impl Relaunch {
    /// Describe a copy of the current process carrying `listener_fd`.
    pub fn current(listener_fd: OwnedFd) -> Result<Self, GraceError> {
        Self::with_args(listener_fd, std::env::args_os().collect())
    }

    /// Like [`Relaunch::current`], but start `args` instead of this process's
    /// own command line. `args[0]` is resolved the same way.
    pub fn with_args(listener_fd: OwnedFd, args: Vec<OsString>) -> Result<Self, GraceError> {
        let argv0 = args.first().cloned().unwrap_or_default();
        let program = match look_path(Path::new(&argv0)) {
            Ok(program) => program,
            Err(err) => {
                tracing::warn!(error = %err, "argv[0] lookup failed, using current_exe");
                std::env::current_exe().map_err(|source| GraceError::Executable {
                    name: PathBuf::from(&argv0),
                    source,
                })?
            }
        };
        let cwd = std::env::current_dir()?;
        let env = child_environment(std::env::vars_os());

        Ok(Self {
            program,
            args,
            env,
            cwd,
            listener_fd,
        })
    }

    /// Start the replacement process with descriptors `[stdin, stdout,
    /// stderr, listener]` and return its pid. The child is not waited for.
    pub fn spawn(self) -> Result<u32, GraceError> {
        let mut command = Command::new(&self.program);
        if let Some((argv0, rest)) = self.args.split_first() {
            command.arg0(argv0).args(rest);
        }
        command
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())))
            .current_dir(&self.cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        install_inherited_fd(&mut command, self.listener_fd.as_raw_fd());

        let child = command.spawn().map_err(|source| GraceError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        Ok(child.id())
    }
}

#[allow(unsafe_code)]
fn install_inherited_fd(command: &mut Command, source_fd: RawFd) {
    // SAFETY: the closure runs between fork and exec and only issues dup2 and
    // fcntl, both async-signal-safe. `source_fd` stays open until `spawn`
    // returns because the owning `Relaunch` outlives the call.
    unsafe {
        command.pre_exec(move || place_inherited_fd(source_fd));
    }
}

fn place_inherited_fd(source_fd: RawFd) -> io::Result<()> {
    if source_fd == INHERITED_FD {
        // dup2 onto itself keeps FD_CLOEXEC, clear it explicitly
        fcntl(INHERITED_FD, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        dup2(source_fd, INHERITED_FD)?;
    }
    Ok(())
}

/// Adopt a listening TCP socket passed down at descriptor `fd`.
///
/// The slot is only taken over after it has been checked to be a stream
/// socket with an IP address (and, on Linux, in listening state), so a
/// stray descriptor is never closed by mistake. The socket is duplicated and
/// the original slot closed, leaving `fd` free for reuse.
pub fn inherit_from_fd(fd: RawFd) -> Result<std::net::TcpListener, GraceError> {
    let inherit_err = |reason: String| GraceError::Inherit { fd, reason };

    if fd < 0 || fcntl(fd, FcntlArg::F_GETFD).is_err() {
        return Err(inherit_err("descriptor is not open".to_string()));
    }

    let borrowed = borrow_open_fd(fd);
    validate_listener(borrowed).map_err(inherit_err)?;

    let duplicate = borrowed
        .try_clone_to_owned()
        .map_err(|e| inherit_err(format!("dup failed: {e}")))?;
    drop(claim_fd(fd));

    let socket = Socket::from(duplicate);
    socket
        .set_nonblocking(true)
        .map_err(|e| inherit_err(format!("set_nonblocking failed: {e}")))?;
    Ok(socket.into())
}

#[allow(unsafe_code)]
fn borrow_open_fd<'fd>(fd: RawFd) -> BorrowedFd<'fd> {
    // SAFETY: callers checked with F_GETFD that `fd` is open; it is closed
    // only through `claim_fd` after the last use of the borrow.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

#[allow(unsafe_code)]
fn claim_fd(fd: RawFd) -> OwnedFd {
    // SAFETY: the slot holds a validated inherited listener that nothing else
    // in this process owns.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn validate_listener(fd: BorrowedFd<'_>) -> Result<(), String> {
    let sock = SockRef::from(&fd);

    let ty = sock.r#type().map_err(|e| format!("not a socket: {e}"))?;
    if ty != Type::STREAM {
        return Err("not a stream socket".to_string());
    }

    let local = sock
        .local_addr()
        .map_err(|e| format!("no local address: {e}"))?;
    if local.as_socket().is_none() {
        return Err("not an IP socket".to_string());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use nix::sys::socket::{getsockopt, sockopt};
        let listening = getsockopt(&fd.as_fd(), sockopt::AcceptConn)
            .map_err(|e| format!("SO_ACCEPTCONN query failed: {e}"))?;
        if !listening {
            return Err("socket is not listening".to_string());
        }
    }

    Ok(())
}

/// Marker entries in an environment listing (test helper and diagnostics).
pub fn count_markers<'a, I>(env: I) -> usize
where
    I: IntoIterator<Item = &'a (OsString, OsString)>,
{
    env.into_iter()
        .filter(|(key, _)| key.as_os_str() == OsStr::new(RESTART_ENV_KEY))
        .count()
}
