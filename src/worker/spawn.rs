//! Worker subprocess spawning.
//!
//! The protocol runs over a Unix socket pair. The child's end is installed at
//! fd [`IPC_FD`] so stdout and stderr stay free for user output.

use super::protocol::{IPC_FD, IPC_FD_ENV, WORKER_ID_ENV};
use crate::error::{FarmError, Result};
use crate::farm::config::ForkOptions;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Stdio;
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A freshly started worker process and the parent's ends of its channels.
pub(crate) struct Spawned {
    pub child: Child,
    pub ipc: UnixStream,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Start one worker process for slot `worker_id` (1-indexed).
pub(crate) fn spawn_worker(options: &ForkOptions, worker_id: usize) -> Result<Spawned> {
    let spawn_err = |message: String| FarmError::Spawn { worker_id, message };

    let exe_path = match &options.exec_path {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .map_err(|e| spawn_err(format!("Failed to get current executable: {}", e)))?,
    };

    let (parent_sock, child_sock) =
        StdUnixStream::pair().map_err(|e| spawn_err(format!("Failed to create socket: {}", e)))?;
    let child_fd = child_sock.as_raw_fd();

    let mut cmd = Command::new(&exe_path);
    cmd.args(&options.args);

    if !options.inherit_env {
        cmd.env_clear();
    }
    cmd.envs(&options.env);
    cmd.env(WORKER_ID_ENV, worker_id.to_string());
    cmd.env(IPC_FD_ENV, IPC_FD.to_string());

    if let Some(dir) = &options.cwd {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null());
    if options.silent {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    }
    cmd.kill_on_drop(true);

    // SAFETY: only async-signal-safe calls (dup2, fcntl) run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if child_fd == IPC_FD {
                // Already in place; just let it survive exec.
                if libc::fcntl(child_fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(child_fd, IPC_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        spawn_err(format!(
            "Failed to spawn '{}': {}",
            exe_path.display(),
            e
        ))
    })?;
    // The parent must not hold the child's end, or EOF would never arrive.
    drop(child_sock);

    parent_sock.set_nonblocking(true)?;
    let ipc = UnixStream::from_std(parent_sock)?;

    Ok(Spawned {
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child,
        ipc,
    })
}
