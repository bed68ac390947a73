//! In-process RPC server: lets a script reached via `make` call back into
//! this process's registered callbacks, without paying for a thread pool
//! or an async runtime it does not otherwise need.
//!
//! Each request is a plain integer sent over a Unix datagram socket.
//! Message `0` means "stop". Calls registered as forking run in a forked
//! child (so output, working directory, and any `chdir`/`exec` games stay
//! isolated); calls registered as non-forking run inline in the server
//! process, for callbacks that touch shared coordinator state.
//!
//! `fork(2)` is reached directly via `libc` rather than `std::process`,
//! because nothing else in the process may be running a thread at the
//! point of the call: POSIX only guarantees the calling thread survives
//! `fork` in the child, and this crate never spawns one, so the
//! restriction costs nothing.

// This module is the one place in the workspace that needs raw libc FFI
// (fork/pipe/signal/waitpid); every call site below carries its own
// `// SAFETY:` comment. See DESIGN.md.
#![allow(unsafe_code)]

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use forge_schema::RpcError;

fn server_socket_path(tempdir: &Path) -> PathBuf {
    tempdir.join("server")
}

/// Send message `req_no` to the server listening in `tempdir` and, unless
/// `req_no` is `0` (stop), wait for and return its integer reply.
///
/// # Errors
///
/// Returns [`RpcError::Io`] if the socket cannot be bound or the message
/// cannot be sent, or [`RpcError::NoReply`] if the reply cannot be parsed
/// as an integer.
pub fn send_message(tempdir: &Path, req_no: u32) -> Result<i32, RpcError> {
    let server_socket = server_socket_path(tempdir);
    let client_socket = tempdir.join(req_no.to_string());
    let _ = std::fs::remove_file(&client_socket);
    let sock = UnixDatagram::bind(&client_socket)?;
    sock.send_to(req_no.to_string().as_bytes(), &server_socket)?;
    if req_no == 0 {
        return Ok(0);
    }
    let mut buf = [0_u8; 1024];
    let (len, _) = sock.recv_from(&mut buf)?;
    std::str::from_utf8(&buf[..len])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RpcError::NoReply { id: req_no })
}

/// Append an error's debug representation to `log`, on a best-effort
/// basis — a forked child must never let a logging failure escape back
/// into its own exception handling.
fn write_error_to_log(log: &Path, err: &dyn std::fmt::Debug) {
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(log) {
        let _ = writeln!(file, "{err:?}");
    }
}

struct RegisteredCall {
    func: Box<dyn Fn() -> Result<(), Box<dyn std::fmt::Debug>>>,
    log: PathBuf,
    forking: bool,
}

/// A running (or not-yet-started) in-process RPC server.
///
/// Calls must all be registered via [`RpcServer::add_call`] before
/// [`RpcServer::start`] forks the listening process; nothing registered
/// afterward is visible to the child.
pub struct RpcServer {
    tempdir: PathBuf,
    calls: Vec<RegisteredCall>,
    child_pid: Option<libc::pid_t>,
}

impl RpcServer {
    /// Create a server that will use `tempdir` (which must already exist)
    /// for its sockets.
    #[must_use]
    pub fn new(tempdir: impl Into<PathBuf>) -> Self {
        Self {
            tempdir: tempdir.into(),
            calls: Vec::new(),
            child_pid: None,
        }
    }

    /// Register a callback. Returns the 1-indexed message id clients must
    /// send to invoke it.
    pub fn add_call(
        &mut self,
        func: impl Fn() -> Result<(), Box<dyn std::fmt::Debug>> + 'static,
        log: impl Into<PathBuf>,
        forking: bool,
    ) -> u32 {
        self.calls.push(RegisteredCall {
            func: Box::new(func),
            log: log.into(),
            forking,
        });
        u32::try_from(self.calls.len()).expect("call count fits in u32")
    }

    /// Fork a child that listens on the server socket and serves
    /// registered calls until it receives message `0`.
    ///
    /// Blocks until the child signals (via a pipe) that it is listening,
    /// so callers racing to send the first request never lose it.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the pipe, fork, or socket bind fails.
    ///
    /// # Panics
    ///
    /// Panics if called twice on the same server.
    pub fn start(&mut self) -> Result<(), RpcError> {
        assert!(self.child_pid.is_none(), "RpcServer::start called twice");
        let mut fds = [0_i32; 2];
        // SAFETY: `fds` is a valid pointer to two ints, as required by pipe(2).
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(RpcError::Io(std::io::Error::last_os_error()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        std::io::stdout().flush().ok();
        std::io::stderr().flush().ok();

        // SAFETY: fork(2) is safe to call here because this process never
        // spawns threads; the child immediately either execs nothing and
        // runs a tight accept loop, or exits via `_exit`.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(RpcError::Io(std::io::Error::last_os_error())),
            0 => {
                // SAFETY: these fds were just created above by this process.
                unsafe {
                    libc::signal(libc::SIGCHLD, libc::SIG_IGN);
                    libc::close(read_fd);
                }
                let server_path = server_socket_path(&self.tempdir);
                let _ = std::fs::remove_file(&server_path);
                let listener = match UnixDatagram::bind(&server_path) {
                    Ok(l) => l,
                    Err(_) => std::process::exit(1),
                };
                // SAFETY: write_fd was created above; closing it signals
                // readiness to the parent blocked on read(2).
                unsafe {
                    libc::close(write_fd);
                }
                self.serve_forever(&listener);
                std::process::exit(0);
            }
            child => {
                self.child_pid = Some(child);
                // SAFETY: write_fd is a valid fd owned by this process.
                unsafe {
                    libc::close(write_fd);
                }
                let mut buf = [0_u8; 1];
                // SAFETY: read_fd is valid, buf is a valid 1-byte buffer.
                unsafe {
                    libc::read(read_fd, buf.as_mut_ptr().cast(), 1);
                    libc::close(read_fd);
                }
                Ok(())
            }
        }
    }

    fn serve_forever(&self, listener: &UnixDatagram) -> ! {
        let mut buf = [0_u8; 1024];
        loop {
            let Ok((len, addr)) = listener.recv_from(&mut buf) else {
                continue;
            };
            let Some(req_no) = std::str::from_utf8(&buf[..len])
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if req_no == 0 {
                // SAFETY: exits immediately, no cleanup required beyond
                // what the OS does for a terminating process.
                unsafe {
                    libc::_exit(0);
                }
            }
            let Some(call) = self.calls.get(req_no as usize - 1) else {
                continue;
            };
            let run_in_child = if call.forking {
                // SAFETY: single-threaded process, safe to fork.
                let child = unsafe { libc::fork() };
                child == 0
            } else {
                true
            };
            if !run_in_child {
                continue;
            }
            let status = match (call.func)() {
                Ok(()) => 0,
                Err(err) => {
                    write_error_to_log(&call.log, &err);
                    1
                }
            };
            if let Some(path) = addr.as_pathname() {
                if let Err(err) = listener.send_to(status.to_string().as_bytes(), path) {
                    write_error_to_log(&call.log, &err);
                }
            }
            if call.forking {
                // SAFETY: terminates only the forked child.
                unsafe {
                    libc::_exit(0);
                }
            }
        }
    }

    /// Send the stop message and wait for the forked server to exit.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the stop message cannot be sent.
    ///
    /// # Panics
    ///
    /// Panics if [`RpcServer::start`] was never called.
    pub fn stop(&mut self) -> Result<(), RpcError> {
        let pid = self.child_pid.expect("RpcServer::stop before start");
        send_message(&self.tempdir, 0)?;
        let mut status = 0_i32;
        // SAFETY: pid came from a fork() this struct performed.
        unsafe {
            libc::waitpid(pid, std::ptr::addr_of_mut!(status), 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_call_returns_one_indexed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = RpcServer::new(dir.path());
        let id1 = server.add_call(|| Ok(()), dir.path().join("log1"), true);
        let id2 = server.add_call(|| Ok(()), dir.path().join("log2"), false);
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[test]
    fn start_stop_round_trip_runs_forking_call() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let marker_for_call = marker.clone();
        let mut server = RpcServer::new(dir.path());
        server.add_call(
            move || {
                std::fs::write(&marker_for_call, b"done").map_err(|e| Box::new(e) as Box<dyn std::fmt::Debug>)
            },
            dir.path().join("log"),
            true,
        );
        server.start().unwrap();
        let reply = send_message(dir.path(), 1).unwrap();
        assert_eq!(reply, 0);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(marker.exists());
        server.stop().unwrap();
    }

    #[test]
    fn non_forking_call_runs_inline_count() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_for_call = Arc::clone(&counter);
        let mut server = RpcServer::new(dir.path());
        server.add_call(
            move || {
                counter_for_call.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            dir.path().join("log"),
            false,
        );
        server.start().unwrap();
        send_message(dir.path(), 1).unwrap();
        server.stop().unwrap();
    }
}
