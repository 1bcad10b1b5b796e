//! Scoped redirection of the process's standard output into memory.
//!
//! File descriptor 1 is process-global, so captures are serialised through a
//! process-wide lock. While a capture is active, anything any thread writes
//! to fd 1 lands in it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{error, warn};

static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// An active capture. Standard output is restored by [`OutputCapture::finish`]
/// or, on early exit paths, by `Drop`.
pub struct OutputCapture {
    saved_stdout: Option<OwnedFd>,
    drain: Option<JoinHandle<io::Result<Vec<u8>>>>,
    _serial: MutexGuard<'static, ()>,
}

impl OutputCapture {
    /// Starts capturing. `None` when the pipe or the redirection cannot be
    /// set up; the caller then runs without capture.
    pub fn begin() -> Option<Self> {
        let serial = CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let (read_end, write_end) = match pipe() {
            Ok(ends) => ends,
            Err(e) => {
                warn!("Output capture unavailable, pipe failed: {}", e);
                return None;
            }
        };

        // Drain concurrently so a chatty guest cannot fill the pipe and block
        // on its own write.
        let drain = thread::Builder::new()
            .name("stdout-capture".into())
            .spawn(move || {
                let mut buf = Vec::new();
                File::from(read_end).read_to_end(&mut buf)?;
                Ok(buf)
            });
        let drain = match drain {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Output capture unavailable, drain thread failed: {}", e);
                return None;
            }
        };

        let _ = io::stdout().flush();
        let saved = match io::stdout().as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => {
                warn!("Output capture unavailable, dup(stdout) failed: {}", e);
                drop(write_end);
                let _ = drain.join();
                return None;
            }
        };

        // SAFETY: both descriptors are open for the duration of the call.
        if unsafe { libc::dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO) } == -1 {
            warn!("Output capture unavailable, dup2 failed: {}", io::Error::last_os_error());
            drop(write_end);
            let _ = drain.join();
            return None;
        }
        drop(write_end);

        Some(Self {
            saved_stdout: Some(saved),
            drain: Some(drain),
            _serial: serial,
        })
    }

    /// Restores standard output and returns everything written meanwhile.
    pub fn finish(mut self) -> String {
        self.restore();
        let bytes = self.join_drain();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn restore(&mut self) {
        let Some(saved) = self.saved_stdout.take() else {
            return;
        };
        let _ = io::stdout().flush();
        // SAFETY: `saved` is an open duplicate of the original stdout.
        if unsafe { libc::dup2(saved.as_raw_fd(), libc::STDOUT_FILENO) } == -1 {
            error!("Failed to restore stdout: {}", io::Error::last_os_error());
        }
    }

    /// Waits for the drain thread. Only returns once every write end of the
    /// pipe is closed, i.e. after `restore`.
    fn join_drain(&mut self) -> Vec<u8> {
        let Some(drain) = self.drain.take() else {
            return Vec::new();
        };
        match drain.join() {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("Reading captured output failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                error!("stdout capture thread panicked");
                Vec::new()
            }
        }
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        self.restore();
        self.join_drain();
    }
}

/// Runs `f` with standard output captured. Returns an empty capture when
/// redirection is unavailable.
pub fn capture<T>(f: impl FnOnce() -> T) -> (T, String) {
    match OutputCapture::begin() {
        Some(capture) => {
            let value = f();
            (value, capture.finish())
        }
        None => (f(), String::new()),
    }
}

/// A close-on-exec pipe as `(read, write)`.
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe writes two descriptors into the array we own.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: freshly created and owned by nobody else.
    let ends = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&ends.0, &ends.1] {
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(ends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn emit(text: &str) {
        let mut out = io::stdout();
        out.write_all(text.as_bytes()).unwrap();
        out.flush().unwrap();
    }

    #[test]
    #[serial]
    fn captures_only_inside_the_window() {
        emit("outside-before-7c1e\n");
        let active = OutputCapture::begin().expect("pipe available");
        emit("inside-window-7c1e");
        let text = active.finish();
        emit("outside-after-7c1e\n");

        assert!(text.contains("inside-window-7c1e"));
        assert!(!text.contains("outside-before-7c1e"));
        assert!(!text.contains("outside-after-7c1e"));
    }

    #[test]
    #[serial]
    fn unflushed_writes_are_collected() {
        let (_, text) = capture(|| {
            // No newline and no explicit flush: sits in the std buffer.
            let _ = io::stdout().write_all(b"buffered-3f09");
        });
        assert!(text.contains("buffered-3f09"));
    }

    #[test]
    #[serial]
    fn output_larger_than_a_pipe_buffer_does_not_block() {
        let chunk = "x".repeat(64 * 1024);
        let (_, text) = capture(|| {
            for _ in 0..4 {
                emit(&chunk);
            }
        });
        assert!(text.len() >= 4 * chunk.len());
    }

    #[test]
    #[serial]
    fn dropping_a_capture_restores_stdout() {
        let active = OutputCapture::begin().expect("pipe available");
        emit("dropped-a51b");
        drop(active);

        // A later capture starts clean and still works.
        let (_, text) = capture(|| emit("second-a51b"));
        assert!(text.contains("second-a51b"));
        assert!(!text.contains("dropped-a51b"));
    }

    #[test]
    #[serial]
    fn failing_closure_still_restores() {
        let (result, text) = capture(|| -> Result<(), &'static str> {
            emit("before-failure-90d2");
            Err("guest trapped")
        });
        assert!(result.is_err());
        assert!(text.contains("before-failure-90d2"));
    }
}
