//! Tunnel descriptor handoff
//!
//! Once the tunnel is active on a non-sponsored session, its descriptor
//! is handed to the externally running proxying engine over a local
//! socket: one marker byte plus the descriptor as ancillary data, no
//! response. The engine may not have finished starting up yet, so
//! connection failures are retried with exponential backoff before they
//! become fatal. The send is re-invokable with the same descriptor when a
//! supervisor restarts the engine process.

use super::{VpnError, VpnResult};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::io::IoSlice;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Marker byte prefixing the descriptor
pub const HANDOFF_MARKER: u8 = 42;

/// First retry delay; doubles per attempt
const HANDOFF_BASE_DELAY: Duration = Duration::from_millis(50);

/// Attempts 0..=5; a sixth failure is fatal
const HANDOFF_MAX_ATTEMPTS: u32 = 6;

/// Hand the tunnel descriptor to the engine at `path` with the standard
/// backoff schedule (50, 100, 200, 400, 800, 1600 ms).
pub fn send_fd(path: &Path, fd: BorrowedFd<'_>) -> VpnResult<()> {
    send_fd_with_backoff(path, fd, HANDOFF_BASE_DELAY)
}

/// Backoff schedule with a caller-chosen base delay. Delay precedes every
/// attempt, including the first, to give a freshly spawned engine time to
/// bind its socket.
pub fn send_fd_with_backoff(path: &Path, fd: BorrowedFd<'_>, base: Duration) -> VpnResult<()> {
    let mut last_err = None;
    for attempt in 0..HANDOFF_MAX_ATTEMPTS {
        std::thread::sleep(base * (1u32 << attempt));
        match try_send(path, fd) {
            Ok(()) => {
                log::info!(
                    "Handoff: tunnel descriptor delivered to {} (attempt {})",
                    path.display(),
                    attempt
                );
                return Ok(());
            }
            Err(e) => {
                log::debug!(
                    "Handoff: attempt {} to {} failed: {}",
                    attempt,
                    path.display(),
                    e
                );
                last_err = Some(e);
            }
        }
    }
    let err = last_err.unwrap_or_else(|| std::io::Error::other("handoff never attempted"));
    log::error!(
        "Handoff: giving up on {} after {} attempts: {}",
        path.display(),
        HANDOFF_MAX_ATTEMPTS,
        err
    );
    Err(VpnError::Handoff(err))
}

fn try_send(path: &Path, fd: BorrowedFd<'_>) -> std::io::Result<()> {
    let stream = UnixStream::connect(path)?;
    let buf = [HANDOFF_MARKER];
    let iov = [IoSlice::new(&buf)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}
