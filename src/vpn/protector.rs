//! Socket protection
//!
//! Sockets that must reach the physical network — the relay sockets, the
//! engine's control traffic — have to bypass the tunnel's own capture or
//! they would loop back into it. Protection binds a descriptor to the
//! active physical network; where that is not permitted the platform's
//! raw protect callback is used instead.
//!
//! The IPC service accepts descriptors from external helper processes:
//! one trigger byte plus one descriptor as ancillary data in, one status
//! byte out (0 ok, 1 failed). Requests are infrequent control operations,
//! so a single thread handles connections serially. A malformed request
//! never produces a response and never takes the listener down.

use super::resolver::NetworkMonitor;
use super::{join_with_timeout, ShutdownSignal};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::ffi::OsString;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::UdpSocket;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Read timeout for one protection exchange
const PROTECT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept poll interval while idle
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Anything that can protect a socket from tunnel capture.
pub trait SocketProtection: Send + Sync {
    fn protect(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
}

/// No-op protection for tests and loopback-only setups.
pub struct NoProtection;

impl SocketProtection for NoProtection {
    fn protect(&self, _fd: BorrowedFd<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Raw platform protect callback, used where binding is not permitted.
pub type ProtectFallback = Arc<dyn Fn(BorrowedFd<'_>) -> io::Result<()> + Send + Sync>;

/// Which protection mechanism this process can use. Probed once at
/// startup instead of re-discovering per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindStrategy {
    /// Bind descriptors to the active network's interface
    BindToNetwork,
    /// Binding is not permitted here; always use the raw callback
    FallbackOnly,
}

/// Production protection: bind to the active network, falling back to the
/// platform callback on permission or no-route conditions.
pub struct NetworkProtector {
    monitor: Arc<dyn NetworkMonitor>,
    fallback: ProtectFallback,
    strategy: BindStrategy,
}

impl NetworkProtector {
    pub fn new(monitor: Arc<dyn NetworkMonitor>, fallback: ProtectFallback) -> Self {
        let strategy = probe_bind_strategy();
        log::info!("Protector: using {:?}", strategy);
        Self {
            monitor,
            fallback,
            strategy,
        }
    }
}

impl SocketProtection for NetworkProtector {
    fn protect(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        if self.strategy == BindStrategy::FallbackOnly {
            return (self.fallback)(fd);
        }
        let Some(network) = self.monitor.active_network() else {
            log::debug!("Protector: no active network, using fallback");
            return (self.fallback)(fd);
        };
        match bind_to_device(fd, &network.interface) {
            Ok(()) => Ok(()),
            Err(e) if is_bind_fallback_condition(&e) => {
                log::debug!(
                    "Protector: bind to {} not possible ({}), using fallback",
                    network.interface,
                    e
                );
                (self.fallback)(fd)
            }
            Err(e) => Err(e),
        }
    }
}

/// Probe whether this process may bind sockets to a device at all.
fn probe_bind_strategy() -> BindStrategy {
    let Ok(scratch) = UdpSocket::bind("0.0.0.0:0") else {
        return BindStrategy::FallbackOnly;
    };
    match bind_to_device(scratch.as_fd(), "lo") {
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EPERM as i32) => {
            BindStrategy::FallbackOnly
        }
        _ => BindStrategy::BindToNetwork,
    }
}

fn bind_to_device(fd: BorrowedFd<'_>, interface: &str) -> io::Result<()> {
    nix::sys::socket::setsockopt(
        &fd,
        nix::sys::socket::sockopt::BindToDevice,
        &OsString::from(interface),
    )
    .map_err(io::Error::from)
}

/// EPERM and ENONET (machine not on the network) mean "use the raw
/// protect call instead"; everything else is a real failure.
fn is_bind_fallback_condition(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == nix::errno::Errno::EPERM as i32
            || code == nix::errno::Errno::ENONET as i32
    )
}

/// Long-lived protection IPC service.
pub struct ProtectService {
    path: PathBuf,
    shutdown: ShutdownSignal,
    listener_thread: Option<JoinHandle<()>>,
}

impl ProtectService {
    /// Bind the service socket and start the listener thread.
    pub fn start(path: &Path, protection: Arc<dyn SocketProtection>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        log::info!("Protector: listening on {}", path.display());

        let shutdown = ShutdownSignal::new();
        let thread_shutdown = shutdown.clone();
        let listener_thread = std::thread::Builder::new()
            .name("driller-protect".to_string())
            .spawn(move || {
                while !thread_shutdown.is_triggered() {
                    match listener.accept() {
                        Ok((stream, _addr)) => {
                            if stream.set_nonblocking(false).is_ok() {
                                handle_connection(&stream, protection.as_ref());
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                        Err(e) => {
                            log::warn!("Protector: accept failed: {}", e);
                            std::thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                    }
                }
                log::debug!("Protector: listener stopped");
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            shutdown,
            listener_thread: Some(listener_thread),
        })
    }

    /// Stop accepting requests, join the listener, and unlink the socket.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.listener_thread.take() {
            join_with_timeout(handle, "protect listener");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Protector: failed to unlink {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for ProtectService {
    fn drop(&mut self) {
        if self.listener_thread.is_some() {
            self.stop();
        }
    }
}

/// One protection exchange. A request with no descriptor attached gets
/// no response at all; the caller's next connection is unaffected.
fn handle_connection(stream: &UnixStream, protection: &dyn SocketProtection) {
    if let Err(e) = stream.set_read_timeout(Some(PROTECT_IO_TIMEOUT)) {
        log::warn!("Protector: failed to set request timeout: {}", e);
        return;
    }

    let mut trigger = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut trigger)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = match recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    ) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Protector: failed to read request: {}", e);
            return;
        }
    };

    let mut received: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for raw in fds {
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                if received.is_none() {
                    received = Some(fd);
                }
                // surplus descriptors close on drop
            }
        }
    }
    let Some(fd) = received else {
        log::warn!("Protector: request without attached descriptor, ignoring");
        return;
    };

    let status = match protection.protect(fd.as_fd()) {
        Ok(()) => 0u8,
        Err(e) => {
            log::warn!("Protector: protection failed: {}", e);
            1u8
        }
    };
    if let Err(e) = (&mut &*stream).write_all(&[status]) {
        log::warn!("Protector: failed to write response: {}", e);
    }
    // fd closes here
}

/// Client side: ask the service at `path` to protect `fd`.
pub fn protect_socket(path: &Path, fd: BorrowedFd<'_>) -> io::Result<()> {
    let stream = UnixStream::connect(path)?;
    stream.set_read_timeout(Some(PROTECT_IO_TIMEOUT))?;

    let trigger = [0u8; 1];
    let iov = [IoSlice::new(&trigger)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;

    let mut status = [0u8; 1];
    (&mut &stream).read_exact(&mut status)?;
    if status[0] == 0 {
        Ok(())
    } else {
        Err(io::Error::other("socket protection refused"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::resolver::{Network, NetworkCapability};
    use std::net::UdpSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Recording {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Recording {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl SocketProtection for Recording {
        fn protect(&self, _fd: BorrowedFd<'_>) -> io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(io::Error::other("denied"))
            } else {
                Ok(())
            }
        }
    }

    struct OfflineMonitor;
    impl NetworkMonitor for OfflineMonitor {
        fn active_network(&self) -> Option<Network> {
            None
        }
        fn capability(&self, _network: &Network) -> NetworkCapability {
            NetworkCapability {
                has_v4: false,
                has_v6: false,
            }
        }
    }

    #[test]
    fn no_active_network_uses_fallback() {
        let count = Arc::new(AtomicUsize::new(0));
        let fallback_count = count.clone();
        let protector = NetworkProtector::new(
            Arc::new(OfflineMonitor),
            Arc::new(move |_fd| {
                fallback_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        protector.protect(socket.as_fd()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn well_formed_request_gets_status_and_closes_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("protect_path");
        let protection = Recording::new(false);
        let mut service = ProtectService::start(&path, protection.clone()).unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        protect_socket(&path, socket.as_fd()).unwrap();
        assert_eq!(protection.calls.load(Ordering::SeqCst), 1);

        service.stop();
        assert!(!path.exists());
    }

    #[test]
    fn failed_protection_reports_status_one() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("protect_path");
        let mut service = ProtectService::start(&path, Recording::new(true)).unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = protect_socket(&path, socket.as_fd()).unwrap_err();
        assert!(err.to_string().contains("refused"));

        service.stop();
    }

    #[test]
    fn descriptorless_request_gets_no_response_and_listener_survives() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("protect_path");
        let protection = Recording::new(false);
        let mut service = ProtectService::start(&path, protection.clone()).unwrap();

        // malformed request: a trigger byte with no ancillary descriptor
        let stream = UnixStream::connect(&path).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        (&mut &stream).write_all(&[0u8]).unwrap();
        let mut buf = [0u8; 1];
        match (&mut &stream).read(&mut buf) {
            // listener closes the connection without responding
            Ok(0) => {}
            Ok(n) => panic!("unexpected {}-byte response to malformed request", n),
            // or never responds at all within the timeout
            Err(e) => assert!(
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "unexpected error: {}",
                e
            ),
        }
        assert_eq!(protection.calls.load(Ordering::SeqCst), 0);

        // a subsequent well-formed connection still succeeds
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        protect_socket(&path, socket.as_fd()).unwrap();
        assert_eq!(protection.calls.load(Ordering::SeqCst), 1);

        service.stop();
    }
}
