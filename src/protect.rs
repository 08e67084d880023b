//! Control-plane socket protection.
//!
//! Every raw socket the engine opens for its own control plane must be
//! excluded from the tunnel it manages, otherwise the tunnel would capture
//! its own traffic and loop. The host platform supplies a [`Protector`]; the
//! [`SocketPool`] guarantees no socket is used before it has been protected.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;

#[cfg(unix)]
use std::os::fd::AsRawFd;

#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

/// Platform-native socket descriptor (fd on unix, SOCKET on windows).
pub type NativeSocket = i64;

/// Host-supplied capability that excludes a socket from the tunnel.
///
/// Sits on the connection-establishment hot path; implementations must be
/// fast and must not block.
pub trait Protector: Send + Sync {
    /// Mark the socket so the host routes it outside the tunnel.
    fn protect(&self, socket: NativeSocket) -> io::Result<()>;

    /// Notification that a previously protected socket was closed.
    fn clean(&self, _socket: NativeSocket) {}
}

/// Protector for hosts that do not require socket marking.
pub struct NoopProtector;

impl Protector for NoopProtector {
    fn protect(&self, _socket: NativeSocket) -> io::Result<()> {
        Ok(())
    }
}

/// Opens control-plane sockets and runs each through the protector before
/// handing it out.
#[derive(Clone)]
pub struct SocketPool {
    protect: Arc<dyn Protector>,
}

impl SocketPool {
    pub fn new(protect: Arc<dyn Protector>) -> Self {
        Self { protect }
    }

    /// Bind a UDP control socket on an ephemeral port and protect it.
    pub fn new_external_udp(&self) -> io::Result<ProtectedUdp> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let native = native_socket(&socket);
        self.protect.protect(native)?;
        Ok(ProtectedUdp {
            socket,
            native,
            protect: self.protect.clone(),
        })
    }
}

/// A UDP socket that has passed through the protect callback.
///
/// Notifies the protector when dropped so the host can release any marking.
pub struct ProtectedUdp {
    socket: UdpSocket,
    native: NativeSocket,
    protect: Arc<dyn Protector>,
}

impl ProtectedUdp {
    /// The underlying socket.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// The native descriptor handed to the protect callback.
    pub fn native(&self) -> NativeSocket {
        self.native
    }
}

impl Drop for ProtectedUdp {
    fn drop(&mut self) {
        self.protect.clean(self.native);
    }
}

#[cfg(unix)]
fn native_socket(socket: &UdpSocket) -> NativeSocket {
    socket.as_raw_fd() as NativeSocket
}

#[cfg(windows)]
fn native_socket(socket: &UdpSocket) -> NativeSocket {
    socket.as_raw_socket() as NativeSocket
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProtector {
        protected: AtomicUsize,
        cleaned: AtomicUsize,
    }

    impl CountingProtector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                protected: AtomicUsize::new(0),
                cleaned: AtomicUsize::new(0),
            })
        }
    }

    impl Protector for CountingProtector {
        fn protect(&self, _socket: NativeSocket) -> io::Result<()> {
            self.protected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn clean(&self, _socket: NativeSocket) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_socket_protected_before_use_and_cleaned_on_drop() {
        let protector = CountingProtector::new();
        let pool = SocketPool::new(protector.clone());

        let socket = pool.new_external_udp().expect("Should bind control socket");
        assert_eq!(protector.protected.load(Ordering::SeqCst), 1);
        assert_eq!(protector.cleaned.load(Ordering::SeqCst), 0);

        drop(socket);
        assert_eq!(protector.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protect_failure_propagates() {
        struct RejectingProtector;
        impl Protector for RejectingProtector {
            fn protect(&self, _socket: NativeSocket) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            }
        }

        let pool = SocketPool::new(Arc::new(RejectingProtector));
        assert!(pool.new_external_udp().is_err());
    }
}
