//! Opening and polling the transport endpoint.
//!
//! The link between the peers is named by a filesystem path. On a real
//! deployment that is the virtio-serial character device the hypervisor
//! exposes (`/dev/vport0p1` or a `com.example.tunnel` alias); on the host
//! side of QEMU setups, and under test, it is a unix domain socket. Either
//! way the rest of the runtime only sees a non-blocking `Read + Write`
//! handle it can register with the poll.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::error::SetupError;

/// The byte stream carrying all frames between the peers.
#[derive(Debug)]
pub enum Endpoint {
    Socket(UnixStream),
    Device(File),
}

impl Endpoint {
    /// Open the endpoint at `path`, non-blocking. Unix sockets are
    /// connected; anything else is opened read/write like a character
    /// device.
    pub fn open(path: &Path) -> Result<Self, SetupError> {
        let open = |path: &Path| -> io::Result<Self> {
            if std::fs::metadata(path)?.file_type().is_socket() {
                let stream = UnixStream::connect(path)?;
                stream.set_nonblocking(true)?;
                debug!(path = %path.display(), "transport endpoint is a unix socket");
                Ok(Self::Socket(stream))
            } else {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(path)?;
                debug!(path = %path.display(), "transport endpoint is a device");
                Ok(Self::Device(file))
            }
        };
        open(path).map_err(|source| SetupError::OpenTransport { path: path.to_owned(), source })
    }
}

impl From<UnixStream> for Endpoint {
    /// Wrap an already-connected stream, e.g. one half of a socketpair.
    fn from(stream: UnixStream) -> Self {
        let _ = stream.set_nonblocking(true);
        Self::Socket(stream)
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Socket(stream) => stream.as_raw_fd(),
            Self::Device(file) => file.as_raw_fd(),
        }
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Socket(stream) => stream.read(buf),
            Self::Device(file) => file.read(buf),
        }
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Socket(stream) => stream.write(buf),
            Self::Device(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Socket(stream) => stream.flush(),
            Self::Device(file) => file.flush(),
        }
    }
}

impl Source for Endpoint {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        let fd = self.as_raw_fd();
        SourceFd(&fd).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        let fd = self.as_raw_fd();
        SourceFd(&fd).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let fd = self.as_raw_fd();
        SourceFd(&fd).deregister(registry)
    }
}
