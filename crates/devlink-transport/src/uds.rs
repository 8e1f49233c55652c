use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::device::{DeviceBackend, DeviceDescriptor, DeviceState, Protocol};
use crate::error::{Result, TransportError};
use crate::traits::LinkStream;

/// Unix domain socket transport.
///
/// A device process (for example `devlink serve`) listens on a filesystem
/// path; the host connects to it. The socket file is removed on drop as long
/// as it is still the one this listener created.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// A stale socket at `path` is removed first; any other kind of file is
    /// left alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit permission mode for the socket file.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path)?;

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "device socket listening");

        Ok(Self {
            listener,
            created_inode: (created.dev(), created.ino()),
            path,
        })
    }

    /// Accept an incoming host connection (blocking).
    pub fn accept(&self) -> Result<LinkStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        // BSD-derived platforms propagate O_NONBLOCK from the listener.
        stream.set_nonblocking(false)?;
        debug!(path = ?self.path, "accepted host connection");
        Ok(LinkStream::from_unix(stream))
    }

    /// Switch the listener between blocking and non-blocking accept.
    ///
    /// In non-blocking mode `accept` fails with an I/O error of kind
    /// `WouldBlock` when no connection is pending.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener
            .set_nonblocking(nonblocking)
            .map_err(TransportError::Io)
    }

    /// Connect to a listening device socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<LinkStream> {
        let path = path.as_ref();
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(|e| TransportError::Connect {
                path: path.to_path_buf(),
                source: e,
            })?;
        debug!(?path, "connected to device socket");
        Ok(LinkStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let (expected_dev, expected_ino) = self.created_inode;
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= UnixDomainSocket::MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: UnixDomainSocket::MAX_PATH_LEN,
        });
    }
    Ok(())
}

/// Device backend over a fixed set of socket paths.
///
/// Every path that currently holds a socket is reported as a booted
/// [`Protocol::Ipc`] device named after the path. Firmware cannot be loaded
/// over a socket; the device process is expected to be running already.
#[derive(Debug, Clone, Default)]
pub struct UdsBackend {
    paths: Vec<PathBuf>,
}

impl UdsBackend {
    pub const PLATFORM: &'static str = "uds";

    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl DeviceBackend for UdsBackend {
    fn name(&self) -> &'static str {
        "uds"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ipc
    }

    fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self
            .paths
            .iter()
            .filter(|path| {
                std::fs::symlink_metadata(path)
                    .map(|m| m.file_type().is_socket())
                    .unwrap_or(false)
            })
            .map(|path| DeviceDescriptor {
                name: path.display().to_string(),
                protocol: Protocol::Ipc,
                platform: Self::PLATFORM.to_string(),
                state: DeviceState::Booted,
            })
            .collect();
        Ok(devices)
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<LinkStream> {
        let path = self
            .paths
            .iter()
            .find(|path| path.display().to_string() == device.name)
            .ok_or_else(|| TransportError::DeviceNotFound(device.name.clone()))?;
        UnixDomainSocket::connect(path)
    }

    fn boot(&self, _device: &DeviceDescriptor, _firmware: &[u8]) -> Result<()> {
        Err(TransportError::Unsupported {
            backend: self.name(),
            operation: "boot",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("devlink-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_bind_accept_connect() {
        let dir = temp_dir("uds");
        let sock_path = dir.join("dev.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut host = UnixDomainSocket::connect(&path_clone).unwrap();
            host.write_all(b"hello").unwrap();
        });

        let mut device = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        device.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(device.transport_name(), "unix-domain-socket");

        handle.join().unwrap();

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn test_bind_default_permissions_hardened() {
        let dir = temp_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_rejects_existing_non_socket_file() {
        let dir = temp_dir("bind-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backend_discovers_only_live_sockets() {
        let dir = temp_dir("backend");
        let live = dir.join("live.sock");
        let missing = dir.join("missing.sock");

        let listener = UnixDomainSocket::bind(&live).unwrap();
        let backend = UdsBackend::new([live.clone(), missing]);

        let devices = backend.discover().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, live.display().to_string());
        assert_eq!(devices[0].state, DeviceState::Booted);
        assert_eq!(devices[0].protocol, Protocol::Ipc);

        let err = backend.boot(&devices[0], b"DLFW").unwrap_err();
        assert!(matches!(err, TransportError::Unsupported { .. }));

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backend_open_unknown_device() {
        let backend = UdsBackend::new(Vec::<PathBuf>::new());
        let device = DeviceDescriptor {
            name: "/nowhere.sock".to_string(),
            protocol: Protocol::Ipc,
            platform: UdsBackend::PLATFORM.to_string(),
            state: DeviceState::Booted,
        };
        assert!(matches!(
            backend.open(&device),
            Err(TransportError::DeviceNotFound(_))
        ));
    }
}
