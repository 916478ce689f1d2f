//! Non-blocking connect helpers.
//!
//! Connect targets are TCP addresses or local (unix-domain) socket names; a
//! leading `@` selects the Linux abstract namespace. Socket creation
//! failures are fatal, a refused connect is a network condition the
//! connector's retry machinery absorbs; the two are kept apart in
//! [`DialError`].

use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::errors::LinkError;

// ----------------------------------------------------------------------------
// Connect Target
// ----------------------------------------------------------------------------

/// Parsed connect destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// `ip:port`, v4 or bracketed v6.
    Tcp(SocketAddr),
    /// Filesystem unix-domain socket path.
    Local(String),
    /// Abstract-namespace unix-domain socket name (no leading NUL byte in
    /// the string; it is added when the address is built).
    Abstract(String),
}

impl ConnectTarget {
    /// Parse a target string: anything that parses as a socket address is
    /// TCP, a leading `@` selects the abstract namespace, everything else is
    /// a filesystem socket path.
    pub fn parse(target: &str) -> Result<Self, LinkError> {
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(Self::Tcp(addr));
        }
        if let Some(name) = target.strip_prefix('@') {
            if name.is_empty() {
                return Err(LinkError::InvalidTarget(target.to_string()));
            }
            return Ok(Self::Abstract(name.to_string()));
        }
        if target.is_empty() {
            return Err(LinkError::InvalidTarget(target.to_string()));
        }
        Ok(Self::Local(target.to_string()))
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Local(path) => write!(f, "{path}"),
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

// ----------------------------------------------------------------------------
// Dial
// ----------------------------------------------------------------------------

/// Result of issuing the non-blocking connect.
pub(crate) enum ConnectOutcome {
    /// The OS completed the connect synchronously.
    Connected(RawFd),
    /// The connect is in flight; completion surfaces as fd readiness.
    InProgress(RawFd),
}

/// Why a dial did not produce a socket.
pub(crate) enum DialError {
    /// OS-resource problem (socket creation, option setting). Not worth
    /// retrying.
    Fatal(io::Error),
    /// The peer or path rejected the attempt. Retryable.
    Refused(io::Error),
}

/// Raw sockaddr storage big enough for any family used here.
union SockAddrStorage {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
    un: libc::sockaddr_un,
}

fn build_sockaddr(target: &ConnectTarget) -> io::Result<(SockAddrStorage, libc::socklen_t, i32)> {
    // Zeroed storage is a valid "empty" value for every sockaddr variant.
    let mut storage: SockAddrStorage = unsafe { mem::zeroed() };
    match target {
        ConnectTarget::Tcp(SocketAddr::V4(addr)) => {
            let v4 = unsafe { &mut storage.v4 };
            v4.sin_family = libc::AF_INET as libc::sa_family_t;
            v4.sin_port = addr.port().to_be();
            v4.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
            Ok((
                storage,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                libc::AF_INET,
            ))
        }
        ConnectTarget::Tcp(SocketAddr::V6(addr)) => {
            let v6 = unsafe { &mut storage.v6 };
            v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            v6.sin6_port = addr.port().to_be();
            v6.sin6_addr.s6_addr = addr.ip().octets();
            v6.sin6_scope_id = addr.scope_id();
            Ok((
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                libc::AF_INET6,
            ))
        }
        ConnectTarget::Local(path) => {
            let un = unsafe { &mut storage.un };
            un.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path.as_bytes();
            if bytes.len() >= un.sun_path.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket path too long",
                ));
            }
            for (dst, src) in un.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            Ok((
                storage,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
                libc::AF_UNIX,
            ))
        }
        ConnectTarget::Abstract(name) => {
            let un = unsafe { &mut storage.un };
            un.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = name.as_bytes();
            // sun_path[0] stays NUL for the abstract namespace; the address
            // length covers exactly the used bytes.
            if bytes.len() + 1 > un.sun_path.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "abstract socket name too long",
                ));
            }
            for (dst, src) in un.sun_path[1..].iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            let len = mem::size_of::<libc::sa_family_t>() + 1 + bytes.len();
            Ok((storage, len as libc::socklen_t, libc::AF_UNIX))
        }
    }
}

/// Create a non-blocking socket and issue the connect.
pub(crate) fn connect_nonblocking(
    target: &ConnectTarget,
) -> Result<ConnectOutcome, DialError> {
    let (storage, addr_len, family) = build_sockaddr(target).map_err(DialError::Fatal)?;

    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(DialError::Fatal(io::Error::last_os_error()));
    }

    let rc = unsafe {
        libc::connect(
            fd,
            &storage as *const SockAddrStorage as *const libc::sockaddr,
            addr_len,
        )
    };
    if rc == 0 {
        return Ok(ConnectOutcome::Connected(fd));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(ConnectOutcome::InProgress(fd)),
        // EAGAIN (unix-domain backlog full) leaves the socket unconnected;
        // it is a retryable failure, not a pending attempt.
        _ => {
            unsafe {
                libc::close(fd);
            }
            Err(DialError::Refused(err))
        }
    }
}

/// Fetch and clear the socket's pending error. `None` means the connect
/// completed cleanly.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

/// Best-effort local address description for diagnostics.
pub(crate) fn local_addr_string(fd: RawFd) -> String {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return String::from("?");
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let v4 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            format!("{}:{}", ip, u16::from_be(v4.sin_port))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(v6.sin6_addr.s6_addr);
            format!("[{}]:{}", ip, u16::from_be(v6.sin6_port))
        }
        libc::AF_UNIX => String::from("unix"),
        _ => String::from("?"),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
