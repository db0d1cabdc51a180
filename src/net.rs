use std::{
    ffi::CString,
    io::{self, Read, Write},
    mem,
    net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, FromRawFd, RawFd},
    sync::Arc,
};

use mio::net::TcpStream;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme,
};

use crate::cfg::LocalAddr;

/// Readiness a suspended operation is waiting for. For TLS this is whatever
/// the TLS engine requests, which may differ from the semantic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Want {
    pub read: bool,
    pub write: bool,
}

impl Want {
    pub const READ: Self = Self { read: true, write: false };
    pub const WRITE: Self = Self { read: false, write: true };
}

/// Uniform status of a non-blocking socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation complete; `0` bytes transferred.
    Ok(usize),
    /// Unrecoverable; the caller must reconnect.
    Error,
    /// Incomplete; register for the requested readiness and retry.
    Retry(Want),
}

/// A non-blocking client socket, plain TCP or TLS.
pub enum Sock {
    Plain(TcpStream),
    Tls(Box<TlsSock>),
}

impl Sock {
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }

    pub fn tls(stream: TcpStream, tls: ClientConnection) -> Self {
        Self::Tls(Box::new(TlsSock {
            stream,
            tls,
            inflight: 0,
            plaintext: 0,
        }))
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(t) => &mut t.stream,
        }
    }

    /// Drives connection establishment. Called on readiness until it stops
    /// returning `Retry`; for TLS this covers the whole handshake.
    pub fn connect(&mut self) -> Status {
        let stream = self.stream_mut();

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => return Status::Error,
        }
        match stream.peer_addr() {
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                return Status::Retry(Want::WRITE);
            }
            Err(_) => return Status::Error,
        }

        match self {
            Self::Plain(_) => Status::Ok(0),
            Self::Tls(t) => t.handshake(),
        }
    }

    /// Reads into `buf`. `Ok(0)` signals end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Status {
        match self {
            Self::Plain(stream) => loop {
                match stream.read(buf) {
                    Ok(n) => return Status::Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Status::Retry(Want::READ);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Status::Error,
                }
            },
            Self::Tls(t) => t.read(buf),
        }
    }

    /// Writes from `buf`, returning the number of bytes accepted. The TLS
    /// variant accepts either the whole buffer or nothing, mirroring
    /// record-at-a-time TLS write semantics.
    pub fn write(&mut self, buf: &[u8]) -> Status {
        match self {
            Self::Plain(stream) => loop {
                match stream.write(buf) {
                    Ok(n) => return Status::Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Status::Retry(Want::WRITE);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Status::Error,
                }
            },
            Self::Tls(t) => t.write(buf),
        }
    }

    /// Bytes known to be immediately readable without blocking.
    pub fn readable(&mut self) -> usize {
        match self {
            Self::Plain(stream) => {
                let mut n: libc::c_int = 0;
                let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD, &mut n) };
                if rc == 0 {
                    n.max(0) as usize
                } else {
                    0
                }
            }
            Self::Tls(t) => t.plaintext,
        }
    }
}

pub struct TlsSock {
    stream: TcpStream,
    tls: ClientConnection,
    /// Plaintext bytes accepted by the TLS engine awaiting flush.
    inflight: usize,
    /// Decrypted bytes buffered and ready for `read`.
    plaintext: usize,
}

impl TlsSock {
    fn handshake(&mut self) -> Status {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                match self.tls.write_tls(&mut self.stream) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Status::Retry(Want::WRITE);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Status::Error,
                }
            }
            if self.tls.wants_read() {
                match self.tls.read_tls(&mut self.stream) {
                    Ok(0) => return Status::Error,
                    Ok(_) => {
                        if self.tls.process_new_packets().is_err() {
                            return Status::Error;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Status::Retry(Want::READ);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Status::Error,
                }
                continue;
            }
            return Status::Error;
        }

        Status::Ok(0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Status {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => {
                    self.plaintext = self.plaintext.saturating_sub(n);
                    return Status::Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return Status::Error,
            }

            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => return Status::Ok(0),
                Ok(_) => match self.tls.process_new_packets() {
                    Ok(state) => {
                        self.plaintext = state.plaintext_bytes_to_read();
                        if self.plaintext == 0 && state.peer_has_closed() {
                            return Status::Ok(0);
                        }
                    }
                    Err(_) => return Status::Error,
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Status::Retry(Want::READ);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Status::Error,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Status {
        if self.inflight == 0 {
            match self.tls.writer().write(buf) {
                Ok(n) => self.inflight = n,
                Err(_) => return Status::Error,
            }
        }

        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Status::Retry(Want::WRITE);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Status::Error,
            }
        }

        Status::Ok(mem::take(&mut self.inflight))
    }
}

/// Creates a non-blocking TCP socket, optionally bound to a local address,
/// with a connect in flight to `addr`.
pub fn connect_stream(addr: SocketAddr, local: Option<&LocalAddr>) -> io::Result<TcpStream> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owns the fd from here on; closed on every error path below.
    let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };

    if let Some(local) = local {
        bind_socket(fd, family, local);
    }

    stream.set_nonblocking(true)?;

    let (storage, len) = sockaddr_of(&addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }

    stream.set_nodelay(true)?;

    Ok(TcpStream::from_std(stream))
}

/// Binds `fd` to the given local address. Failure is non-fatal: the benchmark
/// proceeds from whatever address the kernel picks, with a warning.
fn bind_socket(fd: RawFd, family: libc::c_int, local: &LocalAddr) {
    let bind_addr = match (local.ip, family) {
        (IpAddr::V4(ip), libc::AF_INET) => SocketAddr::V4(SocketAddrV4::new(ip, 0)),
        (IpAddr::V6(ip), libc::AF_INET6) => {
            let scope = match &local.iface {
                Some(iface) => match if_index(iface) {
                    Some(idx) => idx,
                    None => {
                        log::warn!("unknown interface {iface:?} for local address {}", local.ip);
                        0
                    }
                },
                None => 0,
            };
            SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, scope))
        }
        _ => {
            log::warn!(
                "local address {} does not match the target address family, not binding",
                local.ip
            );
            return;
        }
    };

    let (storage, len) = sockaddr_of(&bind_addr);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        log::warn!(
            "couldn't bind socket to address {}, benchmark results may be invalid",
            local.ip
        );
    }
}

fn if_index(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => None,
        idx => Some(idx),
    }
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sa };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sa = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sa };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}

/// Builds the TLS client context. Certificate verification is disabled;
/// benchmark targets commonly present self-signed chains.
pub fn tls_config() -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
        .with_no_client_auth();

    Ok(config)
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, rustls::pki_types::InvalidDnsNameError> {
    ServerName::try_from(host.to_owned())
}

#[derive(Debug)]
struct NoVerify(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
