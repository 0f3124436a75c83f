//! Plain TCP transport
//!
//! Operations get a shared `&TcpStream`; `Read` and `Write` are implemented
//! for it, so the sender and receiver threads can use it concurrently.

use crate::core::types::OpStatus;
use crate::portal::operation::Transport;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Per-endpoint socket options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpOptions {
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Read/write timeout applied to the socket
    pub io_timeout: Option<Duration>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            io_timeout: None,
        }
    }
}

/// TCP over `std::net`
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Context = TcpOptions;

    fn resolve(&self, host: &str, port: u16) -> bool {
        (host, port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    }

    fn connect(
        &self,
        ctx: &TcpOptions,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<TcpStream, OpStatus> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| OpStatus::InvalidHost)?;

        let mut last = OpStatus::CantConnect;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    configure(&stream, ctx).map_err(|e| status_from_io(&e))?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last = match status_from_io(&e) {
                        OpStatus::Timeout => OpStatus::Timeout,
                        _ => OpStatus::CantConnect,
                    };
                }
            }
        }
        Err(last)
    }

    fn close(&self, stream: &TcpStream) {
        // Already-closed sockets report NotConnected; nothing to do.
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn configure(stream: &TcpStream, ctx: &TcpOptions) -> io::Result<()> {
    stream.set_nodelay(ctx.nodelay)?;
    stream.set_read_timeout(ctx.io_timeout)?;
    stream.set_write_timeout(ctx.io_timeout)?;
    Ok(())
}

/// Map an I/O error from a socket onto an operation status
pub fn status_from_io(err: &io::Error) -> OpStatus {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => OpStatus::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => OpStatus::RetryDeadSocket,
        io::ErrorKind::ConnectionRefused => OpStatus::CantConnect,
        _ => OpStatus::Generic,
    }
}
