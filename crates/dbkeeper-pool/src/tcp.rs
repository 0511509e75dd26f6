//! Plain TCP connection backend.
//!
//! [`TcpConnectionFactory`] opens raw TCP streams to one database endpoint.
//! No protocol handshake is performed: the driver on top speaks the wire
//! protocol through [`ConnectionPool::send`](crate::ConnectionPool::send) and
//! [`ConnectionPool::recv`](crate::ConnectionPool::recv).

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::pool::{ConnectionBackend, ConnectionFactory};

/// Read timeout used while peeking during [`TcpBackend::ping`].
const PING_TIMEOUT: Duration = Duration::from_millis(100);

/// A [`ConnectionBackend`] over one TCP stream.
pub struct TcpBackend {
    stream: TcpStream,
}

impl std::fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBackend")
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl TcpBackend {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl ConnectionBackend for TcpBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        self.stream
            .write_all(data)
            .map_err(|e| format!("tcp send: {e}"))?;
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        let mut buf = vec![0u8; max_bytes];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| format!("tcp recv: {e}"))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Peek one byte with a short timeout. EOF means the peer hung up; a
    /// timeout means the stream is quiet but open.
    fn ping(&mut self) -> bool {
        let previous = self.stream.read_timeout().ok().flatten();
        if self.stream.set_read_timeout(Some(PING_TIMEOUT)).is_err() {
            return false;
        }

        let mut probe = [0u8; 1];
        let alive = match self.stream.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        };

        let _ = self.stream.set_read_timeout(previous);
        alive
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Opens TCP connections to a fixed `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    target: String,
    connect_timeout: Duration,
    recv_timeout: Duration,
}

impl TcpConnectionFactory {
    /// `target` is a `host:port` string resolved on every connect.
    pub fn new(target: impl Into<String>, connect_timeout: Duration, recv_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
            recv_timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self) -> Result<Box<dyn ConnectionBackend>, String> {
        let addr = self
            .target
            .to_socket_addrs()
            .map_err(|e| format!("dns resolution failed for {}: {e}", self.target))?
            .next()
            .ok_or_else(|| format!("no address found for {}", self.target))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| format!("tcp connect to {}: {e}", self.target))?;
        stream
            .set_read_timeout(Some(self.recv_timeout))
            .map_err(|e| format!("set recv timeout: {e}"))?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(target_addr = %addr, "established tcp connection");
        Ok(Box::new(TcpBackend::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};

    fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn echo_server() -> SocketAddr {
        let (listener, addr) = listener();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn factory_for(addr: SocketAddr, recv_timeout: Duration) -> TcpConnectionFactory {
        TcpConnectionFactory::new(addr.to_string(), Duration::from_secs(2), recv_timeout)
    }

    #[test]
    fn factory_round_trips_bytes() {
        let addr = echo_server();
        let mut backend = factory_for(addr, Duration::from_secs(2)).connect().unwrap();

        assert_eq!(backend.send(b"SELECT 1").unwrap(), 8);
        assert_eq!(backend.recv(1024).unwrap(), b"SELECT 1");
    }

    #[test]
    fn binary_payload_passes_through_unmodified() {
        let addr = echo_server();
        let mut backend = factory_for(addr, Duration::from_secs(2)).connect().unwrap();

        let startup: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];
        backend.send(&startup).unwrap();
        assert_eq!(backend.recv(1024).unwrap(), startup);
    }

    #[test]
    fn connect_refused_is_an_error() {
        let (listener, addr) = listener();
        drop(listener);
        let result = factory_for(addr, Duration::from_secs(1)).connect();
        assert!(result.is_err());
    }

    #[test]
    fn unresolvable_target_is_an_error() {
        let factory = TcpConnectionFactory::new(
            "not a host",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = factory.connect().unwrap_err();
        assert!(err.contains("not a host"));
    }

    #[test]
    fn recv_honours_configured_timeout() {
        let (listener, addr) = listener();
        std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(2));
        });

        let mut backend = factory_for(addr, Duration::from_millis(100)).connect().unwrap();
        assert!(backend.recv(1024).is_err());
    }

    #[test]
    fn ping_open_connection() {
        let addr = echo_server();
        let mut backend = factory_for(addr, Duration::from_secs(2)).connect().unwrap();
        assert!(backend.ping());
    }

    #[test]
    fn ping_detects_peer_hangup() {
        let (listener, addr) = listener();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut backend = factory_for(addr, Duration::from_secs(2)).connect().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!backend.ping());
    }

    #[test]
    fn send_after_close_fails() {
        let addr = echo_server();
        let mut backend = factory_for(addr, Duration::from_secs(2)).connect().unwrap();
        backend.close();
        assert!(backend.send(b"x").is_err());
    }
}
