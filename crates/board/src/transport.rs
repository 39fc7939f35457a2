//! Host Transports

use shuttle_protocol::{BridgeError, BridgeResult, CommInterface, Transport};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bytes queued for a host before it is considered gone
pub const MAX_OUTBOUND_BYTES: usize = 64 * 1024;

#[derive(Default)]
struct Link {
    /// Bytes flushed towards each side
    inbox: [VecDeque<u8>; 2],
    open: [bool; 2],
}

/// One end of an in-process byte pipe
///
/// Written bytes are staged until [`Transport::flush`], then become
/// readable on the peer end.
pub struct MemoryTransport {
    link: Arc<Mutex<Link>>,
    side: usize,
    staged: Vec<u8>,
}

impl MemoryTransport {
    /// Two connected ends: board side first, host side second
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link::default()));
        let end = |side| Self {
            link: link.clone(),
            side,
            staged: Vec::new(),
        };
        (end(0), end(1))
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer(&self) -> usize {
        1 - self.side
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, _intf: CommInterface) -> BridgeResult<()> {
        self.lock().open[self.side] = true;
        Ok(())
    }

    fn close(&mut self, _intf: CommInterface) -> BridgeResult<()> {
        self.staged.clear();
        let mut link = self.lock();
        link.open[self.side] = false;
        link.inbox[self.side].clear();
        Ok(())
    }

    fn available(&mut self, _intf: CommInterface) -> usize {
        self.lock().inbox[self.side].len()
    }

    fn connected(&self, _intf: CommInterface) -> bool {
        let link = self.lock();
        link.open[self.side] && link.open[self.peer()]
    }

    fn read(&mut self, _intf: CommInterface, buffer: &mut [u8]) -> BridgeResult<usize> {
        let mut link = self.lock();
        let inbox = &mut link.inbox[self.side];
        let count = buffer.len().min(inbox.len());
        for (slot, byte) in buffer.iter_mut().zip(inbox.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, intf: CommInterface, buffer: &[u8]) -> BridgeResult<()> {
        if !self.connected(intf) {
            return Err(BridgeError::CommIo("peer is not connected".to_string()));
        }
        self.staged.extend_from_slice(buffer);
        Ok(())
    }

    fn flush(&mut self, _intf: CommInterface) -> BridgeResult<()> {
        let peer = self.peer();
        let staged = std::mem::take(&mut self.staged);
        self.lock().inbox[peer].extend(staged);
        Ok(())
    }
}

/// Virtual COM port emulated over a TCP socket
///
/// Serves a single host at a time. Hosts are admitted with
/// [`TcpTransport::accept`] from the async side; the [`Transport`] calls
/// never wait. Bytes the socket does not take yet stay queued for the next
/// flush, up to [`MAX_OUTBOUND_BYTES`].
pub struct TcpTransport {
    listener: TcpListener,
    open: bool,
    stream: Option<TcpStream>,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

impl TcpTransport {
    /// Bind the VCOM socket; the interface stays closed until opened
    pub async fn bind(addr: &str) -> BridgeResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::CommInitFailed(format!("{}: {}", addr, e)))?;
        info!("VCOM bound to {}", addr);
        Ok(Self {
            listener,
            open: false,
            stream: None,
            inbound: VecDeque::new(),
            outbound: Vec::new(),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        self.listener.local_addr().map_err(|e| BridgeError::CommIo(e.to_string()))
    }

    /// Wait for the next host connection
    ///
    /// Cancel safe. A host arriving while another is attached, or while the
    /// interface is closed, is turned away.
    pub async fn accept(&mut self) -> BridgeResult<SocketAddr> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| BridgeError::CommIo(e.to_string()))?;
        if !self.open || self.stream.is_some() {
            warn!("Turned away host {}: interface busy or closed", peer);
            return Err(BridgeError::CommIo(format!("{} turned away", peer)));
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Host {} keeps Nagle batching: {}", peer, e);
        }
        info!("Host connected from {}", peer);
        self.stream = Some(stream);
        Ok(peer)
    }

    fn disconnect(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            info!("Host disconnected: {}", reason);
        }
        self.outbound.clear();
    }

    fn fill_inbound(&mut self) {
        let mut chunk = [0u8; 512];
        while let Some(stream) = self.stream.as_ref() {
            match stream.try_read(&mut chunk) {
                Ok(0) => self.disconnect("closed by peer"),
                Ok(n) => self.inbound.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    let reason = e.to_string();
                    self.disconnect(&reason);
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, intf: CommInterface) -> BridgeResult<()> {
        if intf != CommInterface::Vcom {
            return Err(BridgeError::NotSupported("only the VCOM interface is served over TCP"));
        }
        if !self.open {
            self.open = true;
            info!("VCOM open on {:?}", self.listener.local_addr().ok());
        }
        Ok(())
    }

    fn close(&mut self, _intf: CommInterface) -> BridgeResult<()> {
        self.disconnect("interface closed");
        self.open = false;
        self.inbound.clear();
        Ok(())
    }

    fn available(&mut self, _intf: CommInterface) -> usize {
        self.fill_inbound();
        self.inbound.len()
    }

    fn connected(&self, _intf: CommInterface) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self, _intf: CommInterface, buffer: &mut [u8]) -> BridgeResult<usize> {
        let count = buffer.len().min(self.inbound.len());
        for (slot, byte) in buffer.iter_mut().zip(self.inbound.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, _intf: CommInterface, buffer: &[u8]) -> BridgeResult<()> {
        if self.stream.is_none() {
            return Err(BridgeError::CommIo("no host connected".to_string()));
        }
        if self.outbound.len() + buffer.len() > MAX_OUTBOUND_BYTES {
            self.disconnect("host stopped reading");
            return Err(BridgeError::CommIo(format!(
                "more than {} bytes queued for the host",
                MAX_OUTBOUND_BYTES
            )));
        }
        self.outbound.extend_from_slice(buffer);
        Ok(())
    }

    fn flush(&mut self, _intf: CommInterface) -> BridgeResult<()> {
        let Some(stream) = self.stream.as_ref() else {
            self.outbound.clear();
            return Ok(());
        };
        let mut sent = 0;
        let result = loop {
            if sent == self.outbound.len() {
                break Ok(());
            }
            match stream.try_write(&self.outbound[sent..]) {
                Ok(0) => break Err(BridgeError::CommIo("socket closed during write".to_string())),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(BridgeError::CommIo(e.to_string())),
            }
        };
        self.outbound.drain(..sent);
        if !self.outbound.is_empty() {
            debug!("{} byte(s) still queued for the host", self.outbound.len());
        }
        if let Err(e) = &result {
            self.disconnect(&e.to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const VCOM: CommInterface = CommInterface::Vcom;

    #[test]
    fn test_memory_pair_delivers_after_flush() {
        let (mut board, mut host) = MemoryTransport::pair();
        board.open(VCOM).unwrap();
        assert!(!board.connected(VCOM));
        host.open(VCOM).unwrap();
        assert!(board.connected(VCOM) && host.connected(VCOM));

        host.write(VCOM, &[1, 2, 3]).unwrap();
        assert_eq!(board.available(VCOM), 0);
        host.flush(VCOM).unwrap();
        assert_eq!(board.available(VCOM), 3);

        let mut buf = [0u8; 2];
        assert_eq!(board.read(VCOM, &mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(board.read(VCOM, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
        // Nothing left: returns immediately with zero
        assert_eq!(board.read(VCOM, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_memory_write_needs_peer() {
        let (mut board, _host) = MemoryTransport::pair();
        board.open(VCOM).unwrap();
        assert!(matches!(board.write(VCOM, &[0]), Err(BridgeError::CommIo(_))));
    }

    #[test]
    fn test_memory_close_drops_staged_bytes() {
        let (mut board, mut host) = MemoryTransport::pair();
        board.open(VCOM).unwrap();
        host.open(VCOM).unwrap();

        board.write(VCOM, &[7, 7]).unwrap();
        board.close(VCOM).unwrap();
        board.flush(VCOM).unwrap();
        assert_eq!(host.available(VCOM), 0);
        assert!(!host.connected(VCOM));
    }

    async fn connected_pair() -> (TcpTransport, TcpStream) {
        let mut transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        transport.open(VCOM).unwrap();
        let addr = transport.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), transport.accept());
        accepted.unwrap();
        (transport, client.unwrap())
    }

    async fn wait_for(transport: &mut TcpTransport, bytes: usize) {
        for _ in 0..100 {
            if transport.available(VCOM) >= bytes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_tcp_only_serves_vcom() {
        let mut transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            transport.open(CommInterface::Ble),
            Err(BridgeError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_bind_failure_is_init_error() {
        let first = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().to_string();
        assert!(matches!(
            TcpTransport::bind(&taken).await,
            Err(BridgeError::CommInitFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let (mut transport, mut client) = connected_pair().await;
        assert!(transport.connected(VCOM));

        client.write_all(b"ping").await.unwrap();
        wait_for(&mut transport, 4).await;

        let mut buf = [0u8; 8];
        assert_eq!(transport.read(VCOM, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        transport.write(VCOM, b"pong").unwrap();
        transport.flush(VCOM).unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        transport.close(VCOM).unwrap();
        assert!(!transport.connected(VCOM));
    }

    #[tokio::test]
    async fn test_tcp_peer_close_disconnects() {
        let (mut transport, client) = connected_pair().await;
        drop(client);

        for _ in 0..100 {
            transport.available(VCOM);
            if !transport.connected(VCOM) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!transport.connected(VCOM));
        assert!(matches!(transport.write(VCOM, b"x"), Err(BridgeError::CommIo(_))));
    }

    #[tokio::test]
    async fn test_tcp_outbound_queue_is_capped() {
        let (mut transport, _client) = connected_pair().await;

        transport.write(VCOM, &vec![0u8; MAX_OUTBOUND_BYTES]).unwrap();
        let err = transport.write(VCOM, &[0u8]).unwrap_err();
        assert!(matches!(err, BridgeError::CommIo(_)));
        assert!(!transport.connected(VCOM));
    }
}
