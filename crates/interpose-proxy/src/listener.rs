//! Client listener with connection injection.
//!
//! [`ProxyListener`] yields both freshly accepted TCP connections and
//! connections pushed back in through a [`ListenerHandle`]. Interception uses
//! the handle to hand a decrypted stream back to the accept loop, which then
//! serves it through a fresh pipeline like any other client.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};
use crate::handler::TlsInfo;

/// Byte stream a client connection can be served over.
pub trait ClientIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ClientIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A client connection ready to be served.
pub struct Accepted {
    /// The client stream (plain TCP, or decrypted TLS for injected connections).
    pub io: Box<dyn ClientIo>,
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// Set when the stream was TLS-terminated by the proxy.
    pub tls: Option<TlsInfo>,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("peer", &self.peer)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Cloneable reference to a running listener.
#[derive(Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    injector: mpsc::UnboundedSender<Accepted>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.injector.is_closed())
            .finish()
    }
}

impl ListenerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues a connection for the accept loop.
    ///
    /// Returns the connection back if the listener has been dropped.
    pub fn inject(&self, conn: Accepted) -> std::result::Result<(), Accepted> {
        self.injector.send(conn).map_err(|e| e.0)
    }
}

/// TCP listener that also accepts injected connections.
pub struct ProxyListener {
    inner: TcpListener,
    injected: mpsc::UnboundedReceiver<Accepted>,
    handle: ListenerHandle,
}

impl ProxyListener {
    /// Binds a listener with address reuse and the given backlog.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ProxyError::Bind(addr, e))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| ProxyError::Bind(addr, e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ProxyError::Bind(addr, e))?;
        socket
            .listen(backlog)
            .map_err(|e| ProxyError::Bind(addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ProxyError::Bind(addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let inner = TcpListener::from_std(std_listener).map_err(|e| ProxyError::Bind(addr, e))?;
        Self::from_tokio(inner)
    }

    /// Wraps an already bound tokio listener.
    pub fn from_tokio(inner: TcpListener) -> Result<Self> {
        let local_addr = inner.local_addr()?;
        let (injector, injected) = mpsc::unbounded_channel();
        Ok(Self {
            inner,
            injected,
            handle: ListenerHandle {
                local_addr,
                injector,
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Returns a handle that can inject connections into this listener.
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Waits for the next client connection, accepted or injected.
    pub async fn accept(&mut self) -> std::io::Result<Accepted> {
        tokio::select! {
            // The listener keeps its own sender alive, so recv never yields None.
            Some(conn) = self.injected.recv() => Ok(conn),
            accepted = self.inner.accept() => {
                let (stream, peer) = accepted?;
                let _ = stream.set_nodelay(true);
                Ok(Accepted {
                    io: Box::new(stream),
                    peer,
                    tls: None,
                })
            }
        }
    }
}
