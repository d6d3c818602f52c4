use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{error::Result, options::ServerAddress, runtime::TlsConfig};

/// A stream to a MongoDB server, possibly using TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncStream {
    /// Opens a TCP stream to `address`, wrapping it in TLS when a config is supplied.
    ///
    /// Callers are expected to bound this with their connect timeout.
    pub(crate) async fn connect(
        address: &ServerAddress,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let stream = TcpStream::connect((address.hostname(), address.port())).await?;
        stream.set_nodelay(true)?;

        match tls_config {
            Some(cfg) => Ok(AsyncStream::Tls(cfg.connect(address.hostname(), stream).await?)),
            None => Ok(AsyncStream::Tcp(stream)),
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
            AsyncStream::Tls(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Tcp(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
            AsyncStream::Tls(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(ref mut stream) => Pin::new(stream).poll_flush(cx),
            AsyncStream::Tls(ref mut stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            AsyncStream::Tls(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
