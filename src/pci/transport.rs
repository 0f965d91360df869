//! The PCI byte stream: a TCP socket or a serial port, unified behind one
//! `AsyncRead + AsyncWrite` type so the session doesn't care which carried
//! it. Grounded on `original_source/cbus/protocol/pciprotocol.py::main`,
//! which dispatches to `create_serial_connection` or `loop.create_connection`
//! depending on which CLI flag the caller gave.

use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Baud rate mandated by the PCI serial interface guide (spec.md §6.1).
pub const SERIAL_BAUD_RATE: u32 = 9600;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to PCI at {addr}: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open serial device {device}: {source}")]
    Serial {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
}

/// The PCI's byte stream, carried over TCP or a local serial port.
pub enum Transport {
    Tcp(TcpStream),
    Serial(SerialStream),
}

impl Transport {
    pub async fn connect_tcp(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Tcp {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Transport::Tcp(stream))
    }

    pub fn open_serial(device: &str) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(device, SERIAL_BAUD_RATE)
            .open_native_async()
            .map_err(|source| TransportError::Serial {
                device: device.to_string(),
                source,
            })?;
        Ok(Transport::Serial(stream))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Serial(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Serial(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Serial(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Serial(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
