//! Line-oriented command transport
//!
//! Instruments on the bench speak newline-terminated ASCII. A [`Transport`]
//! sends one command, or sends a query and reads back one response line.
//! [`TcpTransport`] reaches an instrument through a LAN-to-GPIB gateway.

use crate::error::{IvError, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Command/response channel to one instrument
pub trait Transport: Send {
    /// Send a command that produces no response
    fn write(&mut self, command: &str) -> Result<()>;

    /// Send a query and read one response line (without the terminator)
    fn query(&mut self, command: &str) -> Result<String>;
}

/// TCP connection to an instrument gateway
#[derive(Debug)]
pub struct TcpTransport {
    name: String,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    /// Connect to `address` (`host:port`) with the given I/O timeout
    pub fn connect(name: impl Into<String>, address: &str, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let socket_addr: SocketAddr = address
            .to_socket_addrs()
            .map_err(|e| IvError::instrument(&name, format!("bad address {}: {}", address, e)))?
            .next()
            .ok_or_else(|| IvError::instrument(&name, format!("no address for {}", address)))?;

        tracing::debug!("Connecting to {} at {}", name, socket_addr);

        let stream = TcpStream::connect_timeout(&socket_addr, timeout)
            .map_err(|e| IvError::instrument(&name, format!("connect failed: {}", e)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            name,
            writer: stream,
            reader,
        })
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> IvError {
        IvError::instrument(&self.name, format!("{} failed: {}", action, e))
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, command: &str) -> Result<()> {
        tracing::trace!("{} <- {}", self.name, command);
        let line = format!("{}\n", command);
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| self.io_error("write", e))
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;

        let mut response = String::new();
        let read = self
            .reader
            .read_line(&mut response)
            .map_err(|e| self.io_error("read", e))?;
        if read == 0 {
            return Err(IvError::instrument(&self.name, "connection closed"));
        }

        let response = response.trim_end_matches(['\r', '\n']).to_string();
        tracing::trace!("{} -> {}", self.name, response);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_query_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "*IDN?\n");
            writer.write_all(b"KEITHLEY,MODEL 2420\r\n").unwrap();
        });

        let mut transport =
            TcpTransport::connect("source", &addr.to_string(), Duration::from_secs(2)).unwrap();
        let idn = transport.query("*IDN?").unwrap();
        assert_eq!(idn, "KEITHLEY,MODEL 2420");
        server.join().unwrap();
    }

    #[test]
    fn test_closed_connection_is_instrument_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut transport =
            TcpTransport::connect("matrix", &addr.to_string(), Duration::from_secs(2)).unwrap();
        server.join().unwrap();
        let result = transport.query("*IDN?");
        assert!(matches!(result, Err(IvError::InstrumentCommunication { .. })));
    }
}
