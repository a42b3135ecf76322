use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Error, Result};

/// One memcached text-protocol connection.
///
/// Endpoints: a path containing `/` connects over a Unix socket, `:<port>`
/// or a bare port over loopback TCP, `host:port` over TCP.
pub struct CacheConn {
    reader: BufReader<CacheStream>,
    writer: CacheStream,
}

enum CacheStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl CacheStream {
    fn try_clone(&self) -> Result<CacheStream> {
        Ok(match self {
            CacheStream::Tcp(s) => CacheStream::Tcp(s.try_clone()?),
            CacheStream::Unix(s) => CacheStream::Unix(s.try_clone()?),
        })
    }

    fn set_timeouts(&self, timeout: Duration) -> Result<()> {
        let timeout = (timeout > Duration::ZERO).then_some(timeout);
        match self {
            CacheStream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)?;
            }
            CacheStream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)?;
            }
        }
        Ok(())
    }
}

impl Read for CacheStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CacheStream::Tcp(s) => s.read(buf),
            CacheStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for CacheStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CacheStream::Tcp(s) => s.write(buf),
            CacheStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CacheStream::Tcp(s) => s.flush(),
            CacheStream::Unix(s) => s.flush(),
        }
    }
}

impl CacheConn {
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<CacheConn> {
        let stream = if endpoint.contains('/') {
            CacheStream::Unix(UnixStream::connect(endpoint)?)
        } else {
            let addr = if let Some(port) = endpoint.strip_prefix(':') {
                format!("127.0.0.1:{port}")
            } else if endpoint.contains(':') {
                endpoint.to_string()
            } else {
                format!("127.0.0.1:{endpoint}")
            };
            let addr: SocketAddr = addr
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| Error::CacheProtocol(format!("bad endpoint {endpoint}")))?;
            CacheStream::Tcp(TcpStream::connect_timeout(&addr, timeout)?)
        };
        stream.set_timeouts(timeout)?;
        let writer = stream.try_clone()?;
        Ok(CacheConn {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn set(&mut self, key: &str, flags: u16, expiry: u64, value: &[u8]) -> Result<bool> {
        write!(self.writer, "set {key} {flags} {expiry} {}\r\n", value.len())?;
        self.writer.write_all(value)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        match self.read_line()?.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" => Ok(false),
            other => Err(Error::CacheProtocol(format!("unexpected set reply: {other}"))),
        }
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        write!(self.writer, "get {key}\r\n")?;
        self.writer.flush()?;
        let line = self.read_line()?;
        if line == "END" {
            return Ok(None);
        }
        let mut parts = line.split(' ');
        let (Some("VALUE"), _key, _flags, Some(len)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::CacheProtocol(format!("unexpected get reply: {line}")));
        };
        let len: usize = len
            .parse()
            .map_err(|_| Error::CacheProtocol(format!("bad value length in: {line}")))?;
        let mut value = vec![0u8; len + 2];
        self.reader.read_exact(&mut value)?;
        value.truncate(len);
        match self.read_line()?.as_str() {
            "END" => Ok(Some(value)),
            other => Err(Error::CacheProtocol(format!("unexpected get tail: {other}"))),
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<bool> {
        write!(self.writer, "delete {key}\r\n")?;
        self.writer.flush()?;
        match self.read_line()?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(Error::CacheProtocol(format!(
                "unexpected delete reply: {other}"
            ))),
        }
    }

    /// Raw `STAT` lines for the given subcommand ("" for the default set).
    pub fn stats(&mut self, subcommand: &str) -> Result<Vec<u8>> {
        if subcommand.is_empty() {
            write!(self.writer, "stats\r\n")?;
        } else {
            write!(self.writer, "stats {subcommand}\r\n")?;
        }
        self.writer.flush()?;
        let mut out = Vec::new();
        loop {
            let line = self.read_line()?;
            if line == "END" {
                return Ok(out);
            }
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            return Err(Error::CacheProtocol("connection closed".into()));
        }
        if line == "ERROR"
            || line.starts_with("CLIENT_ERROR")
            || line.starts_with("SERVER_ERROR")
        {
            return Err(Error::CacheProtocol(line));
        }
        Ok(line)
    }
}
