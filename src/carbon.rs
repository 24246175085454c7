//! Carbon plaintext protocol: `<metric.path> <value> <timestamp>\n`.
//!
//! [`CarbonConnection`] owns the socket to the collector and reopens it on
//! request; [`WriterSink`] sends the same lines to a local writer instead.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, info};

/// Largest UDP payload sent in one datagram.
const MAX_DATAGRAM: usize = 1400;

/// A metric value. Floats are rendered with three decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(u64),
    Float(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

/// Render one plaintext protocol line.
pub fn format_line(name: &str, value: MetricValue, timestamp: i64) -> String {
    format!("{} {} {}\n", name, value, timestamp)
}

/// Destination of rendered metric lines.
#[async_trait]
pub trait MetricsSink: Send {
    /// Write all lines of one window and flush them.
    async fn send(&mut self, payload: &str) -> io::Result<()>;

    /// Drop the current connection and open a new one.
    async fn reconnect(&mut self) -> io::Result<()>;
}

enum Conn {
    Tcp(BufWriter<TcpStream>),
    Udp(UdpSocket),
}

/// Connection to a carbon collector over TCP or UDP.
pub struct CarbonConnection {
    host: String,
    port: u16,
    use_udp: bool,
    conn: Option<Conn>,
}

impl CarbonConnection {
    pub fn new(host: impl Into<String>, port: u16, use_udp: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_udp,
            conn: None,
        }
    }

    /// Resolve the collector and connect to the first address that accepts.
    pub async fn connect(&mut self) -> io::Result<()> {
        self.conn = None;
        let mut last_error = None;

        for addr in lookup_host((self.host.as_str(), self.port)).await? {
            let attempt = if self.use_udp {
                let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                match UdpSocket::bind(bind).await {
                    Ok(socket) => socket.connect(addr).await.map(|_| Conn::Udp(socket)),
                    Err(e) => Err(e),
                }
            } else {
                TcpStream::connect(addr)
                    .await
                    .map(|stream| Conn::Tcp(BufWriter::new(stream)))
            };

            match attempt {
                Ok(conn) => {
                    info!(address = %addr, udp = self.use_udp, "Connected to carbon");
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!(address = %addr, error = %e, "Carbon address refused");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}:{}", self.host, self.port),
            )
        }))
    }
}

#[async_trait]
impl MetricsSink for CarbonConnection {
    async fn send(&mut self, payload: &str) -> io::Result<()> {
        if self.conn.is_none() {
            self.connect().await?;
        }

        match self.conn.as_mut() {
            Some(Conn::Tcp(stream)) => {
                stream.write_all(payload.as_bytes()).await?;
                stream.flush().await
            }
            Some(Conn::Udp(socket)) => {
                for datagram in datagrams(payload, MAX_DATAGRAM) {
                    socket.send(datagram.as_bytes()).await?;
                }
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "carbon not connected")),
        }
    }

    async fn reconnect(&mut self) -> io::Result<()> {
        self.connect().await
    }
}

/// Split a payload into chunks of whole lines no longer than `limit` bytes.
/// A single line longer than `limit` travels alone.
fn datagrams(payload: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for (idx, _) in payload.match_indices('\n') {
        let line_end = idx + 1;
        if line_end - start > limit && end > start {
            chunks.push(&payload[start..end]);
            start = end;
        }
        end = line_end;
    }
    if end < payload.len() {
        end = payload.len();
    }
    if end > start {
        chunks.push(&payload[start..end]);
    }
    chunks
}

/// Sends metric lines to a local writer (stdout in local output mode).
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MetricsSink for WriterSink<W> {
    async fn send(&mut self, payload: &str) -> io::Result<()> {
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn reconnect(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_metric_value_formatting() {
        assert_eq!(MetricValue::Float(1.0).to_string(), "1.000");
        assert_eq!(MetricValue::Float(0.12345).to_string(), "0.123");
        assert_eq!(MetricValue::Int(42).to_string(), "42");
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line("a.b.count", MetricValue::Int(3), 1000),
            "a.b.count 3 1000\n"
        );
    }

    #[test]
    fn test_datagrams_split_on_line_boundaries() {
        let payload = "aaaa 1 1\nbbbb 2 1\ncccc 3 1\n";
        assert_eq!(datagrams(payload, 100), vec![payload]);
        assert_eq!(
            datagrams(payload, 18),
            vec!["aaaa 1 1\nbbbb 2 1\n", "cccc 3 1\n"]
        );
        assert_eq!(datagrams("x\n", 0), vec!["x\n"]);
        assert!(datagrams("", 10).is_empty());
    }

    #[tokio::test]
    async fn test_tcp_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut conn = CarbonConnection::new("127.0.0.1", port, false);
        let (send, accepted) = tokio::join!(conn.send("x.y 1 10\n"), listener.accept());
        send.unwrap();

        let (mut socket, _) = accepted.unwrap();
        drop(conn);
        let mut received = String::new();
        socket.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "x.y 1 10\n");
    }

    #[tokio::test]
    async fn test_udp_send() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let mut conn = CarbonConnection::new("127.0.0.1", port, true);
        conn.send("x.y 1.500 10\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x.y 1.500 10\n");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut conn = CarbonConnection::new("127.0.0.1", port, false);
        assert!(conn.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_writer_sink() {
        let mut sink = WriterSink::new(Vec::new());
        sink.send("a 1 1\n").await.unwrap();
        sink.reconnect().await.unwrap();
        sink.send("b 2 1\n").await.unwrap();
        assert_eq!(sink.writer, b"a 1 1\nb 2 1\n");
    }
}
