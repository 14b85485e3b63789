use crate::parser;
use crate::protocol::{Command, Reply};
use crate::types::{Error, ResultT};
use bytes::{Buf, BytesMut};
use log::debug;
use std::convert::TryFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{rustls, TlsConnector};

pub const DEFAULT_PORT: u16 = 6379;
const READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub(crate) hostname: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
    pub(crate) db: u32,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) name: Option<String>,
    pub(crate) max_retry_count: u32,
    pub(crate) retry_interval: Duration,
}

impl ConnectOptions {
    pub fn new(hostname: impl Into<String>) -> ConnectOptions {
        ConnectOptions {
            hostname: hostname.into(),
            port: DEFAULT_PORT,
            tls: false,
            db: 0,
            password: None,
            name: None,
            max_retry_count: 0,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn port(mut self, port: u16) -> ConnectOptions {
        self.port = port;
        self
    }

    pub fn port_str(mut self, port: &str) -> ResultT<ConnectOptions> {
        self.port = parse_port(port)?;
        Ok(self)
    }

    pub fn tls(mut self, tls: bool) -> ConnectOptions {
        self.tls = tls;
        self
    }

    pub fn db(mut self, db: u32) -> ConnectOptions {
        self.db = db;
        self
    }

    pub fn password(mut self, password: impl Into<Vec<u8>>) -> ConnectOptions {
        self.password = Some(password.into());
        self
    }

    // surfaced through CLIENT SETNAME
    pub fn name(mut self, name: impl Into<String>) -> ConnectOptions {
        self.name = Some(name.into());
        self
    }

    // retries resend the command verbatim, keep this at zero for
    // non-idempotent commands
    pub fn max_retry_count(mut self, retries: u32) -> ConnectOptions {
        self.max_retry_count = retries;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> ConnectOptions {
        self.retry_interval = interval;
        self
    }
}

pub(crate) fn parse_port(input: &str) -> ResultT<u16> {
    input
        .parse::<u16>()
        .map_err(|_| Error::InvalidArgument(format!("invalid port {:?}", input)))
}

// plain TCP or rustls wrapped, one type for the rest of the crate
pub(crate) enum WireStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for WireStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WireStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WireStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            WireStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WireStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WireStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn dial(opts: &ConnectOptions) -> ResultT<WireStream> {
    let stream = TcpStream::connect((opts.hostname.as_str(), opts.port)).await?;
    if !opts.tls {
        return Ok(WireStream::Tcp(stream));
    }
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let domain = rustls::ServerName::try_from(opts.hostname.as_str())
        .map_err(|_| Error::InvalidArgument(format!("invalid tls hostname {:?}", opts.hostname)))?;
    let tls = connector.connect(domain, stream).await?;
    Ok(WireStream::Tls(Box::new(tls)))
}

// accumulates socket bytes, hands out one decoded frame per call
pub(crate) struct FrameReader<R> {
    reader: R,
    buff: BytesMut,
    failed: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R) -> FrameReader<R> {
        FrameReader {
            reader,
            buff: BytesMut::with_capacity(READ_BUFFER_SIZE),
            failed: false,
        }
    }

    pub(crate) async fn read_reply(&mut self) -> ResultT<Reply> {
        if self.failed {
            return Err(Error::ConnectionClosed);
        }
        match self.read_reply_inner().await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }

    async fn read_reply_inner(&mut self) -> ResultT<Reply> {
        loop {
            if let Some(reply) = self.parse_frame()? {
                return Ok(reply);
            }
            if self.buff.capacity() == self.buff.len() {
                self.buff.reserve(READ_BUFFER_SIZE);
            }
            let n = self.reader.read_buf(&mut self.buff).await?;
            debug!("read {} bytes from socket", n);
            if n == 0 {
                return Err(if self.buff.is_empty() {
                    Error::ConnectionClosed
                } else {
                    Error::protocol("connection closed in the middle of a frame")
                });
            }
        }
    }

    fn parse_frame(&mut self) -> ResultT<Option<Reply>> {
        let size = self.buff.len();
        let (consumed, reply) = match parser::read(&self.buff) {
            Ok((rem, reply)) => (size - rem.len(), Some(reply)),
            Err(nom::Err::Incomplete(_)) => (0, None),
            Err(err) => return Err(Error::protocol(format!("bad reply frame: {}", err))),
        };
        self.buff.advance(consumed);
        Ok(reply)
    }
}

// a whole command (or a whole pipeline batch) is coalesced before flush
// puts it on the wire
pub(crate) struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWriteExt + Unpin + Send> FrameWriter<W> {
    pub(crate) fn new(writer: W) -> FrameWriter<W> {
        FrameWriter { writer }
    }

    pub(crate) async fn write_command(&mut self, cmd: &Command, flush: bool) -> ResultT<()> {
        cmd.write_async(&mut self.writer, flush).await
    }

    pub(crate) async fn flush(&mut self) -> ResultT<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) {
        // close is idempotent, a failure here means the peer beat us to it
        let _ = self.writer.shutdown().await;
    }
}

pub(crate) type WireReader = FrameReader<ReadHalf<WireStream>>;
pub(crate) type WireWriter = FrameWriter<BufWriter<WriteHalf<WireStream>>>;

pub(crate) struct Connection {
    pub(crate) reader: WireReader,
    pub(crate) writer: WireWriter,
}

impl Connection {
    // dial, then AUTH / SELECT / CLIENT SETNAME as configured; any
    // handshake failure closes the socket
    pub(crate) async fn establish(opts: &ConnectOptions) -> ResultT<Connection> {
        let stream = dial(opts).await?;
        let (r, w) = tokio::io::split(stream);
        let mut conn = Connection {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(BufWriter::new(w)),
        };
        if let Some(password) = &opts.password {
            let auth = Command::new("AUTH").arg(password.as_slice());
            conn.handshake_step(auth, "authentication").await?;
        }
        if opts.db != 0 {
            let select = Command::new("SELECT").arg(opts.db);
            conn.handshake_step(select, "database selection").await?;
        }
        if let Some(name) = &opts.name {
            let setname = Command::new("CLIENT").arg("SETNAME").arg(name);
            conn.handshake_step(setname, "client naming").await?;
        }
        debug!("connection to {}:{} established", opts.hostname, opts.port);
        Ok(conn)
    }

    async fn handshake_step(&mut self, cmd: Command, what: &str) -> ResultT<()> {
        let reply = match self.exchange(&cmd).await {
            Ok(reply) => reply,
            Err(err) => {
                self.shutdown().await;
                return Err(err);
            }
        };
        match reply {
            Reply::Status(_) => Ok(()),
            Reply::Error(msg) => {
                self.shutdown().await;
                Err(Error::Server(msg))
            }
            other => {
                self.shutdown().await;
                Err(Error::protocol(format!(
                    "{} rejected with {:?}",
                    what, other
                )))
            }
        }
    }

    pub(crate) async fn exchange(&mut self, cmd: &Command) -> ResultT<Reply> {
        self.writer.write_command(cmd, true).await?;
        self.reader.read_reply().await
    }

    // cheap liveness check before a full reconnect
    pub(crate) async fn probe(&mut self) -> bool {
        matches!(
            self.exchange(&Command::new("PING")).await,
            Ok(Reply::Status(_))
        )
    }

    pub(crate) async fn shutdown(&mut self) {
        self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    pub fn test_parse_port() {
        assert_eq!(parse_port("6379").unwrap(), 6379);
        assert_eq!(parse_port("1").unwrap(), 1);
        assert!(parse_port("").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("70000").is_err());
        assert!(parse_port("6379a").is_err());
    }

    #[test]
    pub fn test_options_defaults() {
        let opts = ConnectOptions::new("localhost");
        assert_eq!(opts.port, DEFAULT_PORT);
        assert_eq!(opts.db, 0);
        assert!(!opts.tls);
        assert_eq!(opts.max_retry_count, 0);
        assert_eq!(opts.retry_interval, Duration::from_millis(1200));
    }

    #[tokio::test]
    pub async fn test_read_reply_across_chunks() -> ResultT<()> {
        let (mut server, client) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);
        server.write_all(b"$11\r\nhello").await?;
        server.flush().await?;
        let pending = tokio::spawn(async move {
            server.write_all(b" world\r\n").await.unwrap();
            server
        });
        let reply = reader.read_reply().await?;
        assert_eq!(reply, Reply::Bulk(b"hello world".to_vec()));
        pending.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    pub async fn test_read_reply_sequencing() -> ResultT<()> {
        let (mut server, client) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);
        server.write_all(b"+OK\r\n:42\r\n").await?;
        assert_eq!(reader.read_reply().await?, Reply::Status("OK".into()));
        assert_eq!(reader.read_reply().await?, Reply::Integer(42));
        Ok(())
    }

    #[tokio::test]
    pub async fn test_clean_eof_is_closed() -> ResultT<()> {
        let (server, client) = tokio::io::duplex(64);
        drop(server);
        let mut reader = FrameReader::new(client);
        match reader.read_reply().await {
            Err(Error::ConnectionClosed) => (),
            other => panic!("expected closed, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    pub async fn test_eof_mid_frame_is_protocol_error() -> ResultT<()> {
        let (mut server, client) = tokio::io::duplex(64);
        server.write_all(b"$5\r\nhel").await?;
        drop(server);
        let mut reader = FrameReader::new(client);
        match reader.read_reply().await {
            Err(Error::Protocol(_)) => (),
            other => panic!("expected protocol error, got {:?}", other),
        }
        // the failure latches, later reads report closed
        match reader.read_reply().await {
            Err(Error::ConnectionClosed) => (),
            other => panic!("expected closed after failure, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    pub async fn test_malformed_frame_is_protocol_error() -> ResultT<()> {
        let (mut server, client) = tokio::io::duplex(64);
        server.write_all(b"!nope\r\n").await?;
        let mut reader = FrameReader::new(client);
        match reader.read_reply().await {
            Err(Error::Protocol(_)) => (),
            other => panic!("expected protocol error, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    pub async fn test_write_command_is_buffered_until_flush() -> ResultT<()> {
        let (client, mut server) = tokio::io::duplex(256);
        let mut writer = FrameWriter::new(BufWriter::new(client));
        writer
            .write_command(&Command::new("SET").arg("a").arg(1u32), false)
            .await?;
        writer
            .write_command(&Command::new("GET").arg("a"), true)
            .await?;
        let mut received = vec![0u8; 128];
        let n = server.read(&mut received).await?;
        assert_eq!(
            &received[..n],
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n".as_ref()
        );
        Ok(())
    }
}
