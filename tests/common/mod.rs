//! Shared helpers for integration tests: a server on an ephemeral port and
//! a raw HTTP/1.x client that shows exactly what went over the wire.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use wirehttp::{handler_fn, Dispatcher, Handler, HttpServer, Listener, ServerConfig, Shutdown};

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<()>,
}

pub async fn start(dispatcher: Arc<Dispatcher>) -> TestServer {
    start_with(ServerConfig::default(), dispatcher).await
}

pub async fn start_with(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> TestServer {
    let server = HttpServer::new(&config, dispatcher).unwrap();
    start_server(config, server).await
}

pub async fn start_server(mut config: ServerConfig, server: HttpServer) -> TestServer {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    let handle = tokio::spawn(async move { server.run(listener, signal).await });
    TestServer {
        addr,
        shutdown,
        handle,
    }
}

/// Responds `200 text/plain` with `text`.
pub fn text(text: &'static str) -> Arc<dyn Handler> {
    handler_fn(move |_req, res| {
        Box::pin(async move {
            res.send_text(http::StatusCode::OK, text).await?;
            Ok(())
        })
    })
}

/// Reads the whole request body and sends it back.
pub fn echo() -> Arc<dyn Handler> {
    handler_fn(|req, res| {
        Box::pin(async move {
            let body = req.read_body_to_end(1 << 20).await?;
            res.send(body).await?;
            Ok(())
        })
    })
}

#[derive(Debug)]
pub struct RawResponse {
    pub version: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    pub async fn send(&mut self, raw: impl AsRef<[u8]>) {
        self.stream.write_all(raw.as_ref()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Status line and headers only.
    pub async fn head(&mut self) -> RawResponse {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        let mut parts = line.trim_end().splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("bad status line {line:?}"));

        let mut headers = Vec::new();
        loop {
            line.clear();
            self.stream.read_line(&mut line).await.unwrap();
            let l = line.trim_end();
            if l.is_empty() {
                break;
            }
            let (name, value) = l.split_once(':').unwrap();
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        RawResponse {
            version,
            status,
            headers,
            body: Vec::new(),
        }
    }

    /// A full response, body framed per its headers.
    pub async fn response(&mut self) -> RawResponse {
        let mut res = self.head().await;
        if res.status < 200 || res.status == 204 || res.status == 304 {
            return res;
        }
        if let Some(len) = res.header("content-length") {
            let mut body = vec![0u8; len.parse().unwrap()];
            self.stream.read_exact(&mut body).await.unwrap();
            res.body = body;
        } else if res
            .header("transfer-encoding")
            .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
        {
            res.body = self.read_chunked().await;
        } else {
            self.stream.read_to_end(&mut res.body).await.unwrap();
        }
        res
    }

    async fn read_chunked(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            self.stream.read_line(&mut line).await.unwrap();
            let size = line.trim_end().split(';').next().unwrap();
            let size = usize::from_str_radix(size.trim(), 16).unwrap();
            if size == 0 {
                // Trailers up to the blank line.
                loop {
                    line.clear();
                    self.stream.read_line(&mut line).await.unwrap();
                    if line.trim_end().is_empty() {
                        return body;
                    }
                }
            }
            let start = body.len();
            body.resize(start + size, 0);
            self.stream.read_exact(&mut body[start..]).await.unwrap();
            let mut crlf = [0u8; 2];
            self.stream.read_exact(&mut crlf).await.unwrap();
            assert_eq!(&crlf, b"\r\n");
        }
    }

    /// True if the server closes its side without sending anything more.
    /// Gives up after a few seconds on a connection that stays open.
    pub async fn is_closed(&mut self) -> bool {
        let mut rest = Vec::new();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.stream.read_to_end(&mut rest),
        )
        .await;
        match read {
            Ok(Ok(_)) => rest.is_empty(),
            // Reset by peer.
            Ok(Err(_)) => rest.is_empty(),
            Err(_) => false,
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    pub fn into_inner(self) -> BufReader<TcpStream> {
        self.stream
    }
}
