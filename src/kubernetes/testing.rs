// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Test doubles for cache population

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::source::{CacheSource, SyncReporter};

/// Kubernetes client pointed at an address nothing listens on
///
/// Building it performs no I/O, which is all the construction-only tests need.
pub fn offline_transport() -> kube::Client {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    kube::Client::try_from(config).unwrap()
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Synced,
    Failed,
    /// Never reports; waits for cancellation
    Never,
    /// Returns without reporting
    Abandon,
}

/// Cache source with a scripted first-snapshot outcome
pub struct FakeSource {
    name: String,
    outcome: Outcome,
    delay: Duration,
    started: Arc<AtomicBool>,
}

impl FakeSource {
    fn new(name: &str, outcome: Outcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            delay: Duration::ZERO,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn synced(name: &str) -> Self {
        Self::new(name, Outcome::Synced)
    }

    pub fn failing(name: &str) -> Self {
        Self::new(name, Outcome::Failed)
    }

    pub fn never_synced(name: &str) -> Self {
        Self::new(name, Outcome::Never)
    }

    pub fn abandoning(name: &str) -> Self {
        Self::new(name, Outcome::Abandon)
    }

    /// Report only after `delay`
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Flag set once the source's background task begins running
    pub fn started_flag(&self) -> Arc<AtomicBool> {
        self.started.clone()
    }
}

#[async_trait]
impl CacheSource for FakeSource {
    fn type_name(&self) -> String {
        self.name.clone()
    }

    async fn run(self: Box<Self>, reporter: SyncReporter, cancel: CancellationToken) {
        self.started.store(true, Ordering::SeqCst);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.delay) => {}
        }

        match self.outcome {
            Outcome::Synced => reporter.synced(),
            Outcome::Failed => reporter.failed(),
            Outcome::Never => {}
            Outcome::Abandon => return,
        }

        cancel.cancelled().await;
    }
}

type Responder = dyn Fn(usize) -> (u16, String) + Send + Sync;

/// Minimal HTTP stand-in for the API server
///
/// List requests are answered by the responder, which gets the zero-based
/// index of the list call. Watch requests get a 200 and are then held open
/// without events, like a quiet watch.
pub struct StubApi {
    addr: SocketAddr,
    lists: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

impl StubApi {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(usize) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let lists = Arc::new(AtomicUsize::new(0));
        let respond: Arc<Responder> = Arc::new(respond);

        let counter = lists.clone();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, counter.clone(), respond.clone()));
            }
        });

        Self {
            addr,
            lists,
            server,
        }
    }

    pub fn client(&self) -> kube::Client {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let config = kube::Config::new(format!("http://{}", self.addr).parse().unwrap());
        kube::Client::try_from(config).unwrap()
    }

    /// Number of list calls served so far
    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

impl Drop for StubApi {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(mut stream: TcpStream, lists: Arc<AtomicUsize>, respond: Arc<Responder>) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let request = String::from_utf8_lossy(&head);
    let target = request.split_whitespace().nth(1).unwrap_or_default();

    if target.contains("watch=true") {
        let headers = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                       Transfer-Encoding: chunked\r\n\r\n";
        if stream.write_all(headers.as_bytes()).await.is_ok() {
            // Keep the connection open until the client goes away
            let _ = stream.read(&mut buf).await;
        }
        return;
    }

    let (status, body) = respond(lists.fetch_add(1, Ordering::SeqCst));
    let reason = if status == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// `NamespaceList` body holding the given namespace names
pub fn namespace_list(names: &[&str]) -> String {
    let items: Vec<_> = names
        .iter()
        .map(|name| {
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": name, "resourceVersion": "1" },
            })
        })
        .collect();
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "NamespaceList",
        "metadata": { "resourceVersion": "1" },
        "items": items,
    })
    .to_string()
}

/// `Status` body of a failed API call
pub fn server_error() -> (u16, String) {
    let status = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "message": "etcd unavailable",
        "reason": "InternalError",
        "code": 500,
    });
    (500, status.to_string())
}
