// Local preview servers for built web projects

use crate::locks::KeyedLocks;
use anyhow::{Context, Result};
use axum::serve::Listener;
use axum::Router;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// How long a stopping server may drain connections before it is aborted
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running static file server for one project
#[derive(Debug)]
pub struct PreviewSession {
    pub project_name: String,
    pub directory: PathBuf,
    pub port: u16,
    shutdown: CancellationToken,
    sever: CancellationToken,
    handle: JoinHandle<()>,
}

impl PreviewSession {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/index.html", self.port)
    }

    pub fn info(&self) -> PreviewInfo {
        PreviewInfo {
            project_name: self.project_name.clone(),
            directory: self.directory.clone(),
            port: self.port,
            url: self.url(),
        }
    }

    /// Drain connections for up to `grace`, then cut the remaining ones and
    /// abort the server task.
    async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => tracing::info!(
                "Stopped preview for {} on port {}",
                self.project_name,
                self.port
            ),
            Err(_) => {
                tracing::warn!(
                    "Preview for {} did not stop within {:?}, aborting",
                    self.project_name,
                    grace
                );
                self.sever.cancel();
                handle.abort();
            }
        }
    }
}

/// Loopback listener whose connections fail once `sever` is cancelled. Aborting
/// the serve task leaves its spawned connection tasks running, so they are
/// ended through their sockets instead.
struct SeverableListener {
    inner: TcpListener,
    sever: CancellationToken,
}

impl Listener for SeverableListener {
    type Io = SeverableStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, addr) = Listener::accept(&mut self.inner).await;
        (SeverableStream::new(stream, self.sever.clone()), addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Listener::local_addr(&self.inner)
    }
}

struct SeverableStream<S> {
    inner: S,
    sever: CancellationToken,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> SeverableStream<S> {
    fn new(inner: S, sever: CancellationToken) -> Self {
        let severed = Box::pin(sever.clone().cancelled_owned());
        Self {
            inner,
            sever,
            severed,
        }
    }

    fn check(&mut self, cx: &mut TaskContext<'_>) -> io::Result<()> {
        // Polling registers the waker, so a blocked read or write wakes on cancel
        if self.sever.is_cancelled() || self.severed.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "preview stopped"));
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SeverableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Err(e) = self.check(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SeverableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = self.check(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Serializable view of a running session
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PreviewInfo {
    pub project_name: String,
    pub directory: PathBuf,
    pub port: u16,
    pub url: String,
}

/// Tracks at most one preview server per project
pub struct PreviewRegistry {
    sessions: Mutex<HashMap<String, PreviewSession>>,
    locks: KeyedLocks,
    grace: Duration,
}

impl Default for PreviewRegistry {
    fn default() -> Self {
        Self::with_grace(SHUTDOWN_GRACE)
    }
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose servers get `grace` to drain connections when stopped
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
            grace,
        }
    }

    /// Serve `directory` on a fresh loopback port, replacing any running
    /// session for the same project.
    pub async fn start(&self, project_name: &str, directory: &Path) -> Result<PreviewInfo> {
        let _guard = self.locks.lock(project_name).await;

        if let Some(previous) = self.take(project_name) {
            tracing::info!("Superseding preview for {} on port {}", project_name, previous.port);
            previous.shutdown(self.grace).await;
        }

        // The bound listener goes straight to the server, so the port cannot be lost
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .context("Failed to bind preview listener")?;
        let port = listener.local_addr()?.port();

        let app = Router::new()
            .fallback_service(ServeDir::new(directory))
            .layer(TraceLayer::new_for_http());

        let shutdown = CancellationToken::new();
        let sever = CancellationToken::new();
        let listener = SeverableListener {
            inner: listener,
            sever: sever.clone(),
        };
        let signal = shutdown.clone();
        let name = project_name.to_string();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("Preview server for {} failed: {}", name, e);
            }
        });

        let session = PreviewSession {
            project_name: project_name.to_string(),
            directory: directory.to_path_buf(),
            port,
            shutdown,
            sever,
            handle,
        };
        let info = session.info();
        tracing::info!("Preview for {} serving {} at {}", project_name, directory.display(), info.url);

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_name.to_string(), session);
        Ok(info)
    }

    /// Stop the project's preview. Returns false when none was running.
    pub async fn stop(&self, project_name: &str) -> bool {
        let _guard = self.locks.lock(project_name).await;
        match self.take(project_name) {
            Some(session) => {
                session.shutdown(self.grace).await;
                true
            }
            None => false,
        }
    }

    /// Stop every running preview
    pub async fn stop_all(&self) {
        let sessions: Vec<PreviewSession> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();
        if !sessions.is_empty() {
            tracing::info!("Stopping {} preview server(s)", sessions.len());
        }
        futures_util::future::join_all(sessions.into_iter().map(|s| s.shutdown(self.grace))).await;
    }

    pub fn get(&self, project_name: &str) -> Option<PreviewInfo> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(project_name)
            .map(PreviewSession::info)
    }

    pub fn list(&self) -> Vec<PreviewInfo> {
        let mut sessions: Vec<PreviewInfo> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(PreviewSession::info)
            .collect();
        sessions.sort_by(|a, b| a.project_name.cmp(&b.project_name));
        sessions
    }

    fn take(&self, project_name: &str) -> Option<PreviewSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project_name)
    }
}
