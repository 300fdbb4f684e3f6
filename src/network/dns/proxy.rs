//! UDP DNS proxy enforcing hostname policy inside the namespace.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::network::dns::packet::{nxdomain, parse_query};
use crate::network::filter::{HostDecision, HostFilter};

/// Largest datagram accepted from clients or upstream.
const MAX_DATAGRAM: usize = 4096;

/// How long to wait for the upstream resolver.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters for debug output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub forwarded: u64,
    pub blocked: u64,
    pub dropped: u64,
}

/// DNS proxy bound to a UDP socket, not yet serving.
pub struct DnsProxy {
    socket: UdpSocket,
    filter: Arc<HostFilter>,
    upstream: SocketAddr,
    timeout: Duration,
}

impl DnsProxy {
    /// Bind the listening socket. Binding happens before anything else so
    /// the port is owned by the proxy before the sandboxed command exists.
    pub async fn bind(
        addr: SocketAddr,
        filter: HostFilter,
        upstream: SocketAddr,
    ) -> Result<Self, SandboxError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SandboxError::Proxy(format!("failed to bind {}: {}", addr, e)))?;
        tracing::debug!("DNS proxy listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            filter: Arc::new(filter),
            upstream,
            timeout: UPSTREAM_TIMEOUT,
        })
    }

    /// Override the upstream timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SandboxError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until `token` is cancelled.
    pub fn start(self, token: CancellationToken) -> ProxyHandle {
        let stats = Arc::new(Mutex::new(ProxyStats::default()));
        let socket = Arc::new(self.socket);
        let filter = self.filter;
        let upstream = self.upstream;
        let timeout = self.timeout;
        let task_stats = stats.clone();
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, client) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::debug!("DNS proxy receive error: {}", e);
                                continue;
                            }
                        };
                        let query = buf[..len].to_vec();
                        let socket = socket.clone();
                        let filter = filter.clone();
                        let stats = task_stats.clone();
                        let token = task_token.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = handle_query(&socket, client, query, &filter, upstream, timeout, &stats) => {}
                            }
                        });
                    }
                }
            }
            tracing::debug!("DNS proxy stopped");
        });

        ProxyHandle { token, task, stats }
    }
}

async fn handle_query(
    socket: &UdpSocket,
    client: SocketAddr,
    query: Vec<u8>,
    filter: &HostFilter,
    upstream: SocketAddr,
    timeout: Duration,
    stats: &Mutex<ProxyStats>,
) {
    let Some(question) = parse_query(&query) else {
        stats.lock().dropped += 1;
        return;
    };

    let response = match filter.check(&question.name) {
        HostDecision::Block => {
            tracing::debug!("DNS blocked: {}", question.name);
            stats.lock().blocked += 1;
            nxdomain(&query, &question).to_vec()
        }
        HostDecision::Forward => match forward(&query, upstream, timeout).await {
            Ok(response) => {
                stats.lock().forwarded += 1;
                response
            }
            Err(e) => {
                tracing::debug!("DNS forward of {} failed: {}", question.name, e);
                stats.lock().dropped += 1;
                return;
            }
        },
    };

    if let Err(e) = socket.send_to(&response, client).await {
        tracing::debug!("DNS proxy send to {} failed: {}", client, e);
    }
}

/// Relay one query over a fresh ephemeral socket and return the raw answer.
async fn forward(query: &[u8], upstream: SocketAddr, timeout: Duration) -> std::io::Result<Vec<u8>> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(upstream).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timeout"))??;
    buf.truncate(len);
    Ok(buf)
}

/// A running proxy.
pub struct ProxyHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<Mutex<ProxyStats>>,
}

impl ProxyHandle {
    pub fn stats(&self) -> ProxyStats {
        *self.stats.lock()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop serving and wait for the listener task to exit.
    pub async fn stop(mut self) -> ProxyStats {
        self.token.cancel();
        if let Err(e) = (&mut self.task).await {
            tracing::debug!("DNS proxy task ended abnormally: {}", e);
        }
        let stats = *self.stats.lock();
        tracing::debug!(
            "DNS proxy: {} forwarded, {} blocked, {} dropped",
            stats.forwarded,
            stats.blocked,
            stats.dropped
        );
        stats
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
