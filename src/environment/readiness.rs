//! Bounded readiness polling.
//!
//! [`ReadinessPoller`] invokes a [`ReadinessProbe`] up to a fixed number of
//! attempts with a fixed interval between them, within a total budget of
//! `attempts × interval`. It succeeds on the first successful probe and
//! otherwise returns the last failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::environment::error::{ProbeError, ReadinessError};

/// Default number of probe attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Default pause between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Failures between two diagnostics.
const LOG_EVERY: u32 = 10;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// A check that reports whether a dependency is usable yet.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// What is being probed, for diagnostics.
    fn target(&self) -> String;

    /// Run the check once.
    async fn check(&self) -> Result<(), ProbeError>;
}

#[async_trait]
impl<P: ReadinessProbe + ?Sized> ReadinessProbe for Arc<P> {
    fn target(&self) -> String {
        (**self).target()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        (**self).check().await
    }
}

/// Retries a probe with a fixed interval until it succeeds or the attempt
/// budget runs out.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    max_attempts: u32,
    interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INTERVAL)
    }
}

impl ReadinessPoller {
    /// A budget of zero attempts is raised to one.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Total wall-clock budget: `max_attempts × interval`.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Poll `probe` until it succeeds, returning the number of attempts used.
    ///
    /// Never blocks past [`ReadinessPoller::budget`]: each check runs under
    /// the time left, and a check cut short counts as a timed-out attempt.
    pub async fn wait_until_ready(&self, probe: &dyn ReadinessProbe) -> Result<u32, ReadinessError> {
        let deadline = Instant::now() + self.budget();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match tokio::time::timeout(remaining, probe.check()).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout {
                    target: probe.target(),
                    timeout: remaining,
                }),
            };

            match result {
                Ok(()) => {
                    tracing::debug!("{} ready after {} attempt(s)", probe.target(), attempt);
                    return Ok(attempt);
                }
                Err(e) => {
                    if (attempt - 1) % LOG_EVERY == 0 {
                        tracing::warn!(
                            "{} not ready (attempt {}/{}): {}",
                            probe.target(),
                            attempt,
                            self.max_attempts,
                            e
                        );
                    }

                    if attempt >= self.max_attempts || Instant::now() >= deadline {
                        return Err(ReadinessError {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                }
            }

            let pause = self
                .interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }
}

/// Database connectivity probe: a TCP connect, no query.
///
/// A port published through a userland proxy accepts connections before the
/// container behind it listens, then closes them. After connecting, the
/// probe waits `settle` for the peer: a close or reset means not ready,
/// silence or data means ready.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    connect_timeout: Duration,
    settle: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(2),
            settle: Duration::from_millis(200),
        }
    }

    /// Probe `127.0.0.1:<port>`.
    pub fn localhost(port: u16) -> Self {
        Self::new(format!("127.0.0.1:{}", port))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn check(&self) -> Result<(), ProbeError> {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpStream;

        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(ProbeError::Connect {
                        target: self.addr.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(ProbeError::Timeout {
                        target: self.addr.clone(),
                        timeout: self.connect_timeout,
                    });
                }
            };

        let mut buf = [0u8; 64];
        match tokio::time::timeout(self.settle, stream.read(&mut buf)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(ProbeError::Unhealthy {
                target: self.addr.clone(),
                reason: "connection closed by peer".to_string(),
            }),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Connect {
                target: self.addr.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// HTTP probe: an unauthenticated GET.
///
/// Any response counts as ready unless [`HttpProbe::require_success`] is set.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
    require_success: bool,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
            require_success: false,
        }
    }

    /// Only count 2xx responses as ready.
    pub fn require_success(mut self) -> Self {
        self.require_success = true;
        self
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        match self.client.get(&self.url).send().await {
            Ok(resp) if self.require_success && !resp.status().is_success() => {
                Err(ProbeError::Unhealthy {
                    target: self.url.clone(),
                    reason: format!("status {}", resp.status()),
                })
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout {
                target: self.url.clone(),
                timeout: HTTP_TIMEOUT,
            }),
            Err(e) => Err(ProbeError::Connect {
                target: self.url.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Postgres connectivity probe: completes a connection handshake, no query.
#[cfg(feature = "postgres")]
pub struct PostgresProbe {
    connection_string: secrecy::SecretString,
    target: String,
}

#[cfg(feature = "postgres")]
impl PostgresProbe {
    /// `target` is a display name that must not contain credentials.
    pub fn new(connection_string: secrecy::SecretString, target: impl Into<String>) -> Self {
        Self {
            connection_string,
            target: target.into(),
        }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl ReadinessProbe for PostgresProbe {
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        use secrecy::ExposeSecret;

        let (client, connection) = tokio_postgres::connect(
            self.connection_string.expose_secret(),
            tokio_postgres::NoTls,
        )
        .await
        .map_err(|e| ProbeError::Connect {
            target: self.target.clone(),
            reason: e.to_string(),
        })?;

        drop(client);
        if let Err(e) = connection.await {
            tracing::debug!("{} connection closed with error: {}", self.target, e);
        }
        Ok(())
    }
}

/// SQL Server connectivity probe: completes a TDS login, no query.
#[cfg(feature = "mssql")]
pub struct MssqlProbe {
    host: String,
    port: u16,
    user: String,
    password: secrecy::SecretString,
}

#[cfg(feature = "mssql")]
impl MssqlProbe {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: secrecy::SecretString,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password,
        }
    }

    /// Log in to `127.0.0.1:<port>`.
    pub fn localhost(port: u16, user: impl Into<String>, password: secrecy::SecretString) -> Self {
        Self::new("127.0.0.1", port, user, password)
    }
}

#[cfg(feature = "mssql")]
#[async_trait]
impl ReadinessProbe for MssqlProbe {
    fn target(&self) -> String {
        format!("mssql://{}@{}:{}", self.user, self.host, self.port)
    }

    async fn check(&self) -> Result<(), ProbeError> {
        use secrecy::ExposeSecret;
        use tiberius::{AuthMethod, Client, Config};
        use tokio_util::compat::TokioAsyncWriteCompatExt;

        let connect_error = |reason: String| ProbeError::Connect {
            target: self.target(),
            reason,
        };

        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.authentication(AuthMethod::sql_server(
            &self.user,
            self.password.expose_secret(),
        ));
        config.trust_cert();

        let tcp = tokio::net::TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| connect_error(e.to_string()))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        if let Err(e) = client.close().await {
            tracing::debug!("{} close failed: {}", self.target(), e);
        }
        Ok(())
    }
}

/// Adapts an async closure into a probe.
pub struct FnProbe<F> {
    target: String,
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProbeError>> + Send,
{
    pub fn new(target: impl Into<String>, check: F) -> Self {
        Self {
            target: target.into(),
            check,
        }
    }
}

#[async_trait]
impl<F, Fut> ReadinessProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProbeError>> + Send,
{
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        (self.check)().await
    }
}
