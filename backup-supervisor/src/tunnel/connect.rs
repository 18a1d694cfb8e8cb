//! HTTP CONNECT dialer over mutual TLS.

use super::{Dialer, TunnelConn};
use crate::config::TunnelConfig;
use crate::utils::{Result, SupervisorError};
use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Method};
use std::path::Path;
use tracing::debug;

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| SupervisorError::Config(format!("read {} {}: {}", what, path.display(), e)))
}

pub struct ConnectDialer {
    client: Client,
    url: String,
}

impl ConnectDialer {
    /// Dial `url` (scheme and authority) with an already configured client.
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }

    pub fn from_config(config: &TunnelConfig) -> Result<Self> {
        if config.target_address.is_empty() {
            return Err(SupervisorError::Config("tunnel target address is empty".to_string()));
        }

        let ca = read_pem(&config.ca_file, "CA bundle")?;
        let mut identity = read_pem(&config.cert_file, "client certificate")?;
        identity.extend(read_pem(&config.key_file, "client key")?);

        let client = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(Certificate::from_pem(&ca)?)
            .identity(Identity::from_pem(&identity)?)
            .http2_prior_knowledge()
            .connect_timeout(config.dial_timeout())
            .build()?;

        Ok(Self::new(client, format!("https://{}", config.target_address)))
    }
}

#[async_trait]
impl Dialer for ConnectDialer {
    async fn dial(&self) -> Result<Box<dyn TunnelConn>> {
        let response = self
            .client
            .request(Method::CONNECT, &self.url)
            .send()
            .await
            .map_err(|e| SupervisorError::Transport(format!("CONNECT {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::Transport(format!(
                "CONNECT {} returned {}",
                self.url, status
            )));
        }
        let version = response.version();

        // The tunnel bytes only flow on the upgraded stream, never the response body
        let upgraded = response
            .upgrade()
            .await
            .map_err(|e| SupervisorError::Transport(format!("CONNECT {} upgrade: {}", self.url, e)))?;
        debug!(address = %self.url, "CONNECT established ({:?})", version);

        Ok(Box::new(upgraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Empty;
    use hyper::body::Incoming;
    use hyper::server::conn::http2;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// h2c proxy answering CONNECT with `status` and echoing the tunnel
    async fn echo_proxy(status: StatusCode) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(move |req: Request<Incoming>| async move {
                assert_eq!(req.method(), Method::CONNECT);
                if status.is_success() {
                    tokio::spawn(async move {
                        let Ok(upgraded) = hyper::upgrade::on(req).await else {
                            return;
                        };
                        let mut io = TokioIo::new(upgraded);
                        let mut buf = [0u8; 1024];
                        while let Ok(n) = io.read(&mut buf).await {
                            if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                let mut response = Response::new(Empty::<Bytes>::new());
                *response.status_mut() = status;
                Ok::<_, Infallible>(response)
            });
            let _ = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
        addr
    }

    fn h2c_dialer(addr: SocketAddr) -> ConnectDialer {
        let client = Client::builder().http2_prior_knowledge().build().unwrap();
        ConnectDialer::new(client, format!("http://{}", addr))
    }

    #[test]
    fn test_empty_target_is_rejected() {
        let err = ConnectDialer::from_config(&TunnelConfig::default()).err().unwrap();
        assert!(matches!(err, SupervisorError::Config(_)));
    }

    #[test]
    fn test_missing_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let config = TunnelConfig {
            target_address: "backup.example:443".to_string(),
            ca_file: dir.path().join("ca.pem"),
            ..Default::default()
        };
        let err = ConnectDialer::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("CA bundle"));
    }

    #[tokio::test]
    async fn test_dial_round_trips_bytes() {
        let dialer = h2c_dialer(echo_proxy(StatusCode::OK).await);
        let mut conn = dialer.dial().await.unwrap();

        for message in [&b"ping"[..], &b"second message"[..]] {
            conn.write_all(message).await.unwrap();
            conn.flush().await.unwrap();
            let mut echoed = vec![0u8; message.len()];
            tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut echoed))
                .await
                .expect("echo within timeout")
                .unwrap();
            assert_eq!(echoed, message);
        }
    }

    #[tokio::test]
    async fn test_refused_connect_is_transport_error() {
        let dialer = h2c_dialer(echo_proxy(StatusCode::FORBIDDEN).await);
        let err = dialer.dial().await.err().unwrap();
        assert!(matches!(err, SupervisorError::Transport(_)));
        assert!(err.to_string().contains("403"));
    }
}
