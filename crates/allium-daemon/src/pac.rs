//! Proxy auto-configuration service.
//!
//! Serves a static PAC file sending `*.i2p` hosts to the HTTP proxy and
//! everything else DIRECT.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// The auto-config listener.
#[derive(Clone)]
pub struct PacService {
    inner: Arc<PacInner>,
}

struct PacInner {
    port: u16,
    response: String,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PacService {
    pub fn new(port: u16, http_proxy_port: u16) -> Self {
        let body = format!(
            "function FindProxyForURL(url, host) {{\r\n\
             \tif (shExpMatch(host, \"*.i2p\"))\r\n\
             \t\treturn \"PROXY 127.0.0.1:{http_proxy_port}\";\r\n\
             \telse\r\n\
             \t\treturn \"DIRECT\";\r\n\
             }}\r\n"
        );
        let response = format!(
            "HTTP/1.0 200 OK\r\n\
             Content-Type: application/x-ns-proxy-autoconfig\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        Self {
            inner: Arc::new(PacInner {
                port,
                response,
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Bind the listener. Returns the bound address.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", self.inner.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "PAC service listening");
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut socket, _)) => {
                        let response = inner.response.clone();
                        tokio::spawn(async move {
                            // Consume whatever request line arrives, then
                            // answer with the one file we have.
                            let mut buf = [0u8; 2048];
                            if socket.read(&mut buf).await.is_ok() {
                                let _ = socket.write_all(response.as_bytes()).await;
                            }
                            debug!("PAC file served");
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "PAC accept failed");
                        break;
                    }
                }
            }
        });
        *self.inner.accept_task.lock().unwrap() = Some(task);
        Ok(local_addr)
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
