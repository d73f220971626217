/// TCP transport plumbing
///
/// Listener setup, client accept, and backend dialing with a connect
/// timeout. Both sides get TCP_NODELAY; backend connections additionally
/// get keepalive so half-dead members are noticed between probe cycles.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const BACKEND_KEEPALIVE: Duration = Duration::from_secs(60);

/// Result of a backend connection attempt
#[derive(Debug)]
pub enum ConnectResult {
    Success(TcpStream),
    Timeout,
    ConnectionRefused,
    NetworkError(io::Error),
}

/// Dials backend members and configures their sockets
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to a cluster member
    pub async fn connect(&self, member: SocketAddr) -> ConnectResult {
        debug!("Connecting to member {}", member);

        match timeout(self.connect_timeout, TcpStream::connect(member)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = configure_backend_stream(&stream) {
                    warn!("Failed to configure backend stream: {}", e);
                }
                debug!("Connected to member {}", member);
                ConnectResult::Success(stream)
            }
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused => {
                    debug!("Connection refused by member {}", member);
                    ConnectResult::ConnectionRefused
                }
                _ => {
                    debug!("Network error connecting to member {}: {}", member, e);
                    ConnectResult::NetworkError(e)
                }
            },
            Err(_) => {
                debug!("Timeout connecting to member {}", member);
                ConnectResult::Timeout
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Create the client-facing TCP listener
pub async fn create_listener(listen_addr: &str) -> Result<TcpListener, io::Error> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {}", listen_addr);
    Ok(listener)
}

/// Accept one client connection
pub async fn accept_client(listener: &TcpListener) -> Result<(TcpStream, SocketAddr), io::Error> {
    let (stream, addr) = listener.accept().await?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to configure client stream: {}", e);
    }
    debug!("Accepted connection from {}", addr);
    Ok((stream, addr))
}

fn configure_backend_stream(stream: &TcpStream) -> Result<(), io::Error> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(BACKEND_KEEPALIVE))?;
    Ok(())
}
