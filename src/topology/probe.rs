/// Wire-protocol prober
///
/// Performs the real describe-membership exchange against a member: dial,
/// send isMaster, read the one reply, scan out role and membership fields.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::{ProbeReply, Prober};
use crate::core::MemberRole;
use crate::error::{EsclusaError, EsclusaResult};
use crate::protocol::hello::{hello_request, parse_hello_reply};
use crate::protocol::{read_message, DEFAULT_MAX_MESSAGE_SIZE};

/// Probes members over their native wire protocol
pub struct WireProber {
    request_ids: AtomicI32,
    max_message_size: usize,
}

impl WireProber {
    pub fn new() -> Self {
        Self {
            request_ids: AtomicI32::new(1),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for WireProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for WireProber {
    async fn probe(&self, member: SocketAddr) -> EsclusaResult<ProbeReply> {
        debug!("Probing member {}", member);
        let started = Instant::now();

        let mut stream = TcpStream::connect(member)
            .await
            .map_err(|e| EsclusaError::unreachable(member, e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let request_id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        stream
            .write_all(&hello_request(request_id))
            .await
            .map_err(|e| EsclusaError::unreachable(member, e.to_string()))?;

        let msg = read_message(&mut stream, self.max_message_size)
            .await?
            .ok_or_else(|| EsclusaError::unreachable(member, "closed before replying"))?;
        if msg.header.response_to != request_id {
            return Err(EsclusaError::ProtocolDesync {
                expected: request_id,
                got: msg.header.response_to,
            });
        }

        let reply = parse_hello_reply(&msg)?;
        let role = if reply.is_writable_primary {
            MemberRole::Primary
        } else if reply.secondary {
            MemberRole::Secondary
        } else {
            MemberRole::Unknown
        };

        Ok(ProbeReply {
            role,
            hosts: reply.hosts,
            round_trip: started.elapsed(),
            set_name: reply.set_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hello::doc::{reply_message, DocBuilder};
    use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
    use tokio::net::TcpListener;

    /// Fake member that answers its first message with the given isMaster
    /// document; `shift_response_to` forces a correlation mismatch
    async fn spawn_member(document: Vec<u8>, shift_response_to: i32) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let document = document.clone();
                tokio::spawn(async move {
                    let request = read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE)
                        .await
                        .unwrap()
                        .unwrap();
                    let raw = reply_message(
                        request.header.request_id + shift_response_to,
                        &document,
                    );
                    let _ = stream.write_all(&raw).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_probe_primary() {
        let document = DocBuilder::new()
            .bool("ismaster", true)
            .bool("secondary", false)
            .string("setName", "rs0")
            .string_array("hosts", &["127.0.0.1:27017", "127.0.0.1:27018"])
            .build();
        let member = spawn_member(document, 0).await;

        let prober = WireProber::new();
        let reply = prober.probe(member).await.unwrap();

        assert_eq!(reply.role, MemberRole::Primary);
        assert_eq!(reply.hosts.len(), 2);
        assert_eq!(reply.set_name.as_deref(), Some("rs0"));
    }

    #[tokio::test]
    async fn test_probe_secondary() {
        let document = DocBuilder::new()
            .bool("ismaster", false)
            .bool("secondary", true)
            .build();
        let member = spawn_member(document, 0).await;

        let prober = WireProber::new();
        let reply = prober.probe(member).await.unwrap();

        assert_eq!(reply.role, MemberRole::Secondary);
    }

    #[tokio::test]
    async fn test_probe_arbiter_is_unknown_role() {
        let document = DocBuilder::new()
            .bool("ismaster", false)
            .bool("secondary", false)
            .bool("arbiterOnly", true)
            .build();
        let member = spawn_member(document, 0).await;

        let prober = WireProber::new();
        let reply = prober.probe(member).await.unwrap();

        assert_eq!(reply.role, MemberRole::Unknown);
    }

    #[tokio::test]
    async fn test_probe_detects_correlation_mismatch() {
        let document = DocBuilder::new().bool("ismaster", true).build();
        let member = spawn_member(document, 1000).await;

        let prober = WireProber::new();
        let err = prober.probe(member).await.unwrap_err();

        assert!(matches!(err, EsclusaError::ProtocolDesync { .. }));
    }

    #[tokio::test]
    async fn test_probe_unreachable_member() {
        let prober = WireProber::new();
        let err = prober.probe("127.0.0.1:65534".parse().unwrap()).await;

        assert!(matches!(
            err,
            Err(EsclusaError::BackendUnreachable { .. })
        ));
    }
}
