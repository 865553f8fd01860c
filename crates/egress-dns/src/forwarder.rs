use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use egress_metrics::MetricsCollector;
use egress_nft::{LearnerHandle, ResolvedIp};
use egress_policy::{Action, DNS_PROXY_PORT, PolicySnapshot, normalize_fqdn};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RData;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::upstream::marked_client_socket;

/// Upstream exchanges are bounded; slow resolvers surface as SERVFAIL.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 4096;

/// Loopback listener the NAT redirect points at.
pub fn listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PROXY_PORT)
}

/// Bind both transports up front so startup fails fast on a busy port.
pub async fn bind_listeners() -> Result<(UdpSocket, TcpListener)> {
    let addr = listen_addr();
    let udp = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("Failed to bind UDP DNS listener on {addr}"))?;
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP DNS listener on {addr}"))?;
    tracing::info!(%addr, "DNS listeners bound");
    Ok((udp, tcp))
}

/// Authoritative interceptor for all DNS traffic in the namespace.
///
/// Every query is evaluated against the live policy snapshot; denied names
/// get a synthesized NXDOMAIN, allowed ones are forwarded verbatim to the
/// upstream resolver over a marked socket.
pub struct DnsForwarder {
    active: Arc<ArcSwap<PolicySnapshot>>,
    upstream: SocketAddr,
    metrics: Arc<MetricsCollector>,
    learner: Option<LearnerHandle>,
}

impl DnsForwarder {
    pub fn new(
        active: Arc<ArcSwap<PolicySnapshot>>,
        upstream: SocketAddr,
        metrics: Arc<MetricsCollector>,
        learner: Option<LearnerHandle>,
    ) -> Self {
        Self {
            active,
            upstream,
            metrics,
            learner,
        }
    }

    pub async fn run_udp(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = socket
                .recv_from(&mut buf)
                .await
                .context("UDP DNS listener failed")?;
            let packet = buf[..len].to_vec();
            let this = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(response) = this.handle_query(&packet).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        tracing::debug!(%peer, error = %e, "failed to send DNS response");
                    }
                }
            });
        }
    }

    pub async fn run_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("TCP DNS listener failed")?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_tcp_client(stream).await {
                    tracing::debug!(%peer, error = %e, "TCP DNS session ended");
                }
            });
        }
    }

    /// RFC 1035 framing: two-byte length prefix per message, several
    /// messages per connection.
    async fn serve_tcp_client(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 {
                return Ok(());
            }
            let mut packet = vec![0u8; len];
            stream.read_exact(&mut packet).await?;

            if let Some(response) = self.handle_query(&packet).await {
                stream
                    .write_all(&(response.len() as u16).to_be_bytes())
                    .await?;
                stream.write_all(&response).await?;
            }
        }
    }

    /// Decide and serve one query. `None` means the input was not a DNS
    /// message we can answer.
    pub async fn handle_query(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparsable DNS message");
                return None;
            }
        };

        let Some(qname) = first_qname(&request) else {
            return encode(error_response(&request, ResponseCode::FormErr));
        };

        match self.active.load().evaluate(&qname) {
            Action::Deny => {
                tracing::debug!(%qname, "denied DNS query");
                self.metrics.record_query_denied();
                encode(error_response(&request, ResponseCode::NXDomain))
            }
            Action::Allow => {
                let start = Instant::now();
                let outcome = self.forward(packet).await;
                self.metrics
                    .observe_forward_latency(start.elapsed().as_secs_f64());
                match outcome {
                    Ok(response) => {
                        self.metrics.record_query_allowed();
                        if let Some(learner) = &self.learner {
                            if let Ok(parsed) = Message::from_vec(&response) {
                                for entry in collect_answers(&parsed) {
                                    learner.submit(entry);
                                }
                            }
                        }
                        Some(response)
                    }
                    Err(e) => {
                        tracing::warn!(%qname, error = %e, "upstream forward failed");
                        self.metrics.record_query_forward_error();
                        encode(error_response(&request, ResponseCode::ServFail))
                    }
                }
            }
        }
    }

    /// One fresh marked socket per exchange; responses cannot interleave
    /// across concurrent queries.
    async fn forward(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let socket = UdpSocket::from_std(marked_client_socket(self.upstream)?)
            .context("Failed to register upstream socket")?;
        socket
            .connect(self.upstream)
            .await
            .context("Failed to connect upstream socket")?;
        socket.send(packet).await.context("Failed to send upstream")?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(FORWARD_TIMEOUT, socket.recv(&mut buf))
            .await
            .context("upstream query timed out")?
            .context("Failed to receive upstream response")?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// Normalized name of the first question, if any.
fn first_qname(message: &Message) -> Option<String> {
    message
        .queries()
        .first()
        .map(|query| normalize_fqdn(&query.name().to_ascii()))
}

/// Response skeleton mirroring the request ID, opcode, and question.
fn error_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

fn encode(message: Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode DNS response");
            None
        }
    }
}

/// Pull A/AAAA answers with their TTLs out of an upstream response.
fn collect_answers(message: &Message) -> Vec<ResolvedIp> {
    message
        .answers()
        .iter()
        .filter_map(|record| {
            let addr = match record.data()? {
                RData::A(a) => IpAddr::V4(a.0),
                RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                _ => return None,
            };
            Some(ResolvedIp {
                addr,
                ttl: record.ttl(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, Record, RecordType};
    use std::net::Ipv6Addr;
    use std::str::FromStr;

    fn query_message(id: u16, name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        message
    }

    fn forwarder_with_policy(json: &str) -> DnsForwarder {
        let snapshot = PolicySnapshot::parse(json.as_bytes()).unwrap();
        DnsForwarder::new(
            Arc::new(ArcSwap::from_pointee(snapshot)),
            "127.0.0.1:5300".parse().unwrap(),
            Arc::new(MetricsCollector::new("test").unwrap()),
            None,
        )
    }

    #[tokio::test]
    async fn denied_query_gets_nxdomain_with_question_echoed() {
        let forwarder = forwarder_with_policy("{}");
        let request = query_message(0x1234, "evil.example.", RecordType::A);

        let response = forwarder
            .handle_query(&request.to_vec().unwrap())
            .await
            .expect("a response");
        let parsed = Message::from_vec(&response).unwrap();

        assert_eq!(parsed.id(), 0x1234);
        assert_eq!(parsed.message_type(), MessageType::Response);
        assert_eq!(parsed.response_code(), ResponseCode::NXDomain);
        assert!(parsed.answers().is_empty());
        assert_eq!(parsed.queries().len(), 1);
        assert_eq!(
            normalize_fqdn(&parsed.queries()[0].name().to_ascii()),
            "evil.example"
        );
    }

    #[tokio::test]
    async fn evaluation_uses_normalized_qname() {
        let forwarder = forwarder_with_policy(
            r#"{"defaultAction":"allow","egress":[{"action":"deny","target":"*.blocked.test"}]}"#,
        );
        let request = query_message(7, "WWW.Blocked.Test.", RecordType::A);
        let response = forwarder
            .handle_query(&request.to_vec().unwrap())
            .await
            .unwrap();
        let parsed = Message::from_vec(&response).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn tcp_framing_serves_multiple_queries_per_connection() {
        let forwarder = Arc::new(forwarder_with_policy("{}"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = forwarder.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = server.serve_tcp_client(stream).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        for (id, name) in [(42u16, "denied.example."), (43, "also.denied.example.")] {
            let query = query_message(id, name, RecordType::A).to_vec().unwrap();
            client
                .write_all(&(query.len() as u16).to_be_bytes())
                .await
                .unwrap();
            client.write_all(&query).await.unwrap();

            let mut len_buf = [0u8; 2];
            client.read_exact(&mut len_buf).await.unwrap();
            let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            client.read_exact(&mut response).await.unwrap();

            let parsed = Message::from_vec(&response).unwrap();
            assert_eq!(parsed.id(), id);
            assert_eq!(parsed.response_code(), ResponseCode::NXDomain);
        }
    }

    #[tokio::test]
    async fn garbage_input_is_dropped() {
        let forwarder = forwarder_with_policy("{}");
        assert!(forwarder.handle_query(&[0xde, 0xad]).await.is_none());
    }

    #[test]
    fn collects_a_and_aaaa_answers_with_ttls() {
        let mut response = Message::new();
        let name = Name::from_str("files.pypi.org.").unwrap();
        response.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::A(A(Ipv4Addr::new(151, 101, 0, 223))),
        ));
        response.add_answer(Record::from_rdata(
            name.clone(),
            120,
            RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        ));
        response.add_answer(Record::from_rdata(
            name,
            60,
            RData::CNAME(hickory_proto::rr::rdata::CNAME(
                Name::from_str("cdn.example.").unwrap(),
            )),
        ));

        let answers = collect_answers(&response);
        assert_eq!(answers.len(), 2);
        assert_eq!(
            answers[0],
            ResolvedIp {
                addr: "151.101.0.223".parse().unwrap(),
                ttl: 300
            }
        );
        assert_eq!(answers[1].ttl, 120);
    }

    #[test]
    fn first_qname_normalizes() {
        let request = query_message(1, "API.Example.COM.", RecordType::AAAA);
        assert_eq!(first_qname(&request).as_deref(), Some("api.example.com"));
    }
}
