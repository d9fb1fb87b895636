use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{DNSClass, RData, Record, RecordType, rdata::A},
};
use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{providers::traits::Service, task_manager::TaskManager};

/// TTL of captive-portal answers, in seconds.
pub const ANSWER_TTL: u32 = 10;

const MAX_PACKET: usize = 512;

/// Authoritative reply to a standard query: every A (or ANY) question in
/// class IN resolves to `addr`, other questions get no records.
///
/// Responses, non-standard opcodes and undecodable packets are errors.
fn captive_answer(packet: &[u8], addr: Ipv4Addr, ttl: u32) -> Result<Vec<u8>> {
    let request = Message::from_vec(packet).context("Undecodable DNS packet")?;
    if request.message_type() != MessageType::Query {
        bail!("Not a query");
    }
    if request.op_code() != OpCode::Query {
        bail!("Unsupported opcode {:?}", request.op_code());
    }
    if request.queries().is_empty() {
        bail!("No question");
    }

    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);

    for query in request.queries() {
        response.add_query(query.clone());
        let wants_a = matches!(query.query_type(), RecordType::A | RecordType::ANY);
        if wants_a && query.query_class() == DNSClass::IN {
            response.add_answer(Record::from_rdata(query.name().clone(), ttl, RData::A(A(addr))));
        }
    }
    Ok(response.to_vec()?)
}

/// Captive-portal DNS responder: every A query resolves to the access point.
pub struct DnsServer {
    addr: SocketAddr,
    answer: Ipv4Addr,
    token: CancellationToken,
}

impl DnsServer {
    pub fn new(addr: SocketAddr, answer: Ipv4Addr) -> Self {
        Self {
            addr,
            answer,
            token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Service for DnsServer {
    fn name(&self) -> &'static str {
        "DnsServer"
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        let socket = UdpSocket::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind DNS responder on {}", self.addr))?;
        info!("DNS responder on {} answering {}", self.addr, self.answer);

        let answer = self.answer;
        let token = self.token.clone();
        task_manager.spawn_task(self.name(), move |loop_token| async move {
            let mut buf = [0u8; MAX_PACKET];
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = loop_token.cancelled() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, peer) = match received {
                            Ok(received) => received,
                            Err(e) => {
                                warn!("DNS receive failed: {e}");
                                continue;
                            }
                        };
                        let reply = match captive_answer(&buf[..len], answer, ANSWER_TTL) {
                            Ok(reply) => reply,
                            Err(e) => {
                                trace!("Ignoring DNS packet from {peer}: {e:#}");
                                continue;
                            }
                        };
                        debug!("DNS answer for {peer}");
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            warn!("DNS reply to {peer} failed: {e}");
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}
