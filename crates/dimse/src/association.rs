//! Association state machines for the acceptor (SCP) and requestor (SCU)
//! sides.
//!
//! An association owns its byte stream, the negotiated presentation
//! context map and the peer's maximum PDU length. Command sets are
//! reassembled from command PDVs; data sets are surfaced chunk by chunk so
//! callers can stream them to disk or to the wire without buffering whole
//! objects. Every read and write carries a deadline.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use uuid::Uuid;

use crate::command::Command;
use crate::config::{RemoteNode, ScpConfig};
use crate::error::{DimseError, Result};
use crate::pdu::{
    self, AssociateAc, AssociateRq, Pdu, PresentationDataValue, MAX_ASSOCIATION_PDU_LENGTH,
};
use crate::types::{
    AssociationInfo, ContextResult, NegotiatedContext, PresentationContextProposal,
    PresentationContextReply, APPLICATION_CONTEXT, VERIFICATION_SOP_CLASS,
};

/// Implementation identity advertised during association negotiation.
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.10.1453.1";
pub const IMPLEMENTATION_VERSION_NAME: &str = "GANTRY_0_3";

/// Byte stream an association can run over (plain TCP or TLS).
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Boxed connection, so TCP and TLS streams share one association type.
pub type BoxedConn = Box<dyn Conn>;

/// Association-level events surfaced to the SCP service loop
#[derive(Debug)]
pub enum AssocEvent {
    /// A complete command set arrived on the given presentation context
    Command { context_id: u8, command: Command },
    /// The peer released the association; the release reply has been sent
    Released,
    /// The peer aborted the association
    Aborted { source: u8, reason: u8 },
}

/// Acceptor side of an association.
pub struct ServerAssociation {
    stream: BoxedConn,
    info: AssociationInfo,
    contexts: HashMap<u8, NegotiatedContext>,
    /// Bound for outgoing P-DATA PDUs (peer's receive limit)
    peer_max_pdu: u32,
    /// Bound for incoming PDUs (our receive limit)
    local_max_pdu: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    pending: VecDeque<PresentationDataValue>,
    data_complete: bool,
}

impl ServerAssociation {
    /// Accept an association on `stream`: read the A-ASSOCIATE-RQ,
    /// negotiate presentation contexts against the configuration, and
    /// answer with AC or RJ.
    pub async fn accept(
        mut stream: BoxedConn,
        peer_addr: String,
        config: &ScpConfig,
    ) -> Result<Self> {
        let read_timeout = config.read_timeout();
        let write_timeout = config.write_timeout();

        let request = read_with_timeout(
            &mut stream,
            MAX_ASSOCIATION_PDU_LENGTH,
            read_timeout,
            "A-ASSOCIATE-RQ",
        )
        .await?;

        let rq = match request {
            Pdu::AssociateRq(rq) => rq,
            other => {
                return Err(DimseError::protocol(format!(
                    "expected A-ASSOCIATE-RQ, got {other:?}"
                )))
            }
        };

        if rq.application_context != APPLICATION_CONTEXT {
            reject(&mut stream, write_timeout, 1, 1, 2).await?;
            return Err(DimseError::protocol(format!(
                "unsupported application context {}",
                rq.application_context
            )));
        }

        if config.enforce_called_aet && rq.called_aet != config.local_aet {
            // result 1 = rejected-permanent, source 1 = service user,
            // reason 7 = called AE title not recognized
            reject(&mut stream, write_timeout, 1, 1, 7).await?;
            return Err(DimseError::AssociationRejected {
                result: 1,
                abort_source: 1,
                reason: 7,
            });
        }

        let mut contexts = HashMap::new();
        let mut replies = Vec::with_capacity(rq.presentation_contexts.len());
        for proposal in &rq.presentation_contexts {
            let supported_class = proposal.abstract_syntax == VERIFICATION_SOP_CLASS
                || config.storage_sop_classes.contains(&proposal.abstract_syntax);
            if !supported_class {
                replies.push(PresentationContextReply {
                    id: proposal.id,
                    result: ContextResult::AbstractSyntaxNotSupported.code(),
                    transfer_syntax: String::new(),
                });
                continue;
            }

            // Keep the peer's preference order so the transfer syntax it
            // selected is the one preserved end-to-end.
            let selected = proposal
                .transfer_syntaxes
                .iter()
                .find(|ts| config.transfer_syntaxes.contains(ts));
            match selected {
                Some(ts) => {
                    contexts.insert(
                        proposal.id,
                        NegotiatedContext {
                            id: proposal.id,
                            abstract_syntax: proposal.abstract_syntax.clone(),
                            transfer_syntax: ts.clone(),
                        },
                    );
                    replies.push(PresentationContextReply {
                        id: proposal.id,
                        result: ContextResult::Acceptance.code(),
                        transfer_syntax: ts.clone(),
                    });
                }
                None => replies.push(PresentationContextReply {
                    id: proposal.id,
                    result: ContextResult::TransferSyntaxesNotSupported.code(),
                    transfer_syntax: String::new(),
                }),
            }
        }

        if contexts.is_empty() {
            // Nothing acceptable; refuse rather than carry a dead association.
            reject(&mut stream, write_timeout, 1, 1, 1).await?;
            return Err(DimseError::ContextRejected(
                "no acceptable presentation context in proposal".to_string(),
            ));
        }

        let ac = Pdu::AssociateAc(AssociateAc {
            called_aet: rq.called_aet.clone(),
            calling_aet: rq.calling_aet.clone(),
            application_context: APPLICATION_CONTEXT.to_string(),
            presentation_contexts: replies,
            max_pdu_length: config.max_pdu,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: Some(IMPLEMENTATION_VERSION_NAME.to_string()),
        });
        write_with_timeout(&mut stream, &ac, write_timeout, "A-ASSOCIATE-AC").await?;

        let info = AssociationInfo {
            id: Uuid::new_v4(),
            calling_aet: rq.calling_aet,
            called_aet: rq.called_aet,
            peer_addr,
        };

        Ok(Self {
            stream,
            info,
            contexts,
            peer_max_pdu: effective_max_pdu(rq.max_pdu_length),
            local_max_pdu: config.max_pdu,
            read_timeout,
            write_timeout,
            pending: VecDeque::new(),
            data_complete: true,
        })
    }

    pub fn info(&self) -> &AssociationInfo {
        &self.info
    }

    pub fn context(&self, id: u8) -> Option<&NegotiatedContext> {
        self.contexts.get(&id)
    }

    /// Wait for the next command set, release, or abort.
    pub async fn next_event(&mut self) -> Result<AssocEvent> {
        let mut command_buf = BytesMut::new();
        let mut command_ctx: Option<u8> = None;

        loop {
            if let Some(pdv) = self.pending.pop_front() {
                if !pdv.is_command {
                    // A data PDV with no command in flight means the peer
                    // and we disagree about message framing.
                    return Err(DimseError::protocol(
                        "data PDV received outside of a C-STORE data set",
                    ));
                }
                if let Some(ctx) = command_ctx {
                    if ctx != pdv.context_id {
                        return Err(DimseError::protocol(
                            "command fragments span presentation contexts",
                        ));
                    }
                } else {
                    command_ctx = Some(pdv.context_id);
                }
                command_buf.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    let context_id = command_ctx.unwrap_or(pdv.context_id);
                    let command = Command::decode(command_buf.freeze())?;
                    self.data_complete = !command.has_data_set();
                    return Ok(AssocEvent::Command { context_id, command });
                }
                continue;
            }

            match self.read_pdu().await? {
                Pdu::PData(pdvs) => self.pending.extend(pdvs),
                Pdu::ReleaseRq => {
                    write_with_timeout(
                        &mut self.stream,
                        &Pdu::ReleaseRp,
                        self.write_timeout,
                        "A-RELEASE-RP",
                    )
                    .await?;
                    return Ok(AssocEvent::Released);
                }
                Pdu::Abort { source, reason } => {
                    return Ok(AssocEvent::Aborted { source, reason })
                }
                other => {
                    return Err(DimseError::protocol(format!(
                        "unexpected PDU mid-association: {other:?}"
                    )))
                }
            }
        }
    }

    /// Pull the next data-set chunk for the in-flight C-STORE. Returns
    /// `None` once the final PDV has been consumed.
    pub async fn next_data_chunk(&mut self, context_id: u8) -> Result<Option<Bytes>> {
        if self.data_complete {
            return Ok(None);
        }

        loop {
            if let Some(pdv) = self.pending.pop_front() {
                if pdv.is_command {
                    return Err(DimseError::protocol(
                        "command PDV interleaved with a data set",
                    ));
                }
                if pdv.context_id != context_id {
                    return Err(DimseError::protocol(
                        "data PDV on an unexpected presentation context",
                    ));
                }
                if pdv.is_last {
                    self.data_complete = true;
                }
                return Ok(Some(pdv.data));
            }

            match self.read_pdu().await? {
                Pdu::PData(pdvs) => self.pending.extend(pdvs),
                Pdu::Abort { source, reason } => {
                    return Err(DimseError::AssociationAborted { abort_source: source, reason })
                }
                other => {
                    return Err(DimseError::protocol(format!(
                        "unexpected PDU inside a data set: {other:?}"
                    )))
                }
            }
        }
    }

    /// Consume and discard the remainder of the in-flight data set.
    pub async fn discard_data(&mut self, context_id: u8) -> Result<u64> {
        let mut discarded = 0u64;
        while let Some(chunk) = self.next_data_chunk(context_id).await? {
            discarded += chunk.len() as u64;
        }
        Ok(discarded)
    }

    /// Send a command set as a single command PDV.
    pub async fn send_command(&mut self, context_id: u8, command: &Command) -> Result<()> {
        let pdu = Pdu::PData(vec![PresentationDataValue {
            context_id,
            is_command: true,
            is_last: true,
            data: command.encode(),
        }]);
        write_with_timeout(&mut self.stream, &pdu, self.write_timeout, "P-DATA-TF").await
    }

    /// Abort the association without a release handshake.
    pub async fn abort(&mut self) -> Result<()> {
        let pdu = Pdu::Abort { source: 0, reason: 0 };
        write_with_timeout(&mut self.stream, &pdu, self.write_timeout, "A-ABORT").await
    }

    async fn read_pdu(&mut self) -> Result<Pdu> {
        read_with_timeout(
            &mut self.stream,
            self.local_max_pdu,
            self.read_timeout,
            "PDU",
        )
        .await
    }

    /// Peer's negotiated receive limit, for symmetry with the client side.
    pub fn peer_max_pdu(&self) -> u32 {
        self.peer_max_pdu
    }
}

/// Requestor side of an association.
pub struct ClientAssociation {
    stream: BoxedConn,
    contexts: Vec<NegotiatedContext>,
    peer_max_pdu: u32,
    local_max_pdu: u32,
    read_timeout: Duration,
    pending: VecDeque<PresentationDataValue>,
}

impl ClientAssociation {
    /// Establish an association over an already-connected stream.
    pub async fn establish(
        mut stream: BoxedConn,
        local_aet: &str,
        node: &RemoteNode,
        proposals: Vec<PresentationContextProposal>,
    ) -> Result<Self> {
        let read_timeout = node.read_timeout();

        let rq = Pdu::AssociateRq(AssociateRq {
            called_aet: node.ae_title.clone(),
            calling_aet: local_aet.to_string(),
            application_context: APPLICATION_CONTEXT.to_string(),
            presentation_contexts: proposals.clone(),
            max_pdu_length: node.max_pdu,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: Some(IMPLEMENTATION_VERSION_NAME.to_string()),
        });
        write_with_timeout(&mut stream, &rq, read_timeout, "A-ASSOCIATE-RQ").await?;

        let reply = read_with_timeout(
            &mut stream,
            MAX_ASSOCIATION_PDU_LENGTH,
            read_timeout,
            "A-ASSOCIATE-AC",
        )
        .await?;

        let ac = match reply {
            Pdu::AssociateAc(ac) => ac,
            Pdu::AssociateRj { result, source, reason } => {
                return Err(DimseError::AssociationRejected { result, abort_source: source, reason })
            }
            Pdu::Abort { source, reason } => {
                return Err(DimseError::AssociationAborted { abort_source: source, reason })
            }
            other => {
                return Err(DimseError::protocol(format!(
                    "expected A-ASSOCIATE-AC, got {other:?}"
                )))
            }
        };

        let by_id: HashMap<u8, &PresentationContextProposal> =
            proposals.iter().map(|p| (p.id, p)).collect();
        let mut contexts = Vec::new();
        for reply in &ac.presentation_contexts {
            if reply.result != ContextResult::Acceptance.code() {
                continue;
            }
            if let Some(proposal) = by_id.get(&reply.id) {
                contexts.push(NegotiatedContext {
                    id: reply.id,
                    abstract_syntax: proposal.abstract_syntax.clone(),
                    transfer_syntax: reply.transfer_syntax.clone(),
                });
            }
        }

        Ok(Self {
            stream,
            contexts,
            peer_max_pdu: effective_max_pdu(ac.max_pdu_length),
            local_max_pdu: node.max_pdu,
            read_timeout,
            pending: VecDeque::new(),
        })
    }

    /// Find the accepted context for an (abstract syntax, transfer syntax)
    /// pair.
    pub fn accepted_context(&self, abstract_syntax: &str, transfer_syntax: &str) -> Option<u8> {
        self.contexts
            .iter()
            .find(|c| c.abstract_syntax == abstract_syntax && c.transfer_syntax == transfer_syntax)
            .map(|c| c.id)
    }

    pub fn accepted_contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    pub async fn send_command(&mut self, context_id: u8, command: &Command) -> Result<()> {
        let pdu = Pdu::PData(vec![PresentationDataValue {
            context_id,
            is_command: true,
            is_last: true,
            data: command.encode(),
        }]);
        write_with_timeout(&mut self.stream, &pdu, self.read_timeout, "P-DATA-TF").await
    }

    /// Stream a data set from `reader`, chunked to the peer's maximum PDU
    /// length. Returns the number of bytes sent.
    pub async fn send_data<R>(&mut self, context_id: u8, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        // PDV header is 6 bytes inside the PDU body.
        let chunk_size = (self.peer_max_pdu.min(self.local_max_pdu) as usize)
            .saturating_sub(6)
            .max(1024);
        let mut buf = vec![0u8; chunk_size];
        let mut sent = 0u64;
        let mut carried: Option<Bytes> = None;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                let last = carried.take().unwrap_or_default();
                sent += last.len() as u64;
                let pdu = Pdu::PData(vec![PresentationDataValue {
                    context_id,
                    is_command: false,
                    is_last: true,
                    data: last,
                }]);
                write_with_timeout(&mut self.stream, &pdu, self.read_timeout, "P-DATA-TF")
                    .await?;
                return Ok(sent);
            }
            if let Some(chunk) = carried.take() {
                sent += chunk.len() as u64;
                let pdu = Pdu::PData(vec![PresentationDataValue {
                    context_id,
                    is_command: false,
                    is_last: false,
                    data: chunk,
                }]);
                write_with_timeout(&mut self.stream, &pdu, self.read_timeout, "P-DATA-TF")
                    .await?;
            }
            carried = Some(Bytes::copy_from_slice(&buf[..n]));
        }
    }

    /// Wait for a command set (a DIMSE response) from the peer.
    pub async fn read_response(&mut self) -> Result<Command> {
        let mut command_buf = BytesMut::new();

        loop {
            if let Some(pdv) = self.pending.pop_front() {
                if !pdv.is_command {
                    return Err(DimseError::protocol(
                        "unexpected data PDV while awaiting a response",
                    ));
                }
                command_buf.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    return Command::decode(command_buf.freeze());
                }
                continue;
            }

            let pdu = read_with_timeout(
                &mut self.stream,
                self.local_max_pdu,
                self.read_timeout,
                "DIMSE response",
            )
            .await?;
            match pdu {
                Pdu::PData(pdvs) => self.pending.extend(pdvs),
                Pdu::Abort { source, reason } => {
                    return Err(DimseError::AssociationAborted { abort_source: source, reason })
                }
                other => {
                    return Err(DimseError::protocol(format!(
                        "unexpected PDU while awaiting a response: {other:?}"
                    )))
                }
            }
        }
    }

    /// Release the association with the normal handshake.
    pub async fn release(mut self) -> Result<()> {
        write_with_timeout(
            &mut self.stream,
            &Pdu::ReleaseRq,
            self.read_timeout,
            "A-RELEASE-RQ",
        )
        .await?;
        loop {
            let pdu = read_with_timeout(
                &mut self.stream,
                self.local_max_pdu,
                self.read_timeout,
                "A-RELEASE-RP",
            )
            .await?;
            match pdu {
                Pdu::ReleaseRp => return Ok(()),
                // A response still in flight may arrive first; drain it.
                Pdu::PData(_) => continue,
                Pdu::Abort { source, reason } => {
                    return Err(DimseError::AssociationAborted { abort_source: source, reason })
                }
                other => {
                    return Err(DimseError::protocol(format!(
                        "unexpected PDU during release: {other:?}"
                    )))
                }
            }
        }
    }

    /// Abort without the release handshake, e.g. on cancellation.
    pub async fn abort(mut self) {
        let _ = write_with_timeout(
            &mut self.stream,
            &Pdu::Abort { source: 0, reason: 0 },
            self.read_timeout,
            "A-ABORT",
        )
        .await;
    }
}

fn effective_max_pdu(negotiated: u32) -> u32 {
    // Zero means "no limit stated"; fall back to the customary default.
    if negotiated == 0 {
        65536
    } else {
        negotiated
    }
}

async fn reject(
    stream: &mut BoxedConn,
    write_timeout: Duration,
    result: u8,
    source: u8,
    reason: u8,
) -> Result<()> {
    let pdu = Pdu::AssociateRj { result, source, reason };
    write_with_timeout(stream, &pdu, write_timeout, "A-ASSOCIATE-RJ").await
}

async fn read_with_timeout(
    stream: &mut BoxedConn,
    max_length: u32,
    timeout: Duration,
    what: &str,
) -> Result<Pdu> {
    match tokio::time::timeout(timeout, pdu::read_pdu(stream, max_length)).await {
        Ok(result) => result,
        Err(_) => Err(DimseError::timeout(format!("reading {what}"))),
    }
}

async fn write_with_timeout(
    stream: &mut BoxedConn,
    pdu: &Pdu,
    timeout: Duration,
    what: &str,
) -> Result<()> {
    match tokio::time::timeout(timeout, pdu::write_pdu(stream, pdu)).await {
        Ok(result) => result,
        Err(_) => Err(DimseError::timeout(format!("writing {what}"))),
    }
}
