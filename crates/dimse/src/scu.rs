//! Service Class User (SCU) for outbound C-ECHO and C-STORE.

use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::association::{BoxedConn, ClientAssociation};
use crate::command::Command;
use crate::config::RemoteNode;
use crate::error::{DimseError, Result};
use crate::status::{self, StatusClass};
use crate::types::{
    PresentationContextProposal, StoreContext, EXPLICIT_VR_LE, IMPLICIT_VR_LE,
    VERIFICATION_SOP_CLASS,
};

/// Outcome of one C-STORE exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReply {
    pub status: u16,
    pub class: StatusClass,
}

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct StoreScu {
    local_aet: String,
}

impl StoreScu {
    /// Create a new SCU with the given calling AE title
    pub fn new(local_aet: impl Into<String>) -> Self {
        Self {
            local_aet: local_aet.into(),
        }
    }

    /// Send a C-ECHO to a remote node and await a success status.
    pub async fn echo(&self, node: &RemoteNode) -> Result<()> {
        node.validate()?;
        info!(
            "Sending C-ECHO to {}@{}:{}",
            node.ae_title, node.host, node.port
        );

        let proposals = vec![PresentationContextProposal {
            id: 1,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()],
        }];

        let mut session = self.open(node, proposals).await?;
        let ctx_id = session
            .assoc
            .accepted_contexts()
            .iter()
            .find(|c| c.abstract_syntax == VERIFICATION_SOP_CLASS)
            .map(|c| c.id)
            .ok_or_else(|| {
                DimseError::ContextRejected("verification context refused".to_string())
            })?;

        let rq = Command::c_echo_rq(session.next_message_id());
        session.assoc.send_command(ctx_id, &rq).await?;
        let rsp = session.assoc.read_response().await?;
        session.release().await?;

        match rsp.status {
            Some(status::SUCCESS) => Ok(()),
            Some(other) => Err(DimseError::PeerStatus { status: other }),
            None => Err(DimseError::protocol("C-ECHO response carried no status")),
        }
    }

    /// Open an association proposing the given presentation contexts.
    pub async fn open(
        &self,
        node: &RemoteNode,
        proposals: Vec<PresentationContextProposal>,
    ) -> Result<StoreSession> {
        node.validate()?;

        let addr = format!("{}:{}", node.host, node.port);
        let tcp = tokio::time::timeout(node.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| DimseError::timeout(format!("connecting to {addr}")))??;
        tcp.set_nodelay(true)?;

        let conn = wrap_outbound(tcp, node).await?;

        let assoc = ClientAssociation::establish(conn, &self.local_aet, node, proposals).await?;
        debug!(
            "Association to {}@{} established with {} accepted context(s)",
            node.ae_title,
            addr,
            assoc.accepted_contexts().len()
        );

        Ok(StoreSession {
            assoc,
            next_message_id: 1,
            last_used: Instant::now(),
        })
    }

    /// Build the standard proposal set for forwarding one stored object:
    /// its SOP class with the stored transfer syntax preferred, plus
    /// verification for liveness probes.
    pub fn proposals_for(context: &StoreContext) -> Vec<PresentationContextProposal> {
        let mut syntaxes = vec![context.transfer_syntax_uid.clone()];
        for fallback in [EXPLICIT_VR_LE, IMPLICIT_VR_LE] {
            if !syntaxes.iter().any(|ts| ts == fallback) {
                syntaxes.push(fallback.to_string());
            }
        }
        vec![
            PresentationContextProposal {
                id: 1,
                abstract_syntax: context.sop_class_uid.clone(),
                transfer_syntaxes: syntaxes,
            },
            PresentationContextProposal {
                id: 3,
                abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            },
        ]
    }
}

#[cfg(feature = "tls")]
async fn wrap_outbound(tcp: TcpStream, node: &RemoteNode) -> Result<BoxedConn> {
    match &node.tls {
        None => Ok(Box::new(tcp)),
        Some(policy) => {
            let connector = crate::tls::build_connector(policy)?;
            let server_name = crate::tls::server_name(&node.host)?;
            Ok(Box::new(connector.connect(server_name, tcp).await?))
        }
    }
}

#[cfg(not(feature = "tls"))]
async fn wrap_outbound(tcp: TcpStream, node: &RemoteNode) -> Result<BoxedConn> {
    if node.tls.is_some() {
        return Err(DimseError::NotSupported(
            "destination requires TLS but the tls feature is not enabled".to_string(),
        ));
    }
    Ok(Box::new(tcp))
}

/// An open association to a destination, reusable across stores.
pub struct StoreSession {
    assoc: ClientAssociation,
    next_message_id: u16,
    last_used: Instant,
}

impl StoreSession {
    /// Whether this association can carry the given object without
    /// renegotiation.
    pub fn supports(&self, context: &StoreContext) -> bool {
        self.assoc
            .accepted_context(&context.sop_class_uid, &context.transfer_syntax_uid)
            .is_some()
    }

    /// Time since the last store on this association.
    pub fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Transmit one object's exact bytes and interpret the peer's status.
    ///
    /// The accepted presentation context must carry the stored transfer
    /// syntax; bytes are never transcoded. A missing context surfaces as
    /// `ContextRejected`.
    pub async fn store<R>(&mut self, context: &StoreContext, reader: &mut R) -> Result<StoreReply>
    where
        R: AsyncRead + Unpin + Send,
    {
        let ctx_id = self
            .assoc
            .accepted_context(&context.sop_class_uid, &context.transfer_syntax_uid)
            .ok_or_else(|| {
                DimseError::ContextRejected(format!(
                    "peer accepts no context for class {} with transfer syntax {}",
                    context.sop_class_uid, context.transfer_syntax_uid
                ))
            })?;

        let message_id = self.next_message_id();
        let rq = Command::c_store_rq(
            message_id,
            context.sop_class_uid.clone(),
            context.sop_instance_uid.clone(),
        );
        self.assoc.send_command(ctx_id, &rq).await?;
        let sent = self.assoc.send_data(ctx_id, reader).await?;
        debug!(
            sop_instance_uid = %context.sop_instance_uid,
            "Sent {} byte(s), awaiting C-STORE response", sent
        );

        let rsp = self.assoc.read_response().await?;
        if rsp.message_id != message_id {
            return Err(DimseError::protocol(format!(
                "response for message {} while awaiting {}",
                rsp.message_id, message_id
            )));
        }
        let status = rsp
            .status
            .ok_or_else(|| DimseError::protocol("C-STORE response carried no status"))?;

        self.last_used = Instant::now();
        Ok(StoreReply {
            status,
            class: status::classify(status),
        })
    }

    /// Release the association cleanly.
    pub async fn release(self) -> Result<()> {
        self.assoc.release().await
    }

    /// Abort the association, e.g. on cancellation or lease loss.
    pub async fn abort(self) {
        self.assoc.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposals_prefer_stored_transfer_syntax() {
        let context = StoreContext {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            sop_instance_uid: "1.2.3".into(),
            transfer_syntax_uid: "1.2.840.10008.1.2.4.70".into(), // JPEG Lossless
        };
        let proposals = StoreScu::proposals_for(&context);
        assert_eq!(proposals[0].transfer_syntaxes[0], "1.2.840.10008.1.2.4.70");
        assert!(proposals[0].transfer_syntaxes.contains(&EXPLICIT_VR_LE.to_string()));
        assert_eq!(proposals[1].abstract_syntax, VERIFICATION_SOP_CLASS);
        // Context ids must be odd and unique.
        assert_eq!(proposals[0].id % 2, 1);
        assert_eq!(proposals[1].id % 2, 1);
        assert_ne!(proposals[0].id, proposals[1].id);
    }

    #[tokio::test]
    async fn echo_against_closed_port_is_a_network_error() {
        let scu = StoreScu::new("TEST_SCU");
        // Port 1 on localhost is almost certainly closed.
        let node = RemoteNode::new("NOPE", "127.0.0.1", 1).with_connect_timeout(2_000);
        let result = scu.echo(&node).await;
        assert!(matches!(
            result,
            Err(DimseError::Network(_)) | Err(DimseError::Timeout(_))
        ));
    }
}
