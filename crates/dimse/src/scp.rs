//! Service Class Provider (SCP) for inbound C-ECHO and C-STORE.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::association::{AssocEvent, BoxedConn, ServerAssociation};
use crate::command::{self, Command};
use crate::config::ScpConfig;
use crate::error::{DimseError, Result};
use crate::status;
use crate::types::{AssociationInfo, NegotiatedContext};

/// Verdict a handler returns for one completed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Object durably stored; answer success
    Stored,
    /// Same object already stored with identical content; answer success
    DuplicateIgnored,
    /// Object refused; answer the given DIMSE failure status
    Rejected { status: u16, reason: String },
}

impl StoreOutcome {
    pub fn status(&self) -> u16 {
        match self {
            StoreOutcome::Stored | StoreOutcome::DuplicateIgnored => status::SUCCESS,
            StoreOutcome::Rejected { status, .. } => *status,
        }
    }
}

/// Receives the byte stream of one C-STORE object.
///
/// The SCP does not read the next PDU until `write_chunk` returns, so a
/// slow sink applies backpressure at the transport.
#[async_trait]
pub trait ObjectSink: Send {
    /// Append received bytes exactly as they arrived on the wire
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// All bytes received; publish and report the verdict
    async fn complete(self: Box<Self>) -> Result<StoreOutcome>;

    /// Transfer failed mid-stream; discard partial state
    async fn abort(self: Box<Self>);
}

/// Pipeline-side factory for object sinks.
#[async_trait]
pub trait StoreHandler: Send + Sync {
    /// Called when a C-STORE-RQ arrives, before any data bytes are read.
    async fn begin_object(
        &self,
        assoc: &AssociationInfo,
        context: &NegotiatedContext,
        command: &Command,
    ) -> Result<Box<dyn ObjectSink>>;

    /// Called when an association closes, for audit bookkeeping.
    async fn association_closed(&self, _assoc: &AssociationInfo) {}
}

/// DIMSE Service Class Provider
pub struct StoreScp {
    config: ScpConfig,
    handler: Arc<dyn StoreHandler>,
    active_associations: Arc<RwLock<u32>>,
}

impl StoreScp {
    /// Create a new SCP with the given configuration and store handler
    pub fn new(config: ScpConfig, handler: Arc<dyn StoreHandler>) -> Self {
        Self {
            config,
            handler,
            active_associations: Arc::new(RwLock::new(0)),
        }
    }

    /// Bind the listener. Split from `run` so callers can learn the bound
    /// port when configured with port 0.
    pub async fn bind(&self) -> Result<TcpListener> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Starting DIMSE SCP on {} (AET: {})",
            listener.local_addr()?,
            self.config.local_aet
        );
        Ok(listener)
    }

    /// Serve associations until the shutdown token fires.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        #[cfg(feature = "tls")]
        let tls_acceptor = match &self.config.tls {
            Some(options) => Some(crate::tls::build_acceptor(options)?),
            None => None,
        };
        #[cfg(not(feature = "tls"))]
        if self.config.tls.is_some() {
            return Err(DimseError::NotSupported(
                "TLS listener requested but the tls feature is not enabled".to_string(),
            ));
        }

        let scp = Arc::new(self);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);

                    {
                        let active = scp.active_associations.read().await;
                        if *active >= scp.config.max_associations {
                            warn!(
                                "Maximum associations reached, rejecting connection from {}",
                                peer_addr
                            );
                            drop(stream);
                            continue;
                        }
                    }

                    #[cfg(feature = "tls")]
                    let tls_acceptor = tls_acceptor.clone();
                    let scp = Arc::clone(&scp);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        #[cfg(feature = "tls")]
                        let conn: BoxedConn = match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Box::new(tls_stream),
                                Err(e) => {
                                    warn!("TLS handshake with {} failed: {}", peer_addr, e);
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };
                        #[cfg(not(feature = "tls"))]
                        let conn: BoxedConn = Box::new(stream);

                        if let Err(e) = scp.handle_association(conn, peer_addr, shutdown).await {
                            error!("Error handling association from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    async fn handle_association(
        &self,
        conn: BoxedConn,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        {
            let mut active = self.active_associations.write().await;
            *active += 1;
        }

        let result = tokio::select! {
            _ = shutdown.cancelled() => Err(DimseError::Canceled),
            r = self.handle_association_inner(conn, peer_addr) => r,
        };

        {
            let mut active = self.active_associations.write().await;
            *active -= 1;
        }

        result
    }

    async fn handle_association_inner(
        &self,
        conn: BoxedConn,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let mut assoc =
            ServerAssociation::accept(conn, peer_addr.to_string(), &self.config).await?;
        let info = assoc.info().clone();
        info!(
            association = %info.id,
            calling_aet = %info.calling_aet,
            "Association established with {}",
            peer_addr
        );

        let outcome = self.serve_objects(&mut assoc, &info).await;
        self.handler.association_closed(&info).await;

        match outcome {
            Ok(()) => {
                info!(association = %info.id, "Association with {} completed", peer_addr);
                Ok(())
            }
            Err(e) => {
                // Best effort: tell the peer we are going away.
                let _ = assoc.abort().await;
                Err(e)
            }
        }
    }

    async fn serve_objects(
        &self,
        assoc: &mut ServerAssociation,
        info: &AssociationInfo,
    ) -> Result<()> {
        loop {
            let (context_id, cmd) = match assoc.next_event().await? {
                AssocEvent::Command { context_id, command } => (context_id, command),
                AssocEvent::Released => return Ok(()),
                AssocEvent::Aborted { source, reason } => {
                    debug!(
                        association = %info.id,
                        "Peer aborted association (source={}, reason={})", source, reason
                    );
                    return Ok(());
                }
            };

            match cmd.command_field {
                command::C_ECHO_RQ => {
                    debug!(association = %info.id, "Processing C-ECHO request");
                    let rsp = Command::c_echo_rsp(cmd.message_id, status::SUCCESS);
                    assoc.send_command(context_id, &rsp).await?;
                }
                command::C_STORE_RQ => {
                    self.handle_store(assoc, info, context_id, cmd).await?;
                }
                other => {
                    warn!(
                        association = %info.id,
                        "Unsupported DIMSE command 0x{:04X}", other
                    );
                    return Err(DimseError::protocol(format!(
                        "unsupported command field 0x{other:04X}"
                    )));
                }
            }
        }
    }

    async fn handle_store(
        &self,
        assoc: &mut ServerAssociation,
        info: &AssociationInfo,
        context_id: u8,
        cmd: Command,
    ) -> Result<()> {
        let context = match assoc.context(context_id) {
            Some(ctx) => ctx.clone(),
            None => {
                return Err(DimseError::protocol(format!(
                    "C-STORE on unnegotiated presentation context {context_id}"
                )))
            }
        };

        if !cmd.has_data_set() {
            let rsp = Command::c_store_rsp(&cmd, status::PROCESSING_FAILURE);
            return assoc.send_command(context_id, &rsp).await;
        }

        let mut sink = match self.handler.begin_object(info, &context, &cmd).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(association = %info.id, "Refusing object before transfer: {}", e);
                assoc.discard_data(context_id).await?;
                let rsp = Command::c_store_rsp(&cmd, status::OUT_OF_RESOURCES);
                return assoc.send_command(context_id, &rsp).await;
            }
        };

        // Stream the data set into the sink; the next PDU is not read
        // until the sink has accepted the previous chunk.
        let stream_result = loop {
            match assoc.next_data_chunk(context_id).await {
                Ok(Some(chunk)) => {
                    if let Err(e) = sink.write_chunk(&chunk).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    sink.abort().await;
                    return Err(e);
                }
            }
        };

        let outcome = match stream_result {
            Ok(()) => match sink.complete().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(association = %info.id, "Failed to publish object: {}", e);
                    StoreOutcome::Rejected {
                        status: status::PROCESSING_FAILURE,
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                warn!(association = %info.id, "Sink failed mid-transfer: {}", e);
                // Remaining data PDVs for this object must still be
                // consumed so the association stays usable.
                assoc.discard_data(context_id).await?;
                StoreOutcome::Rejected {
                    status: status::PROCESSING_FAILURE,
                    reason: e.to_string(),
                }
            }
        };

        if let StoreOutcome::Rejected { status, reason } = &outcome {
            debug!(
                association = %info.id,
                "Answering C-STORE with status 0x{:04X}: {}", status, reason
            );
        }

        let rsp = Command::c_store_rsp(&cmd, outcome.status());
        assoc.send_command(context_id, &rsp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    struct MemorySink {
        buf: Vec<u8>,
        store: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl ObjectSink for MemorySink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
            self.buf.extend_from_slice(chunk);
            Ok(())
        }

        async fn complete(self: Box<Self>) -> Result<StoreOutcome> {
            self.store.lock().unwrap().push(self.buf);
            Ok(StoreOutcome::Stored)
        }

        async fn abort(self: Box<Self>) {}
    }

    struct MemoryHandler {
        store: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl StoreHandler for MemoryHandler {
        async fn begin_object(
            &self,
            _assoc: &AssociationInfo,
            _context: &NegotiatedContext,
            _command: &Command,
        ) -> Result<Box<dyn ObjectSink>> {
            Ok(Box::new(MemorySink {
                buf: Vec::new(),
                store: self.store.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn scp_binds_on_ephemeral_port() {
        let config = ScpConfig {
            local_aet: "TEST_SCP".to_string(),
            bind_addr: std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        };

        let store = Arc::new(Mutex::new(Vec::new()));
        let scp = StoreScp::new(config, Arc::new(MemoryHandler { store }));
        let listener = scp.bind().await.expect("bind");
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
