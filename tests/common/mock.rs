//! Scriptable mock destination SCP.
//!
//! Stores received objects in memory and can be scripted to answer the
//! first N objects with chosen DIMSE statuses before defaulting to
//! success.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dimse::scp::{ObjectSink, StoreHandler, StoreOutcome, StoreScp};
use dimse::{AssociationInfo, Command, NegotiatedContext, ScpConfig};

pub struct MockScp {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl MockScp {
    /// Start a mock SCP on an ephemeral localhost port.
    ///
    /// `scripted_statuses` are answered for successive objects (0x0000
    /// stores and succeeds); once drained every object succeeds.
    /// `storage_sop_classes` overrides the accepted SOP classes, which is
    /// how context refusal is provoked.
    pub async fn start(
        local_aet: &str,
        scripted_statuses: Vec<u16>,
        storage_sop_classes: Option<Vec<String>>,
    ) -> MockScp {
        let mut config = ScpConfig {
            local_aet: local_aet.to_string(),
            bind_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        };
        if let Some(classes) = storage_sop_classes {
            config.storage_sop_classes = classes;
        }

        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(MockHandler {
            received: received.clone(),
            script: Mutex::new(VecDeque::from(scripted_statuses)),
        });

        let scp = StoreScp::new(config, handler);
        let listener = scp.bind().await.expect("bind mock scp");
        let addr = listener.local_addr().expect("mock scp addr");
        let shutdown = CancellationToken::new();
        let run_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = scp.run(listener, run_shutdown).await {
                eprintln!("mock scp terminated: {e}");
            }
        });

        MockScp {
            addr,
            received,
            shutdown,
            handle,
        }
    }

    pub fn received_objects(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

struct MockHandler {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    script: Mutex<VecDeque<u16>>,
}

#[async_trait]
impl StoreHandler for MockHandler {
    async fn begin_object(
        &self,
        _assoc: &AssociationInfo,
        _context: &NegotiatedContext,
        _command: &Command,
    ) -> dimse::Result<Box<dyn ObjectSink>> {
        let scripted = self.script.lock().unwrap().pop_front();
        Ok(Box::new(MockSink {
            buf: Vec::new(),
            received: self.received.clone(),
            scripted,
        }))
    }
}

struct MockSink {
    buf: Vec<u8>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    scripted: Option<u16>,
}

#[async_trait]
impl ObjectSink for MockSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> dimse::Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn complete(self: Box<Self>) -> dimse::Result<StoreOutcome> {
        match self.scripted {
            Some(0x0000) | None => {
                self.received.lock().unwrap().push(self.buf);
                Ok(StoreOutcome::Stored)
            }
            Some(status) => Ok(StoreOutcome::Rejected {
                status,
                reason: format!("scripted status 0x{status:04X}"),
            }),
        }
    }

    async fn abort(self: Box<Self>) {}
}
