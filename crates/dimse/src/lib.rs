//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides both Service Class Provider (SCP) and Service Class
//! User (SCU) implementations for DICOM networking using the DIMSE
//! protocol.
//!
//! # Features
//! - Upper-layer PDU codec and association state machines
//! - Inbound services (SCP): C-ECHO, C-STORE with streaming object sinks
//! - Outbound services (SCU): C-ECHO, C-STORE with association reuse
//! - DIMSE status-class interpretation
//! - TLS support (optional, feature = "tls")
//!
//! Data sets are carried as opaque byte streams: nothing in this crate
//! re-encodes or reinterprets the payload of a C-STORE.

pub mod association;
pub mod command;
pub mod config;
pub mod error;
pub mod pdu;
pub mod scp;
pub mod scu;
pub mod status;
pub mod types;

#[cfg(feature = "tls")]
pub mod tls;

// Re-export commonly used types
pub use association::{ClientAssociation, ServerAssociation};
pub use command::Command;
pub use config::{RemoteNode, RemoteTlsPolicy, ScpConfig, TlsOptions};
pub use error::{DimseError, Result};
pub use scp::{ObjectSink, StoreHandler, StoreOutcome, StoreScp};
pub use scu::{StoreReply, StoreScu, StoreSession};
pub use status::StatusClass;
pub use types::{AssociationInfo, NegotiatedContext, StoreContext};

/// DIMSE protocol implementation version
pub const DIMSE_VERSION: &str = "0.3.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default TLS DICOM port
pub const DEFAULT_DIMSE_TLS_PORT: u16 = 2762;
