//! Common types for DIMSE operations

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Implicit VR Little Endian
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Verification SOP class (C-ECHO)
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// DICOM application context name
pub const APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

/// Storage SOP classes negotiated by default. The set covers the common
/// image and document classes; sites extend it through configuration.
pub const DEFAULT_STORAGE_SOP_CLASSES: &[&str] = &[
    "1.2.840.10008.5.1.4.1.1.1",     // Computed Radiography Image Storage
    "1.2.840.10008.5.1.4.1.1.1.1",   // Digital X-Ray Image Storage (Presentation)
    "1.2.840.10008.5.1.4.1.1.2",     // CT Image Storage
    "1.2.840.10008.5.1.4.1.1.3.1",   // Ultrasound Multi-frame Image Storage
    "1.2.840.10008.5.1.4.1.1.4",     // MR Image Storage
    "1.2.840.10008.5.1.4.1.1.6.1",   // Ultrasound Image Storage
    "1.2.840.10008.5.1.4.1.1.7",     // Secondary Capture Image Storage
    "1.2.840.10008.5.1.4.1.1.12.1",  // X-Ray Angiographic Image Storage
    "1.2.840.10008.5.1.4.1.1.20",    // Nuclear Medicine Image Storage
    "1.2.840.10008.5.1.4.1.1.88.11", // Basic Text SR Storage
    "1.2.840.10008.5.1.4.1.1.88.22", // Enhanced SR Storage
    "1.2.840.10008.5.1.4.1.1.128",   // PET Image Storage
];

/// A presentation context proposed in an A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationContextProposal {
    /// Odd identifier, unique within the association
    pub id: u8,

    /// Abstract syntax (SOP class UID)
    pub abstract_syntax: String,

    /// Transfer syntaxes offered, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// Result codes for a presentation context in an A-ASSOCIATE-AC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl ContextResult {
    pub fn code(self) -> u8 {
        match self {
            ContextResult::Acceptance => 0,
            ContextResult::UserRejection => 1,
            ContextResult::NoReason => 2,
            ContextResult::AbstractSyntaxNotSupported => 3,
            ContextResult::TransferSyntaxesNotSupported => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ContextResult::Acceptance,
            1 => ContextResult::UserRejection,
            3 => ContextResult::AbstractSyntaxNotSupported,
            4 => ContextResult::TransferSyntaxesNotSupported,
            _ => ContextResult::NoReason,
        }
    }
}

/// A presentation context answered in an A-ASSOCIATE-AC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextReply {
    pub id: u8,
    pub result: u8,
    /// Selected transfer syntax; meaningful only on acceptance
    pub transfer_syntax: String,
}

/// A presentation context both sides agreed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// Identity of one accepted inbound association, handed to store handlers
#[derive(Debug, Clone)]
pub struct AssociationInfo {
    /// Unique id assigned by this gateway for audit correlation
    pub id: Uuid,

    /// AE title the peer called itself
    pub calling_aet: String,

    /// AE title the peer addressed
    pub called_aet: String,

    /// Peer socket address, as text
    pub peer_addr: String,
}

/// Everything the SCU needs to transmit one stored object
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax_uid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_result_codes_roundtrip() {
        for result in [
            ContextResult::Acceptance,
            ContextResult::UserRejection,
            ContextResult::NoReason,
            ContextResult::AbstractSyntaxNotSupported,
            ContextResult::TransferSyntaxesNotSupported,
        ] {
            assert_eq!(ContextResult::from_code(result.code()), result);
        }
    }

    #[test]
    fn default_storage_classes_are_uids() {
        for uid in DEFAULT_STORAGE_SOP_CLASSES {
            assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
        }
    }
}
