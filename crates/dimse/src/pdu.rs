//! DICOM Upper Layer PDU codec.
//!
//! Encodes and decodes the seven PDU types used by association-based
//! services: A-ASSOCIATE-RQ/AC/RJ, P-DATA-TF, A-RELEASE-RQ/RP and
//! A-ABORT, together with the variable items carried inside association
//! negotiation. Framing is big-endian; dataset payloads inside P-DATA
//! PDVs are opaque to this layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DimseError, Result};
use crate::types::{PresentationContextProposal, PresentationContextReply};

pub const PDU_TYPE_ASSOCIATE_RQ: u8 = 0x01;
pub const PDU_TYPE_ASSOCIATE_AC: u8 = 0x02;
pub const PDU_TYPE_ASSOCIATE_RJ: u8 = 0x03;
pub const PDU_TYPE_P_DATA_TF: u8 = 0x04;
pub const PDU_TYPE_RELEASE_RQ: u8 = 0x05;
pub const PDU_TYPE_RELEASE_RP: u8 = 0x06;
pub const PDU_TYPE_ABORT: u8 = 0x07;

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const SUB_ITEM_MAX_LENGTH: u8 = 0x51;
const SUB_ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const SUB_ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

/// Association PDUs carry only negotiation items and stay small; this cap
/// bounds them independently of the negotiated data PDU length.
pub const MAX_ASSOCIATION_PDU_LENGTH: u32 = 65536;

/// Upper bound accepted for any PDU regardless of negotiation.
pub const ABSOLUTE_MAX_PDU_LENGTH: u32 = 16 * 1024 * 1024;

/// Fields of an A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub called_aet: String,
    pub calling_aet: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposal>,
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
}

/// Fields of an A-ASSOCIATE-AC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub called_aet: String,
    pub calling_aet: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextReply>,
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
}

/// One presentation-data-value inside a P-DATA-TF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationDataValue {
    pub context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Bytes,
}

/// A decoded upper-layer PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj { result: u8, source: u8, reason: u8 },
    PData(Vec<PresentationDataValue>),
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

impl Pdu {
    /// Encode this PDU into a complete frame including the 6-byte header.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let pdu_type = match self {
            Pdu::AssociateRq(rq) => {
                encode_associate(&mut body, &rq.called_aet, &rq.calling_aet, |items| {
                    put_item(items, ITEM_APPLICATION_CONTEXT, rq.application_context.as_bytes());
                    for pc in &rq.presentation_contexts {
                        let mut pc_body = BytesMut::new();
                        pc_body.put_u8(pc.id);
                        pc_body.put_bytes(0, 3);
                        put_item(&mut pc_body, ITEM_ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes());
                        for ts in &pc.transfer_syntaxes {
                            put_item(&mut pc_body, ITEM_TRANSFER_SYNTAX, ts.as_bytes());
                        }
                        put_item(items, ITEM_PRESENTATION_CONTEXT_RQ, &pc_body);
                    }
                    put_user_information(
                        items,
                        rq.max_pdu_length,
                        &rq.implementation_class_uid,
                        rq.implementation_version_name.as_deref(),
                    );
                });
                PDU_TYPE_ASSOCIATE_RQ
            }
            Pdu::AssociateAc(ac) => {
                encode_associate(&mut body, &ac.called_aet, &ac.calling_aet, |items| {
                    put_item(items, ITEM_APPLICATION_CONTEXT, ac.application_context.as_bytes());
                    for pc in &ac.presentation_contexts {
                        let mut pc_body = BytesMut::new();
                        pc_body.put_u8(pc.id);
                        pc_body.put_u8(0);
                        pc_body.put_u8(pc.result);
                        pc_body.put_u8(0);
                        put_item(&mut pc_body, ITEM_TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes());
                        put_item(items, ITEM_PRESENTATION_CONTEXT_AC, &pc_body);
                    }
                    put_user_information(
                        items,
                        ac.max_pdu_length,
                        &ac.implementation_class_uid,
                        ac.implementation_version_name.as_deref(),
                    );
                });
                PDU_TYPE_ASSOCIATE_AC
            }
            Pdu::AssociateRj { result, source, reason } => {
                body.put_u8(0);
                body.put_u8(*result);
                body.put_u8(*source);
                body.put_u8(*reason);
                PDU_TYPE_ASSOCIATE_RJ
            }
            Pdu::PData(pdvs) => {
                for pdv in pdvs {
                    body.put_u32(pdv.data.len() as u32 + 2);
                    body.put_u8(pdv.context_id);
                    let mut mch = 0u8;
                    if pdv.is_command {
                        mch |= 0x01;
                    }
                    if pdv.is_last {
                        mch |= 0x02;
                    }
                    body.put_u8(mch);
                    body.put_slice(&pdv.data);
                }
                PDU_TYPE_P_DATA_TF
            }
            Pdu::ReleaseRq => {
                body.put_u32(0);
                PDU_TYPE_RELEASE_RQ
            }
            Pdu::ReleaseRp => {
                body.put_u32(0);
                PDU_TYPE_RELEASE_RP
            }
            Pdu::Abort { source, reason } => {
                body.put_u8(0);
                body.put_u8(0);
                body.put_u8(*source);
                body.put_u8(*reason);
                PDU_TYPE_ABORT
            }
        };

        let mut frame = BytesMut::with_capacity(6 + body.len());
        frame.put_u8(pdu_type);
        frame.put_u8(0);
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Decode a PDU from its type byte and body.
    pub fn decode(pdu_type: u8, body: Bytes) -> Result<Pdu> {
        match pdu_type {
            PDU_TYPE_ASSOCIATE_RQ => decode_associate_rq(body),
            PDU_TYPE_ASSOCIATE_AC => decode_associate_ac(body),
            PDU_TYPE_ASSOCIATE_RJ => {
                if body.len() < 4 {
                    return Err(DimseError::protocol("A-ASSOCIATE-RJ too short"));
                }
                Ok(Pdu::AssociateRj {
                    result: body[1],
                    source: body[2],
                    reason: body[3],
                })
            }
            PDU_TYPE_P_DATA_TF => decode_p_data(body),
            PDU_TYPE_RELEASE_RQ => Ok(Pdu::ReleaseRq),
            PDU_TYPE_RELEASE_RP => Ok(Pdu::ReleaseRp),
            PDU_TYPE_ABORT => {
                if body.len() < 4 {
                    return Err(DimseError::protocol("A-ABORT too short"));
                }
                Ok(Pdu::Abort {
                    source: body[2],
                    reason: body[3],
                })
            }
            other => Err(DimseError::protocol(format!(
                "unknown PDU type 0x{other:02X}"
            ))),
        }
    }
}

/// Read one PDU from the stream, enforcing `max_length` on the frame body.
pub async fn read_pdu<R>(reader: &mut R, max_length: u32) -> Result<Pdu>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    reader.read_exact(&mut header).await?;
    let pdu_type = header[0];
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);

    let cap = max_length.min(ABSOLUTE_MAX_PDU_LENGTH);
    if length > cap {
        return Err(DimseError::protocol(format!(
            "PDU length {length} exceeds maximum {cap}"
        )));
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;
    Pdu::decode(pdu_type, Bytes::from(body))
}

/// Write one PDU to the stream.
pub async fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = pdu.encode();
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_associate<F>(body: &mut BytesMut, called: &str, calling: &str, put_items: F)
where
    F: FnOnce(&mut BytesMut),
{
    body.put_u16(0x0001); // protocol version
    body.put_u16(0);
    put_ae_title(body, called);
    put_ae_title(body, calling);
    body.put_bytes(0, 32);
    put_items(body);
}

fn put_ae_title(buf: &mut BytesMut, aet: &str) {
    let mut field = [b' '; 16];
    let bytes = aet.as_bytes();
    let n = bytes.len().min(16);
    field[..n].copy_from_slice(&bytes[..n]);
    buf.put_slice(&field);
}

fn put_item(buf: &mut BytesMut, item_type: u8, payload: &[u8]) {
    buf.put_u8(item_type);
    buf.put_u8(0);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

fn put_user_information(
    buf: &mut BytesMut,
    max_pdu_length: u32,
    implementation_class_uid: &str,
    implementation_version_name: Option<&str>,
) {
    let mut ui = BytesMut::new();
    let mut max_len = BytesMut::new();
    max_len.put_u32(max_pdu_length);
    put_item(&mut ui, SUB_ITEM_MAX_LENGTH, &max_len);
    put_item(
        &mut ui,
        SUB_ITEM_IMPLEMENTATION_CLASS_UID,
        implementation_class_uid.as_bytes(),
    );
    if let Some(version) = implementation_version_name {
        put_item(
            &mut ui,
            SUB_ITEM_IMPLEMENTATION_VERSION_NAME,
            version.as_bytes(),
        );
    }
    put_item(buf, ITEM_USER_INFORMATION, &ui);
}

fn take_ae_title(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 16 {
        return Err(DimseError::protocol("truncated AE title field"));
    }
    let raw = buf.split_to(16);
    let text = std::str::from_utf8(&raw)
        .map_err(|_| DimseError::protocol("AE title is not valid ASCII"))?;
    Ok(text.trim_end_matches([' ', '\0']).to_string())
}

fn take_item(buf: &mut Bytes) -> Result<(u8, Bytes)> {
    if buf.remaining() < 4 {
        return Err(DimseError::protocol("truncated item header"));
    }
    let item_type = buf.get_u8();
    buf.advance(1);
    let length = buf.get_u16() as usize;
    if buf.remaining() < length {
        return Err(DimseError::protocol(format!(
            "item 0x{item_type:02X} length {length} exceeds remaining bytes"
        )));
    }
    Ok((item_type, buf.split_to(length)))
}

fn uid_from(payload: &Bytes) -> Result<String> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DimseError::protocol("UID field is not valid ASCII"))?;
    Ok(text.trim_end_matches([' ', '\0']).to_string())
}

struct UserInformation {
    max_pdu_length: u32,
    implementation_class_uid: String,
    implementation_version_name: Option<String>,
}

fn decode_user_information(mut payload: Bytes) -> Result<UserInformation> {
    let mut out = UserInformation {
        max_pdu_length: 0,
        implementation_class_uid: String::new(),
        implementation_version_name: None,
    };
    while payload.has_remaining() {
        let (sub_type, sub) = take_item(&mut payload)?;
        match sub_type {
            SUB_ITEM_MAX_LENGTH => {
                if sub.len() != 4 {
                    return Err(DimseError::protocol("maximum-length sub-item must be 4 bytes"));
                }
                out.max_pdu_length = u32::from_be_bytes([sub[0], sub[1], sub[2], sub[3]]);
            }
            SUB_ITEM_IMPLEMENTATION_CLASS_UID => {
                out.implementation_class_uid = uid_from(&sub)?;
            }
            SUB_ITEM_IMPLEMENTATION_VERSION_NAME => {
                out.implementation_version_name = Some(uid_from(&sub)?);
            }
            // Asynchronous-operations, role-selection and extended
            // negotiation sub-items are tolerated and ignored.
            _ => {}
        }
    }
    Ok(out)
}

fn decode_associate_preamble(buf: &mut Bytes) -> Result<(String, String)> {
    if buf.remaining() < 68 {
        return Err(DimseError::protocol("associate PDU body too short"));
    }
    let version = buf.get_u16();
    if version & 0x0001 == 0 {
        return Err(DimseError::protocol(format!(
            "unsupported protocol version {version:#06x}"
        )));
    }
    buf.advance(2);
    let called = take_ae_title(buf)?;
    let calling = take_ae_title(buf)?;
    buf.advance(32);
    Ok((called, calling))
}

fn decode_associate_rq(mut body: Bytes) -> Result<Pdu> {
    let (called_aet, calling_aet) = decode_associate_preamble(&mut body)?;

    let mut application_context = String::new();
    let mut presentation_contexts = Vec::new();
    let mut user_info = None;

    while body.has_remaining() {
        let (item_type, payload) = take_item(&mut body)?;
        match item_type {
            ITEM_APPLICATION_CONTEXT => application_context = uid_from(&payload)?,
            ITEM_PRESENTATION_CONTEXT_RQ => {
                let mut pc = payload;
                if pc.remaining() < 4 {
                    return Err(DimseError::protocol("presentation context item too short"));
                }
                let id = pc.get_u8();
                pc.advance(3);
                let mut abstract_syntax = String::new();
                let mut transfer_syntaxes = Vec::new();
                while pc.has_remaining() {
                    let (sub_type, sub) = take_item(&mut pc)?;
                    match sub_type {
                        ITEM_ABSTRACT_SYNTAX => abstract_syntax = uid_from(&sub)?,
                        ITEM_TRANSFER_SYNTAX => transfer_syntaxes.push(uid_from(&sub)?),
                        other => {
                            return Err(DimseError::protocol(format!(
                                "unexpected sub-item 0x{other:02X} in presentation context"
                            )))
                        }
                    }
                }
                if abstract_syntax.is_empty() || transfer_syntaxes.is_empty() {
                    return Err(DimseError::protocol(
                        "presentation context missing abstract or transfer syntax",
                    ));
                }
                presentation_contexts.push(PresentationContextProposal {
                    id,
                    abstract_syntax,
                    transfer_syntaxes,
                });
            }
            ITEM_USER_INFORMATION => user_info = Some(decode_user_information(payload)?),
            _ => {}
        }
    }

    if presentation_contexts.is_empty() {
        return Err(DimseError::protocol(
            "A-ASSOCIATE-RQ proposes no presentation contexts",
        ));
    }

    let user_info = user_info
        .ok_or_else(|| DimseError::protocol("A-ASSOCIATE-RQ missing user information item"))?;

    Ok(Pdu::AssociateRq(AssociateRq {
        called_aet,
        calling_aet,
        application_context,
        presentation_contexts,
        max_pdu_length: user_info.max_pdu_length,
        implementation_class_uid: user_info.implementation_class_uid,
        implementation_version_name: user_info.implementation_version_name,
    }))
}

fn decode_associate_ac(mut body: Bytes) -> Result<Pdu> {
    let (called_aet, calling_aet) = decode_associate_preamble(&mut body)?;

    let mut application_context = String::new();
    let mut presentation_contexts = Vec::new();
    let mut user_info = None;

    while body.has_remaining() {
        let (item_type, payload) = take_item(&mut body)?;
        match item_type {
            ITEM_APPLICATION_CONTEXT => application_context = uid_from(&payload)?,
            ITEM_PRESENTATION_CONTEXT_AC => {
                let mut pc = payload;
                if pc.remaining() < 4 {
                    return Err(DimseError::protocol("presentation context reply too short"));
                }
                let id = pc.get_u8();
                pc.advance(1);
                let result = pc.get_u8();
                pc.advance(1);
                let mut transfer_syntax = String::new();
                while pc.has_remaining() {
                    let (sub_type, sub) = take_item(&mut pc)?;
                    if sub_type == ITEM_TRANSFER_SYNTAX {
                        transfer_syntax = uid_from(&sub)?;
                    }
                }
                presentation_contexts.push(PresentationContextReply {
                    id,
                    result,
                    transfer_syntax,
                });
            }
            ITEM_USER_INFORMATION => user_info = Some(decode_user_information(payload)?),
            _ => {}
        }
    }

    let user_info = user_info
        .ok_or_else(|| DimseError::protocol("A-ASSOCIATE-AC missing user information item"))?;

    Ok(Pdu::AssociateAc(AssociateAc {
        called_aet,
        calling_aet,
        application_context,
        presentation_contexts,
        max_pdu_length: user_info.max_pdu_length,
        implementation_class_uid: user_info.implementation_class_uid,
        implementation_version_name: user_info.implementation_version_name,
    }))
}

fn decode_p_data(mut body: Bytes) -> Result<Pdu> {
    let mut pdvs = Vec::new();
    while body.has_remaining() {
        if body.remaining() < 6 {
            return Err(DimseError::protocol("truncated PDV header"));
        }
        let item_length = body.get_u32() as usize;
        if item_length < 2 || body.remaining() < item_length {
            return Err(DimseError::protocol("PDV length inconsistent with PDU body"));
        }
        let context_id = body.get_u8();
        let mch = body.get_u8();
        let data = body.split_to(item_length - 2);
        pdvs.push(PresentationDataValue {
            context_id,
            is_command: mch & 0x01 != 0,
            is_last: mch & 0x02 != 0,
            data,
        });
    }
    if pdvs.is_empty() {
        return Err(DimseError::protocol("P-DATA-TF carries no PDVs"));
    }
    Ok(Pdu::PData(pdvs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{APPLICATION_CONTEXT, EXPLICIT_VR_LE, IMPLICIT_VR_LE};

    fn roundtrip(pdu: Pdu) -> Pdu {
        let frame = pdu.encode();
        let body = Bytes::copy_from_slice(&frame[6..]);
        assert_eq!(
            u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize,
            body.len()
        );
        Pdu::decode(frame[0], body).expect("decode")
    }

    #[test]
    fn associate_rq_roundtrip() {
        let rq = Pdu::AssociateRq(AssociateRq {
            called_aet: "REMOTE".into(),
            calling_aet: "GANTRY_SCU".into(),
            application_context: APPLICATION_CONTEXT.into(),
            presentation_contexts: vec![PresentationContextProposal {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".into(),
                transfer_syntaxes: vec![EXPLICIT_VR_LE.into(), IMPLICIT_VR_LE.into()],
            }],
            max_pdu_length: 65536,
            implementation_class_uid: "1.2.826.0.1.3680043.10.1453.1".into(),
            implementation_version_name: Some("GANTRY_0_3".into()),
        });
        assert_eq!(roundtrip(rq.clone()), rq);
    }

    #[test]
    fn associate_ac_roundtrip() {
        let ac = Pdu::AssociateAc(AssociateAc {
            called_aet: "REMOTE".into(),
            calling_aet: "GANTRY_SCU".into(),
            application_context: APPLICATION_CONTEXT.into(),
            presentation_contexts: vec![PresentationContextReply {
                id: 1,
                result: 0,
                transfer_syntax: EXPLICIT_VR_LE.into(),
            }],
            max_pdu_length: 32768,
            implementation_class_uid: "1.2.826.0.1.3680043.10.1453.1".into(),
            implementation_version_name: None,
        });
        assert_eq!(roundtrip(ac.clone()), ac);
    }

    #[test]
    fn reject_release_abort_roundtrip() {
        let rj = Pdu::AssociateRj {
            result: 1,
            source: 1,
            reason: 7,
        };
        assert_eq!(roundtrip(rj.clone()), rj);
        assert_eq!(roundtrip(Pdu::ReleaseRq), Pdu::ReleaseRq);
        assert_eq!(roundtrip(Pdu::ReleaseRp), Pdu::ReleaseRp);
        let abort = Pdu::Abort { source: 0, reason: 0 };
        assert_eq!(roundtrip(abort.clone()), abort);
    }

    #[test]
    fn p_data_roundtrip() {
        let pdu = Pdu::PData(vec![
            PresentationDataValue {
                context_id: 1,
                is_command: true,
                is_last: true,
                data: Bytes::from_static(b"\x00\x01\x02\x03"),
            },
            PresentationDataValue {
                context_id: 1,
                is_command: false,
                is_last: false,
                data: Bytes::from_static(b"payload"),
            },
        ]);
        assert_eq!(roundtrip(pdu.clone()), pdu);
    }

    #[test]
    fn rejects_oversized_pdu() {
        let pdu = Pdu::PData(vec![PresentationDataValue {
            context_id: 1,
            is_command: false,
            is_last: true,
            data: Bytes::from(vec![0u8; 4096]),
        }]);
        let frame = pdu.encode();
        let mut cursor = std::io::Cursor::new(frame.to_vec());
        let result = futures_block(read_pdu(&mut cursor, 1024));
        assert!(matches!(result, Err(DimseError::Protocol(_))));
    }

    #[test]
    fn rejects_truncated_pdv() {
        let body = Bytes::from_static(&[0, 0, 0, 10, 1, 0]);
        assert!(Pdu::decode(PDU_TYPE_P_DATA_TF, body).is_err());
    }

    #[test]
    fn rejects_unknown_pdu_type() {
        assert!(Pdu::decode(0x42, Bytes::new()).is_err());
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
