//! DIMSE command-set codec.
//!
//! Command sets are always encoded in implicit VR little endian,
//! independent of the presentation context's transfer syntax. Only the
//! group-0000 elements used by C-ECHO and C-STORE are understood here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DimseError, Result};

pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

/// Value of CommandDataSetType when no data set follows the command.
pub const NO_DATA_SET: u16 = 0x0101;

/// Value of CommandDataSetType when a data set follows.
pub const HAS_DATA_SET: u16 = 0x0102;

const TAG_GROUP_LENGTH: (u16, u16) = (0x0000, 0x0000);
const TAG_AFFECTED_SOP_CLASS_UID: (u16, u16) = (0x0000, 0x0002);
const TAG_COMMAND_FIELD: (u16, u16) = (0x0000, 0x0100);
const TAG_MESSAGE_ID: (u16, u16) = (0x0000, 0x0110);
const TAG_MESSAGE_ID_RESPONDED_TO: (u16, u16) = (0x0000, 0x0120);
const TAG_PRIORITY: (u16, u16) = (0x0000, 0x0700);
const TAG_DATA_SET_TYPE: (u16, u16) = (0x0000, 0x0800);
const TAG_STATUS: (u16, u16) = (0x0000, 0x0900);
const TAG_AFFECTED_SOP_INSTANCE_UID: (u16, u16) = (0x0000, 0x1000);

/// A decoded DIMSE command set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_field: u16,
    pub message_id: u16,
    pub data_set_type: u16,
    pub priority: u16,
    pub status: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
}

impl Command {
    pub fn c_echo_rq(message_id: u16) -> Self {
        Self {
            command_field: C_ECHO_RQ,
            message_id,
            data_set_type: NO_DATA_SET,
            priority: 0,
            status: None,
            affected_sop_class_uid: Some(crate::types::VERIFICATION_SOP_CLASS.to_string()),
            affected_sop_instance_uid: None,
        }
    }

    pub fn c_echo_rsp(message_id: u16, status: u16) -> Self {
        Self {
            command_field: C_ECHO_RSP,
            message_id,
            data_set_type: NO_DATA_SET,
            priority: 0,
            status: Some(status),
            affected_sop_class_uid: Some(crate::types::VERIFICATION_SOP_CLASS.to_string()),
            affected_sop_instance_uid: None,
        }
    }

    pub fn c_store_rq(
        message_id: u16,
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            command_field: C_STORE_RQ,
            message_id,
            data_set_type: HAS_DATA_SET,
            priority: 0,
            status: None,
            affected_sop_class_uid: Some(sop_class_uid.into()),
            affected_sop_instance_uid: Some(sop_instance_uid.into()),
        }
    }

    pub fn c_store_rsp(request: &Command, status: u16) -> Self {
        Self {
            command_field: C_STORE_RSP,
            message_id: request.message_id,
            data_set_type: NO_DATA_SET,
            priority: 0,
            status: Some(status),
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
        }
    }

    /// Whether a data set follows this command on the association.
    pub fn has_data_set(&self) -> bool {
        self.data_set_type != NO_DATA_SET
    }

    pub fn is_request(&self) -> bool {
        self.command_field & 0x8000 == 0
    }

    /// Encode as an implicit-VR-LE element stream, group length first.
    pub fn encode(&self) -> Bytes {
        let mut elements = BytesMut::new();

        if let Some(uid) = &self.affected_sop_class_uid {
            put_uid(&mut elements, TAG_AFFECTED_SOP_CLASS_UID, uid);
        }
        put_u16_element(&mut elements, TAG_COMMAND_FIELD, self.command_field);
        if self.is_request() {
            put_u16_element(&mut elements, TAG_MESSAGE_ID, self.message_id);
            if self.command_field == C_STORE_RQ {
                put_u16_element(&mut elements, TAG_PRIORITY, self.priority);
            }
        } else {
            put_u16_element(&mut elements, TAG_MESSAGE_ID_RESPONDED_TO, self.message_id);
        }
        put_u16_element(&mut elements, TAG_DATA_SET_TYPE, self.data_set_type);
        if let Some(status) = self.status {
            put_u16_element(&mut elements, TAG_STATUS, status);
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            put_uid(&mut elements, TAG_AFFECTED_SOP_INSTANCE_UID, uid);
        }

        let mut out = BytesMut::with_capacity(12 + elements.len());
        put_tag(&mut out, TAG_GROUP_LENGTH);
        out.put_u32_le(4);
        out.put_u32_le(elements.len() as u32);
        out.put_slice(&elements);
        out.freeze()
    }

    /// Decode from the reassembled command PDV bytes.
    pub fn decode(mut data: Bytes) -> Result<Command> {
        let mut command_field = None;
        let mut message_id = None;
        let mut data_set_type = None;
        let mut priority = 0;
        let mut status = None;
        let mut affected_sop_class_uid = None;
        let mut affected_sop_instance_uid = None;

        while data.has_remaining() {
            if data.remaining() < 8 {
                return Err(DimseError::protocol("truncated command element header"));
            }
            let group = data.get_u16_le();
            let element = data.get_u16_le();
            let length = data.get_u32_le() as usize;
            if data.remaining() < length {
                return Err(DimseError::protocol(format!(
                    "command element ({group:04X},{element:04X}) length {length} overruns buffer"
                )));
            }
            let value = data.split_to(length);

            match (group, element) {
                TAG_GROUP_LENGTH => {}
                TAG_AFFECTED_SOP_CLASS_UID => {
                    affected_sop_class_uid = Some(string_value(&value)?);
                }
                TAG_COMMAND_FIELD => command_field = Some(u16_value(&value)?),
                TAG_MESSAGE_ID => message_id = Some(u16_value(&value)?),
                TAG_MESSAGE_ID_RESPONDED_TO => message_id = Some(u16_value(&value)?),
                TAG_PRIORITY => priority = u16_value(&value)?,
                TAG_DATA_SET_TYPE => data_set_type = Some(u16_value(&value)?),
                TAG_STATUS => status = Some(u16_value(&value)?),
                TAG_AFFECTED_SOP_INSTANCE_UID => {
                    affected_sop_instance_uid = Some(string_value(&value)?);
                }
                // Unknown group-0000 elements are tolerated.
                _ => {}
            }
        }

        let command_field =
            command_field.ok_or_else(|| DimseError::protocol("command set missing CommandField"))?;
        let message_id =
            message_id.ok_or_else(|| DimseError::protocol("command set missing MessageID"))?;
        let data_set_type = data_set_type
            .ok_or_else(|| DimseError::protocol("command set missing CommandDataSetType"))?;

        Ok(Command {
            command_field,
            message_id,
            data_set_type,
            priority,
            status,
            affected_sop_class_uid,
            affected_sop_instance_uid,
        })
    }
}

fn put_tag(buf: &mut BytesMut, tag: (u16, u16)) {
    buf.put_u16_le(tag.0);
    buf.put_u16_le(tag.1);
}

fn put_u16_element(buf: &mut BytesMut, tag: (u16, u16), value: u16) {
    put_tag(buf, tag);
    buf.put_u32_le(2);
    buf.put_u16_le(value);
}

fn put_uid(buf: &mut BytesMut, tag: (u16, u16), uid: &str) {
    let mut value = uid.as_bytes().to_vec();
    if value.len() % 2 != 0 {
        value.push(0);
    }
    put_tag(buf, tag);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(&value);
}

fn u16_value(value: &Bytes) -> Result<u16> {
    if value.len() < 2 {
        return Err(DimseError::protocol("US command element shorter than 2 bytes"));
    }
    Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn string_value(value: &Bytes) -> Result<String> {
    let text = std::str::from_utf8(value)
        .map_err(|_| DimseError::protocol("command UID is not valid ASCII"))?;
    Ok(text.trim_end_matches([' ', '\0']).to_string())
}
