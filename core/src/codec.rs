//! Message codec: frame-ID packing/unpacking and typed request/response
//! construction (spec §4.E).

use crate::frame::Frame;
use crate::model::{
    Direction, ErrorCode, NodeId, Opcode, PropertyIndex, ID_FIXED_MASK, ID_FIXED_PART,
    MAX_PROPERTY_INDEX,
};
use crate::Error;

/// Pack a frame ID from its constituent fields.
///
/// `property_index` is validated against `[1, 255]` for `ReadProperty` /
/// `WriteProperty`, and against `[0, 256)` for every other opcode — the
/// asymmetry spec §9 calls out (segment/context addressing for manifest
/// reads legitimately uses index `0`).
pub fn make_frame_id(
    node_id: NodeId,
    property_index: u8,
    opcode: Opcode,
    direction: Direction,
) -> Result<u32, Error> {
    match opcode {
        Opcode::ReadProperty | Opcode::WriteProperty => {
            if !(crate::model::MIN_PROPERTY_INDEX..=MAX_PROPERTY_INDEX).contains(&property_index) {
                return Err(Error::Protocol(format!(
                    "property_index {property_index} out of range for {opcode:?}"
                )));
            }
        }
        _ => {
            // property_index is a full u8 here, so it is always < 0x100.
        }
    }

    Ok(ID_FIXED_PART
        | ((direction as u32) << 16)
        | ((node_id.value() as u32) << 11)
        | ((opcode as u32) << 8)
        | property_index as u32)
}

/// Unpack a frame ID, rejecting anything whose fixed bits don't match.
pub fn unpack_id(id: u32) -> Result<(NodeId, u8, Opcode, Direction), Error> {
    if id & ID_FIXED_MASK != ID_FIXED_PART {
        return Err(Error::Protocol(format!(
            "frame id {id:#010x} does not match fixed pattern"
        )));
    }

    let property_index = (id & 0xFF) as u8;
    let opcode_int = ((id >> 8) & 0x7) as u8;
    let node_raw = ((id >> 11) & 0x1F) as u8;
    let dir_int = ((id >> 16) & 0x1) as u8;

    let opcode = Opcode::try_from(opcode_int)
        .map_err(|_| Error::Protocol(format!("unknown opcode {opcode_int}")))?;
    let direction = Direction::try_from(dir_int)
        .map_err(|_| Error::Protocol(format!("unknown direction {dir_int}")))?;
    // node_raw is already masked to 5 bits, so it's always in [0, 32).
    let node_id = NodeId::new(node_raw)?;

    Ok((node_id, property_index, opcode, direction))
}

pub fn make_read_manifest_request(node_id: NodeId, segment: u8) -> Result<Frame, Error> {
    let id = make_frame_id(node_id, segment, Opcode::ReadManifest, Direction::ClientToDevice)?;
    Ok(Frame::new(id, Vec::new()))
}

pub fn make_read_manifest_response(
    node_id: NodeId,
    segment: u8,
    payload: Vec<u8>,
) -> Result<Frame, Error> {
    let id = make_frame_id(node_id, segment, Opcode::ReadManifest, Direction::DeviceToClient)?;
    Ok(Frame::new(id, payload))
}

pub fn make_read_property_request(
    node_id: NodeId,
    property_index: PropertyIndex,
) -> Result<Frame, Error> {
    let id = make_frame_id(
        node_id,
        property_index.value(),
        Opcode::ReadProperty,
        Direction::ClientToDevice,
    )?;
    Ok(Frame::new(id, Vec::new()))
}

pub fn make_read_property_response(
    node_id: NodeId,
    property_index: PropertyIndex,
    payload: Vec<u8>,
) -> Result<Frame, Error> {
    let id = make_frame_id(
        node_id,
        property_index.value(),
        Opcode::ReadProperty,
        Direction::DeviceToClient,
    )?;
    Ok(Frame::new(id, payload))
}

pub fn make_write_property_request(
    node_id: NodeId,
    property_index: PropertyIndex,
    payload: Vec<u8>,
) -> Result<Frame, Error> {
    let id = make_frame_id(
        node_id,
        property_index.value(),
        Opcode::WriteProperty,
        Direction::ClientToDevice,
    )?;
    Ok(Frame::new(id, payload))
}

pub fn make_write_property_response(
    node_id: NodeId,
    property_index: PropertyIndex,
    payload: Vec<u8>,
) -> Result<Frame, Error> {
    let id = make_frame_id(
        node_id,
        property_index.value(),
        Opcode::WriteProperty,
        Direction::DeviceToClient,
    )?;
    Ok(Frame::new(id, payload))
}

pub fn make_error_response(
    node_id: NodeId,
    property_index: u8,
    request_opcode: Opcode,
    error_code: ErrorCode,
) -> Result<Frame, Error> {
    let id = make_frame_id(node_id, property_index, Opcode::Error, Direction::DeviceToClient)?;
    Ok(Frame::new(id, vec![request_opcode as u8, error_code as u8]))
}

/// Human-readable rendering of a frame, for logging (mirrors the source's
/// `stringify`).
pub fn stringify(frame: &Frame) -> String {
    match unpack_id(frame.id()) {
        Ok((node_id, property_index, Opcode::Error, Direction::DeviceToClient))
            if frame.data().len() == 2 =>
        {
            let request_opcode = Opcode::try_from(frame.data()[0])
                .map(|o| format!("{o:?}"))
                .unwrap_or_else(|_| format!("{:#04x}", frame.data()[0]));
            let error_code = ErrorCode::try_from(frame.data()[1])
                .map(|e| format!("{e:?}"))
                .unwrap_or_else(|_| format!("{:#04x}", frame.data()[1]));
            format!(
                "NODE_ID={node_id} ERROR=(INDEX={property_index} OPCODE={request_opcode}) ERROR_CODE={error_code}"
            )
        }
        Ok((node_id, property_index, opcode, direction)) => {
            let payload = frame
                .data()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join("_");
            format!(
                "NODE_ID={node_id} INDEX={property_index} OPCODE={opcode:?} DIR={direction:?} PAYLOAD={payload}"
            )
        }
        Err(e) => format!("<unparseable frame {:#010x}: {e}>", frame.id()),
    }
}
