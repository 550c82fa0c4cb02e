//! Property value codec: raw integer wire representation <-> scaled
//! physical value, with range enforcement (spec §4.H).

use log::warn;

use crate::manifest::Property;
use crate::model::PropertyType;
use crate::Error;

fn decode_raw(ty: PropertyType, bytes: &[u8]) -> Result<i64, Error> {
    if bytes.len() != ty.width() {
        return Err(Error::Protocol(format!(
            "expected {} bytes for {ty}, got {}",
            ty.width(),
            bytes.len()
        )));
    }

    Ok(match ty {
        PropertyType::Uint8 => bytes[0] as i64,
        PropertyType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        PropertyType::Uint32 => {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
        }
        PropertyType::Int8 => bytes[0] as i8 as i64,
        PropertyType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        PropertyType::Int32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
        }
    })
}

fn encode_raw(ty: PropertyType, raw: i64) -> Vec<u8> {
    match ty {
        PropertyType::Uint8 => vec![raw as u8],
        PropertyType::Uint16 => (raw as u16).to_le_bytes().to_vec(),
        PropertyType::Uint32 => (raw as u32).to_le_bytes().to_vec(),
        PropertyType::Int8 => (raw as i8).to_le_bytes().to_vec(),
        PropertyType::Int16 => (raw as i16).to_le_bytes().to_vec(),
        PropertyType::Int32 => (raw as i32).to_le_bytes().to_vec(),
    }
}

/// Decode a raw wire value into its physical value. A value outside
/// `range_str` is logged as a warning but still returned (spec §4.H, §7).
pub fn decode_value(property: &Property, bytes: &[u8]) -> Result<f64, Error> {
    let raw = decode_raw(property.r#type, bytes)?;
    let offset = property.offset()?;
    let scale = property.scale()?;
    let (min, max) = property.range()?;

    let physical = offset + raw as f64 * scale;

    if physical < min || physical > max {
        warn!(
            "property {} value {physical} out of allowed range ({min}; {max})",
            property.name
        );
    }

    Ok(physical)
}

/// Encode a physical value into its raw wire representation. Fails if
/// `physical_value` lies outside `range_str` (spec §4.H, §7).
pub fn encode_value(property: &Property, physical_value: f64) -> Result<Vec<u8>, Error> {
    let offset = property.offset()?;
    let scale = property.scale()?;
    let (min, max) = property.range()?;

    if physical_value < min || physical_value > max {
        return Err(Error::ValueOutOfRange {
            property_name: property.name.clone(),
            value: physical_value,
            min,
            max,
        });
    }

    let raw = ((physical_value - offset) / scale).round() as i64;
    Ok(encode_raw(property.r#type, raw))
}
