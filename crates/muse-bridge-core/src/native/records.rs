//! Device-list buffer codec.
//!
//! `muse_sdk_get_devices` fills a caller-owned buffer with:
//!
//! ```text
//! u16 count
//! count × { u8 name_len, name[name_len], u8 addr_len, addr[addr_len], f32 rssi, u8 model }
//! ```
//!
//! All integers are little-endian; strings are UTF-8 without terminator.
//! A record whose address is not valid UTF-8 decodes with an empty address
//! and is dropped later as incomplete.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use tracing::debug;

use super::traits::NativeError;
use crate::device::{DeviceDescriptor, DeviceFamily};

fn read_bytes(cursor: &mut Cursor<&[u8]>, field: &str) -> Result<Vec<u8>, NativeError> {
    let len = cursor
        .read_u8()
        .map_err(|_| NativeError::MalformedDeviceList(format!("truncated {} length", field)))?;
    let mut bytes = vec![0u8; len as usize];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| NativeError::MalformedDeviceList(format!("truncated {}", field)))?;
    Ok(bytes)
}

/// Decode a device-list buffer.
pub fn decode_device_list(buf: &[u8]) -> Result<Vec<DeviceDescriptor>, NativeError> {
    let mut cursor = Cursor::new(buf);
    let count = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| NativeError::MalformedDeviceList("missing record count".into()))?;

    let mut devices = Vec::with_capacity(count as usize);
    for index in 0..count {
        let name = String::from_utf8_lossy(&read_bytes(&mut cursor, "name")?).into_owned();
        // Addresses are identities; a mangled one must not match anything.
        let address = String::from_utf8(read_bytes(&mut cursor, "address")?).unwrap_or_else(|_| {
            debug!(record = index, "Device address is not UTF-8");
            String::new()
        });
        let rssi = cursor.read_f32::<LittleEndian>().map_err(|_| {
            NativeError::MalformedDeviceList(format!("record {} truncated at rssi", index))
        })?;
        let model = cursor.read_u8().map_err(|_| {
            NativeError::MalformedDeviceList(format!("record {} truncated at model", index))
        })?;
        devices.push(DeviceDescriptor {
            name,
            address,
            rssi: f64::from(rssi),
            family: DeviceFamily::from_model(model),
        });
    }
    Ok(devices)
}

/// Encode a device list in the native buffer layout.
pub fn encode_device_list(devices: &[DeviceDescriptor]) -> Result<Vec<u8>, NativeError> {
    let count = u16::try_from(devices.len())
        .map_err(|_| NativeError::InvalidArgument("too many devices".into()))?;
    let mut buf = Vec::new();
    // Writes into a Vec cannot fail.
    let _ = buf.write_u16::<LittleEndian>(count);
    for device in devices {
        for field in [&device.name, &device.address] {
            let len = u8::try_from(field.len()).map_err(|_| {
                NativeError::InvalidArgument(format!("field longer than 255 bytes: {}", field))
            })?;
            let _ = buf.write_u8(len);
            buf.extend_from_slice(field.as_bytes());
        }
        let _ = buf.write_f32::<LittleEndian>(device.rssi as f32);
        let _ = buf.write_u8(device.family.model());
    }
    Ok(buf)
}
