//! Wire primitives shared by all frame payloads.
//!
//! Var-ints use LEB128: seven value bits per byte, high bit set on all but
//! the final byte. Strings and byte blobs are length-prefixed with a
//! var-int; UUIDs are 16 raw bytes.

use super::error::NetworkError;
use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

const MAX_VAR_INT_BYTES: usize = 10;

pub fn put_var_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn get_var_u64(buf: &mut impl Buf) -> Result<u64, NetworkError> {
    let mut value = 0u64;
    for i in 0..MAX_VAR_INT_BYTES {
        if !buf.has_remaining() {
            return Err(NetworkError::Decode("truncated var-int".to_string()));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(NetworkError::Decode("var-int too long".to_string()))
}

/// Number of bytes [`put_var_u64`] emits for `value`.
pub fn var_u64_len(value: u64) -> usize {
    let bits = 64 - value.max(1).leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool, NetworkError> {
    if !buf.has_remaining() {
        return Err(NetworkError::Decode("truncated bool".to_string()));
    }
    Ok(buf.get_u8() != 0)
}

pub fn put_uuid(buf: &mut impl BufMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

pub fn get_uuid(buf: &mut impl Buf) -> Result<Uuid, NetworkError> {
    if buf.remaining() < 16 {
        return Err(NetworkError::Decode("truncated uuid".to_string()));
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_var_u64(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> Result<String, NetworkError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| NetworkError::Decode(format!("invalid utf-8 string: {e}")))
}

pub fn put_bytes(buf: &mut impl BufMut, value: &[u8]) {
    put_var_u64(buf, value.len() as u64);
    buf.put_slice(value);
}

pub fn get_bytes(buf: &mut impl Buf) -> Result<Bytes, NetworkError> {
    let len = get_var_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(NetworkError::Decode(format!(
            "length prefix {len} exceeds remaining {}",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Optional UUID encoded as the nil UUID for `None`, matching the frame
/// header convention of `0 if none`.
pub fn put_opt_uuid(buf: &mut impl BufMut, value: Option<&Uuid>) {
    match value {
        Some(id) => put_uuid(buf, id),
        None => put_uuid(buf, &Uuid::nil()),
    }
}

pub fn get_opt_uuid(buf: &mut impl Buf) -> Result<Option<Uuid>, NetworkError> {
    let id = get_uuid(buf)?;
    Ok(if id.is_nil() { None } else { Some(id) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_var_int_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_var_u64(&mut buf, value);
            assert_eq!(buf.len(), var_u64_len(value));
            let mut read = buf.freeze();
            assert_eq!(get_var_u64(&mut read).unwrap(), value);
        }
    }

    #[test]
    fn test_var_int_single_byte_boundary() {
        let mut buf = BytesMut::new();
        put_var_u64(&mut buf, 127);
        assert_eq!(buf.len(), 1);

        let mut buf = BytesMut::new();
        put_var_u64(&mut buf, 128);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_truncated_var_int_fails() {
        let mut buf = Bytes::from_static(&[0x80]);
        assert!(get_var_u64(&mut buf).is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "lobby-1");
        put_string(&mut buf, "");
        let mut read = buf.freeze();
        assert_eq!(get_string(&mut read).unwrap(), "lobby-1");
        assert_eq!(get_string(&mut read).unwrap(), "");
    }

    #[test]
    fn test_uuid_roundtrip() {
        let id = Uuid::new_v4();
        let mut buf = BytesMut::new();
        put_uuid(&mut buf, &id);
        put_opt_uuid(&mut buf, None);
        put_opt_uuid(&mut buf, Some(&id));

        let mut read = buf.freeze();
        assert_eq!(get_uuid(&mut read).unwrap(), id);
        assert_eq!(get_opt_uuid(&mut read).unwrap(), None);
        assert_eq!(get_opt_uuid(&mut read).unwrap(), Some(id));
    }

    #[test]
    fn test_bytes_length_prefix_validated() {
        let mut buf = BytesMut::new();
        put_var_u64(&mut buf, 100);
        buf.put_slice(b"short");
        let mut read = buf.freeze();
        assert!(get_bytes(&mut read).is_err());
    }
}
