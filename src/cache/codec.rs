//! Binary meta codec: a stable length-prefixed encoding of the cache entry
//! metadata tuple.
//!
//! `(status_code: u16, headers: [(name, value)], expire_at: Option<u64>,
//! origin_content_length: u64)` — headers as a `u32` count followed by
//! `(u32 name_len, bytes, u32 value_len, bytes)` repeats, all integers
//! big-endian. This is a from-scratch binary format, not a serialized
//! language-native object.

use crate::core::{ProxyError, ProxyResult};

/// One on-disk meta record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMeta {
    pub status_code: u16,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub expire_at: Option<u64>,
    pub origin_content_length: u64,
}

/// Encodes a [`CacheMeta`] into the stable binary wire format.
pub fn encode(meta: &CacheMeta) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + meta.headers.iter().map(|(n, v)| n.len() + v.len() + 8).sum::<usize>());

    buf.extend_from_slice(&meta.status_code.to_be_bytes());

    buf.extend_from_slice(&(meta.headers.len() as u32).to_be_bytes());
    for (name, value) in &meta.headers {
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value);
    }

    match meta.expire_at {
        Some(ts) => {
            buf.push(1);
            buf.extend_from_slice(&ts.to_be_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&0u64.to_be_bytes());
        }
    }

    buf.extend_from_slice(&meta.origin_content_length.to_be_bytes());

    buf
}

/// Decodes a [`CacheMeta`] from bytes previously produced by [`encode`].
///
/// Returns `Err` on any truncation or malformed length prefix; callers treat
/// a decode error exactly like a missing meta file.
pub fn decode(buf: &[u8]) -> ProxyResult<CacheMeta> {
    let mut cursor = Cursor::new(buf);

    let status_code = cursor.read_u16()?;

    let header_count = cursor.read_u32()? as usize;
    let mut headers = Vec::with_capacity(header_count.min(4096));
    for _ in 0..header_count {
        let name_len = cursor.read_u32()? as usize;
        let name = cursor.read_bytes(name_len)?.to_vec();
        let value_len = cursor.read_u32()? as usize;
        let value = cursor.read_bytes(value_len)?.to_vec();
        headers.push((name, value));
    }

    let has_expiry = cursor.read_u8()?;
    let expiry_raw = cursor.read_u64()?;
    let expire_at = if has_expiry == 1 { Some(expiry_raw) } else { None };

    let origin_content_length = cursor.read_u64()?;

    Ok(CacheMeta {
        status_code,
        headers,
        expire_at,
        origin_content_length,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> ProxyResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| ProxyError::Cache("meta length overflow".to_string()))?;
        if end > self.buf.len() {
            return Err(ProxyError::Cache("truncated meta record".to_string()));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> ProxyResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> ProxyResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> ProxyResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> ProxyResult<u64> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let meta = CacheMeta {
            status_code: 200,
            headers: vec![
                (b"content-type".to_vec(), b"text/css".to_vec()),
                (b"etag".to_vec(), b"\"abc\"".to_vec()),
            ],
            expire_at: Some(1_700_000_000),
            origin_content_length: 12345,
        };
        let encoded = encode(&meta);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(meta, decoded);
    }

    #[test]
    fn round_trips_without_expiry() {
        let meta = CacheMeta {
            status_code: 204,
            headers: vec![],
            expire_at: None,
            origin_content_length: 0,
        };
        let decoded = decode(&encode(&meta)).unwrap();
        assert_eq!(meta, decoded);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let meta = CacheMeta {
            status_code: 200,
            headers: vec![(b"x".to_vec(), b"y".to_vec())],
            expire_at: None,
            origin_content_length: 0,
        };
        let mut encoded = encode(&meta);
        encoded.truncate(encoded.len() - 2);
        assert!(decode(&encoded).is_err());
    }
}
