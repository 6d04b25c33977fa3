//! Big-endian field helpers shared by the common binary images

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::{ensure_remaining, CodecError, Result};
use crate::text::TextEncoding;

pub(crate) fn put_text(buf: &mut impl BufMut, encoding: TextEncoding, text: &str) {
    let bytes = encoding.encode(text);
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(&bytes);
}

pub(crate) fn get_text(buf: &mut &[u8], encoding: TextEncoding, context: &str) -> Result<String> {
    let length = get_i32(buf, context)?;
    let length = usize::try_from(length)
        .map_err(|_| CodecError::serialization("binary image", format!("negative {context} length")))?;
    ensure_remaining(buf, length, context)?;
    let text = encoding.decode(&buf[..length])?;
    buf.advance(length);
    Ok(text)
}

pub(crate) fn put_guid(buf: &mut impl BufMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub(crate) fn get_guid(buf: &mut &[u8], context: &str) -> Result<Uuid> {
    ensure_remaining(buf, 16, context)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub(crate) fn get_i32(buf: &mut &[u8], context: &str) -> Result<i32> {
    ensure_remaining(buf, 4, context)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_count(buf: &mut &[u8], context: &str) -> Result<usize> {
    let count = get_i32(buf, context)?;
    usize::try_from(count)
        .map_err(|_| CodecError::serialization("binary image", format!("negative {context}")))
}
