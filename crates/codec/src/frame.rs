//! Length-framed, compressed envelopes for the stream transport.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::Error;

/// Size of the outer length prefix on both transports.
pub const LENGTH_PREFIX: usize = 4;

/// Compresses `body` and appends one length-prefixed frame to `dst`.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use minibus_codec::frame;
///
/// let mut wire = BytesMut::new();
/// frame::encode(b"\x01\x03tmphi", &mut wire).unwrap();
///
/// let body = frame::split(&mut wire).unwrap().unwrap();
/// assert_eq!(body.as_slice(), b"\x01\x03tmphi");
/// assert!(wire.is_empty());
/// ```
pub fn encode(body: &[u8], dst: &mut BytesMut) -> Result<(), Error> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(64 + body.len() / 2),
        Compression::default(),
    );

    encoder.write_all(body).map_err(|_| Error::Decode)?;
    let block = encoder.finish().map_err(|_| Error::Decode)?;
    if block.len() > u32::MAX as usize {
        return Err(Error::InvalidInput);
    }

    dst.reserve(LENGTH_PREFIX + block.len());
    dst.put_u32(block.len() as u32);
    dst.put_slice(&block);
    Ok(())
}

/// Pops at most one frame off the front of `buffer` and returns its
/// decompressed body.
///
/// Returns `None` until the length prefix and the full compressed block
/// have arrived; the caller keeps reading and calls again. A malformed
/// block fails with [`Error::Decode`] but still consumes the frame, so
/// the buffer stays aligned on the next one.
pub fn split(buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if buffer.len() < LENGTH_PREFIX + length {
        return Ok(None);
    }

    buffer.advance(LENGTH_PREFIX);
    let block = buffer.split_to(length);

    let mut body = Vec::with_capacity(length * 2);
    ZlibDecoder::new(&block[..])
        .read_to_end(&mut body)
        .map_err(|_| Error::Decode)?;

    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::{encode, split};
    use crate::Error;

    #[test]
    fn incomplete_frames_wait_for_more_bytes() {
        let mut wire = BytesMut::new();
        encode(b"payload bytes", &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(split(&mut partial).unwrap().is_none());

        partial.put_u8(wire[wire.len() - 1]);
        let body = split(&mut partial).unwrap().unwrap();
        assert_eq!(body.as_slice(), b"payload bytes");
    }

    #[test]
    fn corrupt_block_consumes_exactly_one_frame() {
        let mut wire = BytesMut::new();
        wire.put_u32(4);
        wire.put_slice(b"\xde\xad\xbe\xef");
        encode(b"next", &mut wire).unwrap();

        assert!(matches!(split(&mut wire), Err(Error::Decode)));

        // The good frame behind the corrupt one is still readable.
        let body = split(&mut wire).unwrap().unwrap();
        assert_eq!(body.as_slice(), b"next");
    }

    #[test]
    fn coalesced_frames_split_one_at_a_time() {
        let mut wire = BytesMut::new();
        encode(b"first", &mut wire).unwrap();
        encode(b"", &mut wire).unwrap();

        assert_eq!(split(&mut wire).unwrap().unwrap().as_slice(), b"first");
        assert_eq!(split(&mut wire).unwrap().unwrap().as_slice(), b"");
        assert!(split(&mut wire).unwrap().is_none());
    }
}
