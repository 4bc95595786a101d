//! Chunked transfer coding for streamed responses (RFC 9112 §7.1).

use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};

/// The zero-length chunk and empty trailer section that end a chunked body.
pub const TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Frames `data` as one chunk: `hex(len) CRLF data CRLF`.
///
/// An empty `data` would read as the terminating chunk, so callers skip it.
///
/// # Examples
///
/// ```
/// use weft::http::chunked;
///
/// assert_eq!(&chunked::encode(b"hello")[..], b"5\r\nhello\r\n");
/// assert_eq!(&chunked::encode(&[0u8; 26])[..4], b"1a\r\n");
/// ```
pub fn encode(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    // Writing into a BytesMut cannot fail.
    let _ = write!(Writer(&mut buf), "{:x}\r\n", data.len());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

struct Writer<'a>(&'a mut BytesMut);

impl Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
