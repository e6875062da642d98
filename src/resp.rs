use bytes::{Buf, BytesMut};

/// A RESP reply value, serialized verbatim onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    Simple(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Int(i64),
    /// $5\r\nhello\r\n  or  $-1\r\n (null)
    Bulk(Option<Vec<u8>>),
    /// *2\r\n...  or  *-1\r\n (null)
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::Simple("OK".to_string())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        RespValue::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn int(n: i64) -> Self {
        RespValue::Int(n)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    pub fn null_bulk() -> Self {
        RespValue::Bulk(None)
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    pub fn null_array() -> Self {
        RespValue::Array(None)
    }

    /// Serialize this value to RESP bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Write RESP bytes into the given buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(coerce_inline(s).as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(coerce_inline(s).as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Int(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Bulk(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Bulk(Some(data)) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
            RespValue::Array(Some(items)) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }
}

/// Simple strings and errors are single-line types; any embedded whitespace
/// (including CR/LF) is collapsed to a plain space before emission.
fn coerce_inline(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect()
}

/// A request frame: the command name followed by its arguments, all raw bytes.
pub type Request = Vec<Vec<u8>>;

const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Streaming parser for the request side of the protocol.
///
/// Clients always send commands as arrays of bulk strings; anything else is
/// a protocol error and the connection is dropped. Handles partial reads:
/// call `parse_request` repeatedly as data arrives. Returns
/// `Ok(Some(request))` when a complete frame is available, `Ok(None)` when
/// more data is needed. On success the parsed bytes are consumed from `buf`.
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        return Err(ProtocolError::BadFrame(format!(
            "expected '*', got '{}'",
            buf[0] as char
        )));
    }

    let header_end = match find_crlf(buf, 1) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let count = parse_len(&buf[1..header_end])?;
    if count < 1 {
        return Err(ProtocolError::BadFrame("empty multibulk".to_string()));
    }
    if count > MAX_ARRAY_LEN {
        return Err(ProtocolError::BadFrame(
            "invalid multibulk length".to_string(),
        ));
    }

    // Parse without consuming; only advance the buffer once the whole frame
    // is present so a short read leaves it intact.
    let mut pos = header_end + 2;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match parse_bulk_at(buf, pos)? {
            Some((arg, next)) => {
                args.push(arg);
                pos = next;
            }
            None => return Ok(None),
        }
    }

    buf.advance(pos);
    Ok(Some(args))
}

/// Parse one `$<len>\r\n<bytes>\r\n` element starting at `pos`.
/// Returns the payload and the offset just past its trailing CRLF.
fn parse_bulk_at(buf: &BytesMut, pos: usize) -> Result<Option<(Vec<u8>, usize)>, ProtocolError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    if buf[pos] != b'$' {
        return Err(ProtocolError::BadFrame(format!(
            "expected '$', got '{}'",
            buf[pos] as char
        )));
    }
    let header_end = match find_crlf(buf, pos + 1) {
        Some(p) => p,
        None => return Ok(None),
    };
    let len = parse_len(&buf[pos + 1..header_end])?;
    if !(0..=MAX_BULK_LEN).contains(&len) {
        return Err(ProtocolError::BadFrame("invalid bulk length".to_string()));
    }
    let len = len as usize;

    let data_start = header_end + 2;
    let frame_end = data_start + len + 2;
    if buf.len() < frame_end {
        return Ok(None);
    }
    if &buf[data_start + len..frame_end] != b"\r\n" {
        return Err(ProtocolError::BadFrame(
            "missing CRLF after bulk string".to_string(),
        ));
    }
    Ok(Some((buf[data_start..data_start + len].to_vec(), frame_end)))
}

fn parse_len(raw: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::BadFrame("invalid length prefix".to_string()))
}

/// Find the position of the next `\r\n` at or after `start`.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if buf.len() < start + 2 {
        return None;
    }
    (start..buf.len() - 1).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol error: {0}")]
    BadFrame(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(raw: &str) -> (Result<Option<Request>, ProtocolError>, BytesMut) {
        let mut buf = BytesMut::from(raw);
        let r = parse_request(&mut buf);
        (r, buf)
    }

    #[test]
    fn parse_simple_request() {
        let (r, buf) = req("*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        let args = r.unwrap().unwrap();
        assert_eq!(args, vec![b"SET".to_vec(), b"foo".to_vec(), b"bar".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_empty_bulk_argument() {
        let (r, _) = req("*2\r\n$4\r\nECHO\r\n$0\r\n\r\n");
        let args = r.unwrap().unwrap();
        assert_eq!(args, vec![b"ECHO".to_vec(), b"".to_vec()]);
    }

    #[test]
    fn partial_frame_leaves_buffer_untouched() {
        let (r, buf) = req("*2\r\n$3\r\nGET\r\n$3\r\nfo");
        assert!(r.unwrap().is_none());
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfo");
    }

    #[test]
    fn partial_header_needs_more_data() {
        let (r, _) = req("*2\r\n$3");
        assert!(r.unwrap().is_none());
    }

    #[test]
    fn two_frames_parse_in_sequence() {
        let mut buf = BytesMut::from("*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(
            parse_request(&mut buf).unwrap().unwrap(),
            vec![b"PING".to_vec()]
        );
        assert_eq!(
            parse_request(&mut buf).unwrap().unwrap(),
            vec![b"PING".to_vec()]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn non_array_frame_is_rejected() {
        let (r, _) = req("PING\r\n");
        assert!(r.is_err());
    }

    #[test]
    fn non_bulk_element_is_rejected() {
        let (r, _) = req("*1\r\n:42\r\n");
        assert!(r.is_err());
    }

    #[test]
    fn empty_array_is_rejected() {
        let (r, _) = req("*0\r\n");
        assert!(r.is_err());
    }

    #[test]
    fn binary_payload_survives() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$4\r\n\x00\xff\r\x0a\r\n"[..]);
        let args = parse_request(&mut buf).unwrap().unwrap();
        assert_eq!(args[1], vec![0x00, 0xff, b'\r', b'\n']);
    }

    #[test]
    fn serialize_simple_and_error() {
        assert_eq!(RespValue::ok().serialize(), b"+OK\r\n");
        assert_eq!(RespValue::error("ERR bad").serialize(), b"-ERR bad\r\n");
    }

    #[test]
    fn serialize_coerces_inline_whitespace() {
        let v = RespValue::simple("a\r\nb\tc");
        assert_eq!(v.serialize(), b"+a  b c\r\n");
    }

    #[test]
    fn serialize_int_and_bulk() {
        assert_eq!(RespValue::int(-7).serialize(), b":-7\r\n");
        assert_eq!(RespValue::bulk("hello").serialize(), b"$5\r\nhello\r\n");
        assert_eq!(RespValue::null_bulk().serialize(), b"$-1\r\n");
    }

    #[test]
    fn serialize_arrays() {
        let v = RespValue::array(vec![RespValue::bulk("foo"), RespValue::int(42)]);
        assert_eq!(v.serialize(), b"*2\r\n$3\r\nfoo\r\n:42\r\n");
        assert_eq!(RespValue::null_array().serialize(), b"*-1\r\n");
    }
}
