use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Value};

// Caps matching redis proper: a single bulk payload is at most 512 MiB,
// and nested arrays are bounded so a malicious frame cannot recurse us
// off the stack.
const MAX_BULK_LEN: i64 = 512 << 20;
const MAX_ARRAY_LEN: i64 = 1 << 20;
const MAX_DEPTH: usize = 32;

/// Incremental RESP2 codec. Decoding returns `Ok(None)` on a partial frame;
/// inline command lines decode as arrays of bulk strings.
#[derive(Debug, Default)]
pub struct Codec;

impl Decoder for Codec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Error> {
        loop {
            // Empty inline lines are ignored, not errors.
            if src.starts_with(b"\r\n") {
                let _ = src.split_to(2);
                continue;
            }
            if src.is_empty() {
                return Ok(None);
            }
            return match parse(src, 0)? {
                Some((value, consumed)) => {
                    let _ = src.split_to(consumed);
                    Ok(Some(value))
                }
                None => Ok(None),
            };
        }
    }
}

impl Encoder<Value> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Error> {
        encode(&item, dst);
        Ok(())
    }
}

/// Writes the RESP encoding of `value` into `buf`.
pub fn encode(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        Value::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        Value::Integer(i) => {
            buf.put_u8(b':');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        Value::Bulk(data) => {
            buf.put_u8(b'$');
            buf.put_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        Value::Null => buf.put_slice(b"$-1\r\n"),
        Value::Array(items) => {
            buf.put_u8(b'*');
            buf.put_slice(items.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for item in items {
                encode(item, buf);
            }
        }
    }
}

// Parses one complete value from the front of `buf`, returning it with the
// number of bytes it occupies, or None if the frame is still incomplete.
fn parse(buf: &[u8], depth: usize) -> Result<Option<(Value, usize)>, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::Protocol("array nesting too deep".to_string()));
    }
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    match kind {
        b'+' => Ok(line(buf, 1)?.map(|(text, consumed)| {
            (Value::Simple(String::from_utf8_lossy(text).into_owned()), consumed)
        })),
        b'-' => Ok(line(buf, 1)?.map(|(text, consumed)| {
            (Value::Error(String::from_utf8_lossy(text).into_owned()), consumed)
        })),
        b':' => {
            let Some((text, consumed)) = line(buf, 1)? else {
                return Ok(None);
            };
            let n = parse_int(text)?;
            Ok(Some((Value::Integer(n), consumed)))
        }
        b'$' => {
            let Some((text, header)) = line(buf, 1)? else {
                return Ok(None);
            };
            let len = parse_int(text)?;
            if len == -1 {
                return Ok(Some((Value::Null, header)));
            }
            if len < 0 || len > MAX_BULK_LEN {
                return Err(Error::Protocol(format!("invalid bulk length {len}")));
            }
            let len = len as usize;
            let total = header + len + 2;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[header + len..total] != b"\r\n" {
                return Err(Error::Protocol("bulk string missing CRLF".to_string()));
            }
            let data = Bytes::copy_from_slice(&buf[header..header + len]);
            Ok(Some((Value::Bulk(data), total)))
        }
        b'*' => {
            let Some((text, header)) = line(buf, 1)? else {
                return Ok(None);
            };
            let len = parse_int(text)?;
            if len == -1 {
                return Ok(Some((Value::Null, header)));
            }
            if len < 0 || len > MAX_ARRAY_LEN {
                return Err(Error::Protocol(format!("invalid array length {len}")));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut consumed = header;
            for _ in 0..len {
                match parse(&buf[consumed..], depth + 1)? {
                    Some((item, n)) => {
                        items.push(item);
                        consumed += n;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), consumed)))
        }
        // Inline command: a bare line, split on whitespace.
        _ => {
            let Some((text, consumed)) = line(buf, 0)? else {
                return Ok(None);
            };
            let args: Vec<Value> = text
                .split(|b| b.is_ascii_whitespace())
                .filter(|part| !part.is_empty())
                .map(|part| Value::Bulk(Bytes::copy_from_slice(part)))
                .collect();
            if args.is_empty() {
                return Err(Error::Protocol("empty inline command".to_string()));
            }
            Ok(Some((Value::Array(args), consumed)))
        }
    }
}

// Returns the content of the first CRLF-terminated line, skipping `skip`
// leading bytes (the type byte for typed frames), and the total bytes
// consumed through the CRLF.
fn line(buf: &[u8], skip: usize) -> Result<Option<(&[u8], usize)>, Error> {
    let mut i = skip;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' {
            if buf[i + 1] != b'\n' {
                return Err(Error::Protocol("bare CR in line".to_string()));
            }
            return Ok(Some((&buf[skip..i], i + 2)));
        }
        i += 1;
    }
    Ok(None)
}

fn parse_int(text: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid integer '{}'",
                String::from_utf8_lossy(text)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Value> {
        let mut codec = Codec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(value) = codec.decode(&mut buf).unwrap() {
            out.push(value);
        }
        assert!(buf.is_empty(), "undecoded bytes remain: {buf:?}");
        out
    }

    #[test]
    fn decodes_typed_frames() {
        assert_eq!(decode_all(b"+OK\r\n"), vec![Value::Simple("OK".into())]);
        assert_eq!(
            decode_all(b"-ERR boom\r\n"),
            vec![Value::Error("ERR boom".into())]
        );
        assert_eq!(decode_all(b":42\r\n"), vec![Value::Integer(42)]);
        assert_eq!(decode_all(b"$3\r\nbar\r\n"), vec![Value::bulk("bar")]);
        assert_eq!(decode_all(b"$-1\r\n"), vec![Value::Null]);
        assert_eq!(decode_all(b"$0\r\n\r\n"), vec![Value::bulk("")]);
    }

    #[test]
    fn decodes_command_arrays_and_nesting() {
        assert_eq!(
            decode_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n"),
            vec![Value::Array(vec![Value::bulk("GET"), Value::bulk("foo")])]
        );
        assert_eq!(
            decode_all(b"*2\r\n:1\r\n*1\r\n+nested\r\n"),
            vec![Value::Array(vec![
                Value::Integer(1),
                Value::Array(vec![Value::Simple("nested".into())]),
            ])]
        );
        assert_eq!(decode_all(b"*-1\r\n"), vec![Value::Null]);
    }

    #[test]
    fn decodes_inline_commands() {
        assert_eq!(
            decode_all(b"PING\r\n"),
            vec![Value::Array(vec![Value::bulk("PING")])]
        );
        assert_eq!(
            decode_all(b"SET  foo   bar\r\n"),
            vec![Value::Array(vec![
                Value::bulk("SET"),
                Value::bulk("foo"),
                Value::bulk("bar"),
            ])]
        );
        // Blank lines between pipelined inline commands are skipped.
        assert_eq!(
            decode_all(b"\r\nPING\r\n"),
            vec![Value::Array(vec![Value::bulk("PING")])]
        );
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut codec = Codec;
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"o\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Value::Array(vec![Value::bulk("GET"), Value::bulk("foo")]))
        );
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let decoded = decode_all(b"+OK\r\n:7\r\n$2\r\nhi\r\n");
        assert_eq!(
            decoded,
            vec![Value::Simple("OK".into()), Value::Integer(7), Value::bulk("hi")]
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        let mut codec = Codec;
        let mut buf = BytesMut::from(&b"$bad\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"$3\r\nbarXX"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_round_trips() {
        let value = Value::Array(vec![
            Value::Simple("OK".into()),
            Value::Integer(-3),
            Value::bulk("payload"),
            Value::Null,
        ]);
        let mut buf = BytesMut::new();
        encode(&value, &mut buf);
        assert_eq!(decode_all(&buf), vec![value]);
    }

    #[test]
    fn encoding_layout() {
        let mut buf = BytesMut::new();
        encode(
            &Value::Array(vec![Value::bulk("SET"), Value::bulk("k"), Value::bulk("v")]),
            &mut buf,
        );
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");

        let mut buf = BytesMut::new();
        encode(&Value::Error("ERR no cache".into()), &mut buf);
        insta::assert_snapshot!(
            String::from_utf8_lossy(&buf).escape_debug().to_string(),
            @r"-ERR no cache\r\n"
        );
    }
}
