use crate::protocol::RESP;
use crate::types::{ClientError, ResultT};
use bytes::Bytes;
use nom::branch::alt;
use nom::bytes::streaming::{take, take_until};
use nom::character::streaming::{char, crlf, digit1};
use nom::combinator::{map, opt};
use nom::error::{Error, ErrorKind};
use nom::multi::count;
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;

// The streaming combinators report truncated input as `Err(Incomplete)`,
// which the connection driver answers by reading more bytes and retrying
// from the start of the value. Nothing is consumed until a full value
// parses.

fn malformed<T>(input: &[u8]) -> IResult<&[u8], T> {
    Err(nom::Err::Failure(Error::new(input, ErrorKind::Verify)))
}

/// Signed decimal with an i64 overflow check; overflow is a hard failure,
/// not a recoverable alternative.
fn read_decimal(bytes: &[u8]) -> IResult<&[u8], i64> {
    let (rem, (minus, digits)) = tuple((opt(char('-')), digit1))(bytes)?;
    let magnitude: Option<u64> = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok());
    let value = match (minus.is_some(), magnitude) {
        (false, Some(m)) if m <= i64::MAX as u64 => m as i64,
        (true, Some(m)) if m <= i64::MAX as u64 + 1 => (-(m as i128)) as i64,
        _ => return malformed(bytes),
    };
    Ok((rem, value))
}

fn read_simple(bytes: &[u8]) -> IResult<&[u8], RESP> {
    let parser = preceded(char('+'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| {
        RESP::SimpleString(String::from_utf8_lossy(s).into_owned())
    })(bytes)
}

fn read_error(bytes: &[u8]) -> IResult<&[u8], RESP> {
    let parser = preceded(char('-'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| {
        RESP::Error(String::from_utf8_lossy(s).into_owned())
    })(bytes)
}

fn read_integer(bytes: &[u8]) -> IResult<&[u8], RESP> {
    let parser = preceded(char(':'), terminated(read_decimal, crlf));
    map(parser, RESP::Integer)(bytes)
}

// supports null; the length is authoritative and the payload is binary-safe
fn read_bulk(bytes: &[u8]) -> IResult<&[u8], RESP> {
    let (rem, size) = preceded(char('$'), terminated(read_decimal, crlf))(bytes)?;
    if size == -1 {
        return Ok((rem, RESP::BulkString(None)));
    }
    if size < -1 {
        return malformed(bytes);
    }
    let (rem, payload) = terminated(take(size as usize), crlf)(rem)?;
    Ok((rem, RESP::BulkString(Some(Bytes::copy_from_slice(payload)))))
}

fn read_array(bytes: &[u8]) -> IResult<&[u8], RESP> {
    let (rem, size) = preceded(char('*'), terminated(read_decimal, crlf))(bytes)?;
    if size == -1 {
        return Ok((rem, RESP::Array(None)));
    }
    if size < -1 {
        return malformed(bytes);
    }
    map(count(read, size as usize), |v| RESP::Array(Some(v)))(rem)
}

pub fn read(bytes: &[u8]) -> IResult<&[u8], RESP> {
    alt((
        read_integer,
        read_simple,
        read_bulk,
        read_error,
        read_array,
    ))(bytes)
}

/// One attempt to parse a value from the front of `bytes`.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Parsed { value: RESP, consumed: usize },
    Incomplete,
}

pub fn decode(bytes: &[u8]) -> ResultT<Decoded> {
    match read(bytes) {
        Ok((rem, value)) => Ok(Decoded::Parsed {
            value,
            consumed: bytes.len() - rem.len(),
        }),
        Err(nom::Err::Incomplete(_)) => Ok(Decoded::Incomplete),
        Err(err) => Err(ClientError::Protocol(format!("{:?}", err))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parsed(bytes: &[u8]) -> (RESP, usize) {
        match decode(bytes).unwrap() {
            Decoded::Parsed { value, consumed } => (value, consumed),
            Decoded::Incomplete => panic!("unexpected incomplete"),
        }
    }

    #[test]
    pub fn test_read_simple() {
        let (value, consumed) = parsed(b"+OK\r\n");
        assert_eq!(value, RESP::simple("OK"));
        assert_eq!(consumed, 5);
    }

    #[test]
    pub fn test_read_empty_simple() {
        assert_eq!(parsed(b"+\r\n").0, RESP::simple(""));
    }

    #[test]
    pub fn test_read_error() {
        assert_eq!(
            parsed(b"-ERR unknown command\r\n").0,
            RESP::Error("ERR unknown command".into())
        );
    }

    #[test]
    pub fn test_read_bulk_easy() {
        assert_eq!(parsed(b"$5\r\nhello\r\n").0, RESP::bulk("hello"));
    }

    #[test]
    pub fn test_read_bulk_binary_safe() {
        assert_eq!(
            parsed(b"$7\r\na\r\nb\x00c\r\n").0,
            RESP::bulk(&b"a\r\nb\x00c"[..])
        );
    }

    #[test]
    pub fn test_null_bulk_vs_empty_bulk() {
        assert_eq!(parsed(b"$-1\r\n").0, RESP::BulkString(None));
        assert_eq!(parsed(b"$0\r\n\r\n").0, RESP::bulk(""));
    }

    #[test]
    pub fn test_read_decimal_easy() {
        assert_eq!(parsed(b":299\r\n").0, RESP::Integer(299));
    }

    #[test]
    pub fn test_read_decimal_negative() {
        assert_eq!(parsed(b":-299\r\n").0, RESP::Integer(-299));
    }

    #[test]
    pub fn test_read_decimal_extremes() {
        assert_eq!(
            parsed(b":9223372036854775807\r\n").0,
            RESP::Integer(i64::MAX)
        );
        assert_eq!(
            parsed(b":-9223372036854775808\r\n").0,
            RESP::Integer(i64::MIN)
        );
    }

    #[test]
    pub fn test_read_decimal_overflow_is_malformed() {
        assert!(decode(b":9223372036854775808\r\n").is_err());
    }

    #[test]
    pub fn test_read_garbage_is_malformed() {
        assert!(decode(b"c299\r\n").is_err());
        assert!(decode(b"$-2\r\n").is_err());
        assert!(decode(b"*-2\r\n").is_err());
    }

    #[test]
    pub fn test_read_decimal_rem() {
        let (value, consumed) = parsed(b":299\r\nbdc");
        assert_eq!(value, RESP::Integer(299));
        assert_eq!(consumed, 6);
    }

    #[test]
    pub fn test_read_null_array() {
        assert_eq!(parsed(b"*-1\r\n").0, RESP::Array(None));
    }

    #[test]
    pub fn test_read_array() {
        assert_eq!(
            parsed(b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n").0,
            RESP::Array(Some(vec![RESP::bulk("hello"), RESP::bulk("world")]))
        );
        assert_eq!(parsed(b"*0\r\n").0, RESP::Array(Some(vec![])));
    }

    #[test]
    pub fn test_read_nested_array() {
        assert_eq!(
            parsed(b"*2\r\n*2\r\n:1\r\n:2\r\n$3\r\nfoo\r\n").0,
            RESP::Array(Some(vec![
                RESP::Array(Some(vec![RESP::Integer(1), RESP::Integer(2)])),
                RESP::bulk("foo"),
            ]))
        );
    }

    #[test]
    pub fn test_incomplete_consumes_nothing() {
        for prefix in &[
            &b""[..],
            b"$",
            b"$5",
            b"$5\r\nhel",
            b"$5\r\nhello",
            b"*2\r\n:1\r\n",
            b"*2\r\n:1\r\n:2",
        ] {
            assert_eq!(decode(prefix).unwrap(), Decoded::Incomplete);
        }
    }

    // Feeding a stream split at every possible point must produce the same
    // values as feeding it whole.
    #[test]
    pub fn test_resumable_at_every_split() {
        let stream: &[u8] = b"+OK\r\n:42\r\n$5\r\nhello\r\n*2\r\n*2\r\n:1\r\n:2\r\n$3\r\nfoo\r\n-ERR x\r\n";
        let expected = vec![
            RESP::simple("OK"),
            RESP::Integer(42),
            RESP::bulk("hello"),
            RESP::Array(Some(vec![
                RESP::Array(Some(vec![RESP::Integer(1), RESP::Integer(2)])),
                RESP::bulk("foo"),
            ])),
            RESP::Error("ERR x".into()),
        ];

        for split in 0..=stream.len() {
            let mut buffer: Vec<u8> = Vec::new();
            let mut values = Vec::new();
            for chunk in &[&stream[..split], &stream[split..]] {
                buffer.extend_from_slice(chunk);
                loop {
                    match decode(&buffer).unwrap() {
                        Decoded::Parsed { value, consumed } => {
                            buffer.drain(..consumed);
                            values.push(value);
                        }
                        Decoded::Incomplete => break,
                    }
                }
            }
            assert_eq!(values, expected, "split at {}", split);
            assert!(buffer.is_empty());
        }
    }
}
