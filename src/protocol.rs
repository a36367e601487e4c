use crate::types::ResultT;
use async_recursion::async_recursion;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

/// A RESP v2 value. Nil bulk strings and nil arrays are the `None` cases of
/// their variants; the wire keeps them distinct from the empty forms.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum RESP {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RESP>>),
}

pub(crate) const CRLF: [u8; 2] = [b'\r', b'\n'];
const NULL_BULK: &[u8] = b"$-1\r\n";
const NULL_ARRAY: &[u8] = b"*-1\r\n";

impl RESP {
    pub fn simple(text: impl Into<String>) -> RESP {
        RESP::SimpleString(text.into())
    }

    pub fn bulk(bytes: impl Into<Bytes>) -> RESP {
        RESP::BulkString(Some(bytes.into()))
    }

    /// Text content of a bulk or simple string, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RESP::SimpleString(s) => Some(s),
            RESP::BulkString(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RESP::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub async fn write_end<W>(b: &mut W) -> ResultT<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        for c in CRLF.iter() {
            b.write_u8(*c).await?;
        }
        Ok(())
    }

    #[async_recursion]
    pub async fn write_async<W>(self, writer: &mut W, flush: bool) -> ResultT<()>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        match self {
            RESP::SimpleString(s) => {
                writer.write_u8(b'+').await?;
                writer.write_all(s.as_bytes()).await?;
                RESP::write_end(writer).await?;
            }
            RESP::Error(err) => {
                writer.write_u8(b'-').await?;
                writer.write_all(err.as_bytes()).await?;
                RESP::write_end(writer).await?;
            }
            RESP::Integer(int) => {
                let string_rep: String = int.to_string();
                writer.write_u8(b':').await?;
                writer.write_all(string_rep.as_bytes()).await?;
                RESP::write_end(writer).await?;
            }
            RESP::BulkString(Some(s)) => {
                let len = s.len().to_string();
                writer.write_u8(b'$').await?;
                writer.write_all(len.as_bytes()).await?;
                RESP::write_end(writer).await?;
                writer.write_all(&s).await?;
                RESP::write_end(writer).await?;
            }
            RESP::BulkString(None) => writer.write_all(NULL_BULK).await?,
            RESP::Array(Some(mut vec)) => {
                writer.write_u8(b'*').await?;
                writer.write_all(vec.len().to_string().as_bytes()).await?;
                RESP::write_end(writer).await?;
                for el in vec.drain(0..vec.len()) {
                    el.write_async(writer, false).await?;
                }
            }
            RESP::Array(None) => writer.write_all(NULL_ARRAY).await?,
        };
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }
}

/// Builds the wire form every command takes: `[NAME, arg1, arg2, ...]` as
/// bulk strings.
pub fn command(name: &str, args: Vec<RESP>) -> Vec<RESP> {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(RESP::bulk(name.to_owned()));
    parts.extend(args);
    parts
}
