use crate::types::{Error, ResultT};
use async_recursion::async_recursion;
use tokio::io::AsyncWriteExt;

const CRLF: [u8; 2] = [b'\r', b'\n'];
const NULL_MSG: &[u8] = b"$-1\r\n";

// One decoded reply frame. A server error (-ERR ...) is a valid frame, not a
// transport failure; the connection stays usable after one.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
    Nil,
}

// tag byte, payload, crlf
async fn write_line<W>(writer: &mut W, tag: u8, payload: &[u8]) -> ResultT<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_u8(tag).await?;
    writer.write_all(payload).await?;
    writer.write_all(&CRLF).await?;
    Ok(())
}

async fn write_bulk<W>(writer: &mut W, payload: &[u8]) -> ResultT<()>
where
    W: AsyncWriteExt + Unpin,
{
    write_line(writer, b'$', payload.len().to_string().as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.write_all(&CRLF).await?;
    Ok(())
}

impl Reply {
    // used by the handshake and by every mock server in the tests
    #[async_recursion]
    pub async fn write_async<W>(&self, writer: &mut W, flush: bool) -> ResultT<()>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        match self {
            Reply::Status(s) => write_line(writer, b'+', s.as_bytes()).await?,
            Reply::Error(err) => write_line(writer, b'-', err.as_bytes()).await?,
            Reply::Integer(int) => {
                write_line(writer, b':', int.to_string().as_bytes()).await?
            }
            Reply::Bulk(payload) => write_bulk(writer, payload).await?,
            Reply::Array(items) => {
                write_line(writer, b'*', items.len().to_string().as_bytes()).await?;
                for el in items.iter() {
                    el.write_async(writer, false).await?;
                }
            }
            Reply::Nil => writer.write_all(NULL_MSG).await?,
        };
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn as_status(&self) -> ResultT<&str> {
        match self {
            Reply::Status(s) => Ok(s),
            other => Err(shape_mismatch("status", other)),
        }
    }

    pub fn as_integer(&self) -> ResultT<i64> {
        match self {
            Reply::Integer(i) => Ok(*i),
            other => Err(shape_mismatch("integer", other)),
        }
    }

    // servers use status and bulk interchangeably for short strings
    pub fn as_bytes(&self) -> ResultT<&[u8]> {
        match self {
            Reply::Bulk(b) => Ok(b),
            Reply::Status(s) => Ok(s.as_bytes()),
            other => Err(shape_mismatch("bulk", other)),
        }
    }

    pub fn as_array(&self) -> ResultT<&[Reply]> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(shape_mismatch("array", other)),
        }
    }

    pub fn into_array(self) -> ResultT<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(shape_mismatch("array", &other)),
        }
    }
}

fn shape_mismatch(expected: &str, got: &Reply) -> Error {
    Error::protocol(format!("expected {} reply, got {:?}", expected, got))
}

// flattens the alternating key/value array shape (HGETALL, CONFIG GET, the
// stream info family) into ordered pairs, server order preserved
pub fn pairs_to_map(reply: Reply) -> ResultT<Vec<(Vec<u8>, Reply)>> {
    let items = reply.into_array()?;
    if items.len() % 2 != 0 {
        return Err(Error::protocol(format!(
            "key/value array has odd length {}",
            items.len()
        )));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let key = match key {
            Reply::Bulk(b) => b,
            Reply::Status(s) => s.into_bytes(),
            other => {
                return Err(Error::protocol(format!(
                    "key/value array key is not a string: {:?}",
                    other
                )))
            }
        };
        pairs.push((key, value));
    }
    Ok(pairs)
}

// argument to token bytes; numbers become their ASCII decimal form
pub trait ToArg {
    fn to_arg(&self) -> Vec<u8>;
}

impl ToArg for &str {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for &String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Vec<u8> {
        self.clone()
    }
}

impl ToArg for i64 {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl ToArg for u64 {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl ToArg for i32 {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl ToArg for u32 {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl ToArg for usize {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

// command name plus arguments, in order; name case is preserved as submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    tokens: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: impl Into<Vec<u8>>) -> Command {
        Command {
            tokens: vec![name.into()],
        }
    }

    pub fn arg<A: ToArg>(mut self, arg: A) -> Command {
        self.tokens.push(arg.to_arg());
        self
    }

    pub fn args<A, I>(mut self, args: I) -> Command
    where
        A: ToArg,
        I: IntoIterator<Item = A>,
    {
        for a in args {
            self.tokens.push(a.to_arg());
        }
        self
    }

    pub fn name(&self) -> &[u8] {
        &self.tokens[0]
    }

    pub(crate) fn is_named(&self, name: &str) -> bool {
        self.tokens[0].eq_ignore_ascii_case(name.as_bytes())
    }

    // the inline multi-bulk request form: *N then one bulk string per token
    pub(crate) async fn write_async<W>(&self, writer: &mut W, flush: bool) -> ResultT<()>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        write_line(writer, b'*', self.tokens.len().to_string().as_bytes()).await?;
        for token in self.tokens.iter() {
            write_bulk(writer, token).await?;
        }
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    pub async fn test_reply_encoding() -> ResultT<()> {
        let req: Vec<(Reply, Vec<u8>)> = vec![
            (Reply::Status("OK".into()), b"+OK\r\n".to_vec()),
            (Reply::Error("ERR oops".into()), b"-ERR oops\r\n".to_vec()),
            (Reply::Integer(129), b":129\r\n".to_vec()),
            (Reply::Integer(-3), b":-3\r\n".to_vec()),
            (Reply::Bulk(b"foobar".to_vec()), b"$6\r\nfoobar\r\n".to_vec()),
            (Reply::Nil, b"$-1\r\n".to_vec()),
            (
                Reply::Array(vec![
                    Reply::Bulk(b"foo".to_vec()),
                    Reply::Bulk(b"bar".to_vec()),
                ]),
                b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec(),
            ),
            (
                Reply::Array(vec![1, 2, 3].iter().map(|i| Reply::Integer(*i)).collect()),
                b"*3\r\n:1\r\n:2\r\n:3\r\n".to_vec(),
            ),
        ];
        for (en, bytes) in req.iter() {
            let mut b = Cursor::new(Vec::new());
            en.write_async(&mut b, true).await?;
            assert_eq!(&b.into_inner(), bytes);
        }
        Ok(())
    }

    #[tokio::test]
    pub async fn test_command_encoding() -> ResultT<()> {
        let cmd = Command::new("SET").arg("counter").arg(42i64);
        let mut b = Cursor::new(Vec::new());
        cmd.write_async(&mut b, true).await?;
        assert_eq!(
            b.into_inner(),
            b"*3\r\n$3\r\nSET\r\n$7\r\ncounter\r\n$2\r\n42\r\n".to_vec()
        );
        Ok(())
    }

    #[tokio::test]
    pub async fn test_command_case_preserved() -> ResultT<()> {
        let cmd = Command::new("get").arg(b"raw\x00bytes".as_ref());
        let mut b = Cursor::new(Vec::new());
        cmd.write_async(&mut b, true).await?;
        assert_eq!(
            b.into_inner(),
            b"*2\r\n$3\r\nget\r\n$9\r\nraw\x00bytes\r\n".to_vec()
        );
        assert!(cmd.is_named("GET"));
        Ok(())
    }

    #[tokio::test]
    pub async fn test_encode_decode_round_trip() -> ResultT<()> {
        let frames = vec![
            Reply::Status("OK".into()),
            Reply::Error("ERR nope".into()),
            Reply::Integer(-42),
            Reply::Bulk(b"with\r\ninner crlf".to_vec()),
            Reply::Bulk(Vec::new()),
            Reply::Nil,
            Reply::Array(vec![
                Reply::Status("first".into()),
                Reply::Array(vec![Reply::Integer(1), Reply::Nil]),
                Reply::Bulk(b"last".to_vec()),
            ]),
        ];
        for frame in frames {
            let mut encoded = Cursor::new(Vec::new());
            frame.write_async(&mut encoded, true).await?;
            let encoded = encoded.into_inner();
            let (rem, decoded) = crate::parser::read(&encoded)
                .map_err(|err| Error::protocol(format!("round trip failed: {}", err)))?;
            assert!(rem.is_empty());
            assert_eq!(decoded, frame);
        }
        Ok(())
    }

    #[test]
    pub fn test_accessors() {
        assert_eq!(Reply::Integer(7).as_integer().unwrap(), 7);
        assert_eq!(Reply::Status("OK".into()).as_status().unwrap(), "OK");
        assert_eq!(
            Reply::Bulk(b"v".to_vec()).as_bytes().unwrap(),
            b"v".as_ref()
        );
        assert!(Reply::Nil.is_nil());
        assert!(Reply::Nil.as_integer().is_err());
        assert!(Reply::Status("OK".into()).as_array().is_err());
    }

    #[test]
    pub fn test_pairs_to_map() {
        let reply = Reply::Array(vec![
            Reply::Bulk(b"name".to_vec()),
            Reply::Bulk(b"events".to_vec()),
            Reply::Bulk(b"length".to_vec()),
            Reply::Integer(12),
        ]);
        let pairs = pairs_to_map(reply).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (b"name".to_vec(), Reply::Bulk(b"events".to_vec())));
        assert_eq!(pairs[1], (b"length".to_vec(), Reply::Integer(12)));

        let odd = Reply::Array(vec![Reply::Bulk(b"k".to_vec())]);
        assert!(pairs_to_map(odd).is_err());
        assert!(pairs_to_map(Reply::Integer(1)).is_err());
    }
}
