use crate::protocol::Reply;
use nom::branch::alt;
use nom::bytes::streaming::{take, take_until};
use nom::character::streaming::{char, crlf, digit1};
use nom::combinator::{map, map_res, opt};
use nom::multi::count;
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;

// Streaming combinators throughout: `Err::Incomplete` tells the transport to
// read more bytes, every other failure is a hard protocol error.

fn read_positive_decimal(bytes: &[u8]) -> IResult<&[u8], u64> {
    map_res(digit1, |digits: &[u8]| {
        std::str::from_utf8(digits)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u64>().map_err(|_| ()))
    })(bytes)
}

fn read_decimal(bytes: &[u8]) -> IResult<&[u8], i64> {
    let (rem, (minus, int)) = tuple((opt(char('-')), read_positive_decimal))(bytes)?;
    Ok((
        rem,
        if minus.is_some() {
            -(int as i64)
        } else {
            int as i64
        },
    ))
}

fn bad_length(bytes: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Failure(nom::error::Error::new(bytes, nom::error::ErrorKind::Verify))
}

fn read_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn read_simple(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char('+'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| Reply::Status(read_string(s)))(bytes)
}

fn read_error(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char('-'), terminated(take_until("\r\n"), crlf));
    map(parser, |s: &[u8]| Reply::Error(read_string(s)))(bytes)
}

fn read_integer(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let parser = preceded(char(':'), terminated(read_decimal, crlf));
    map(parser, Reply::Integer)(bytes)
}

// supports null ($-1)
fn read_bulk(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let (rem, size) = preceded(char('$'), terminated(read_decimal, crlf))(bytes)?;
    match size {
        -1 => Ok((rem, Reply::Nil)),
        n if n >= 0 => terminated(
            map(take(n as usize), |b: &[u8]| Reply::Bulk(b.to_vec())),
            crlf,
        )(rem),
        _ => Err(bad_length(bytes)),
    }
}

// supports null (*-1); nesting recurses, depth bounded only by server output
fn read_array(bytes: &[u8]) -> IResult<&[u8], Reply> {
    let (rem, size) = preceded(char('*'), terminated(read_decimal, crlf))(bytes)?;
    match size {
        -1 => Ok((rem, Reply::Nil)),
        n if n >= 0 => map(count(read, n as usize), Reply::Array)(rem),
        _ => Err(bad_length(bytes)),
    }
}

pub fn read(bytes: &[u8]) -> IResult<&[u8], Reply> {
    alt((read_integer, read_simple, read_bulk, read_error, read_array))(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_read_simple() {
        let res = read(b"+OK!! \r\n").unwrap();
        assert_eq!(res.0.len(), 0);
        assert_eq!(Reply::Status("OK!! ".into()), res.1);
    }

    #[test]
    pub fn test_read_error_line() {
        let res = read(b"-ERR unknown command 'FOO'\r\n").unwrap();
        assert_eq!(res.0.len(), 0);
        assert_eq!(Reply::Error("ERR unknown command 'FOO'".into()), res.1);
    }

    #[test]
    pub fn test_read_bulk_easy() {
        let res = read(b"$5\r\nhello\r\n").unwrap();
        assert_eq!(res.0.len(), 0);
        assert_eq!(Reply::Bulk(b"hello".to_vec()), res.1);
    }

    #[test]
    pub fn test_read_bulk_empty() {
        assert_eq!(Reply::Bulk(Vec::new()), read(b"$0\r\n\r\n").unwrap().1);
    }

    #[test]
    pub fn test_read_bulk_binary() {
        assert_eq!(
            Reply::Bulk(b"a\r\nb".to_vec()),
            read(b"$4\r\na\r\nb\r\n").unwrap().1
        );
    }

    #[test]
    pub fn test_read_decimal_easy() {
        assert_eq!(Reply::Integer(299), read(b":299\r\n").unwrap().1);
    }

    #[test]
    pub fn test_read_decimal_negative() {
        assert_eq!(Reply::Integer(-299), read(b":-299\r\n").unwrap().1);
    }

    #[test]
    pub fn test_read_garbage_should_fail() {
        match read(b"c299\r\n") {
            Err(nom::Err::Error(_)) => (),
            other => panic!("expected hard error, got {:?}", other),
        }
    }

    #[test]
    pub fn test_read_empty_is_incomplete() {
        match read(b"") {
            Err(nom::Err::Incomplete(_)) => (),
            other => panic!("expected incomplete, got {:?}", other),
        }
    }

    #[test]
    pub fn test_read_truncated_is_incomplete() {
        let frames: [&[u8]; 4] = [b"+OK", b"$5\r\nhel", b":12", b"*2\r\n:1\r\n"];
        for frame in frames {
            match read(frame) {
                Err(nom::Err::Incomplete(_)) => (),
                other => panic!("expected incomplete for {:?}, got {:?}", frame, other),
            }
        }
    }

    #[test]
    pub fn test_read_decimal_rem() {
        assert_eq!(Reply::Integer(299), read(b":299\r\nbdc").unwrap().1);
        assert_eq!(b"bdc", read(b":299\r\nbdc").unwrap().0);
    }

    #[test]
    pub fn test_read_null() {
        assert_eq!(Reply::Nil, read(b"$-1\r\n").unwrap().1);
    }

    #[test]
    pub fn test_read_null_array() {
        assert_eq!(Reply::Nil, read(b"*-1\r\n").unwrap().1);
    }

    #[test]
    pub fn test_read_bad_length_is_fatal() {
        match read(b"$-2\r\n") {
            Err(nom::Err::Failure(_)) => (),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    pub fn test_read_array() {
        assert_eq!(
            Reply::Array(vec![
                Reply::Bulk(b"hello".to_vec()),
                Reply::Bulk(b"world".to_vec())
            ]),
            read_array(b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n").unwrap().1
        );
        assert_eq!(Reply::Array(vec![]), read_array(b"*0\r\n").unwrap().1);
    }

    #[test]
    pub fn test_read_nested_array() {
        let res = read(b"*2\r\n*2\r\n+a\r\n:1\r\n$2\r\nhi\r\n").unwrap();
        assert_eq!(
            Reply::Array(vec![
                Reply::Array(vec![Reply::Status("a".into()), Reply::Integer(1)]),
                Reply::Bulk(b"hi".to_vec()),
            ]),
            res.1
        );
    }
}
