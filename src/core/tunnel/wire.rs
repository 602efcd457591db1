// Control frames: u16 big-endian byte length followed by UTF-8 text.
use std::io::{self, Read, Write};

use crate::core::error::{Error, ErrorKind};

pub const MAX_FRAME: usize = u16::MAX as usize;

pub fn write_utf<W: Write + ?Sized>(out: &mut W, value: &str) -> Result<(), Error> {
    let len = u16::try_from(value.len()).map_err(|_| {
        Error::new(ErrorKind::Protocol)
            .with_message(format!("control frame of {} bytes exceeds {MAX_FRAME}", value.len()))
    })?;
    out.write_all(&len.to_be_bytes())
        .and_then(|()| out.write_all(value.as_bytes()))
        .and_then(|()| out.flush())
        .map_err(|err| {
            Error::new(ErrorKind::Connection)
                .with_message("failed to send control frame")
                .with_source(err)
        })
}

pub fn read_utf<R: Read + ?Sized>(input: &mut R) -> Result<String, Error> {
    let mut prefix = [0u8; 2];
    input.read_exact(&mut prefix).map_err(read_error)?;
    let mut body = vec![0u8; usize::from(u16::from_be_bytes(prefix))];
    input.read_exact(&mut body).map_err(read_error)?;
    String::from_utf8(body).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_message("control frame is not valid UTF-8")
            .with_source(err)
    })
}

fn read_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::new(ErrorKind::Protocol)
            .with_message("connection closed inside a control frame")
            .with_source(err),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::new(ErrorKind::Timeout)
            .with_message("timed out waiting for a control frame")
            .with_source(err),
        _ => Error::new(ErrorKind::Connection)
            .with_message("failed to read control frame")
            .with_source(err),
    }
}

#[cfg(test)]
mod tests {
    use super::{read_utf, write_utf};
    use crate::core::error::ErrorKind;
    use std::io::Cursor;

    #[test]
    fn frame_layout_is_length_then_bytes() {
        let mut out = Vec::new();
        write_utf(&mut out, "linux").expect("write");
        assert_eq!(out, b"\x00\x05linux");
        write_utf(&mut out, "").expect("write");
        let mut input = Cursor::new(out);
        assert_eq!(read_utf(&mut input).expect("first"), "linux");
        assert_eq!(read_utf(&mut input).expect("second"), "");
    }

    #[test]
    fn truncated_frame_is_protocol_error() {
        let mut input = Cursor::new(b"\x00\x09abc".to_vec());
        assert_eq!(read_utf(&mut input).expect_err("short").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn invalid_utf8_is_protocol_error() {
        let mut input = Cursor::new(b"\x00\x02\xff\xfe".to_vec());
        assert_eq!(read_utf(&mut input).expect_err("bad").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let big = "x".repeat(70_000);
        let mut out = Vec::new();
        assert_eq!(write_utf(&mut out, &big).expect_err("big").kind(), ErrorKind::Protocol);
        assert!(out.is_empty());
    }
}
