// Charsets, hex and the delimited-text quoting rules.
use crate::core::error::{Error, ErrorKind};

pub const DELIMITER: char = ',';
pub const ENCLOSURE: char = '"';
pub const ESCAPE: char = '\\';
pub const NULL_TOKEN: &str = "\\N";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Charset {
    #[default]
    Latin1,
    Utf8,
}

impl Charset {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "iso-8859-1" | "latin1" | "latin-1" => Some(Self::Latin1),
            "utf-8" | "utf8" => Some(Self::Utf8),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Latin1 => "ISO-8859-1",
            Self::Utf8 => "UTF-8",
        }
    }

    /// Unmappable characters fail under `strict`, otherwise they become `?`.
    pub fn encode(self, text: &str, strict: bool) -> Result<Vec<u8>, Error> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Latin1 => {
                let mut out = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    match u8::try_from(u32::from(ch)) {
                        Ok(byte) => out.push(byte),
                        Err(_) if strict => {
                            return Err(Error::new(ErrorKind::Serialization).with_message(
                                format!("character {ch:?} is not representable in ISO-8859-1"),
                            ));
                        }
                        Err(_) => out.push(b'?'),
                    }
                }
                Ok(out)
            }
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, Error> {
        match self {
            Self::Latin1 => Ok(bytes.iter().map(|&byte| char::from(byte)).collect()),
            Self::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|err| {
                Error::new(ErrorKind::Serialization)
                    .with_message("column bytes are not valid UTF-8")
                    .with_source(err)
            }),
        }
    }

    /// Longest prefix of `bytes` that is at most `max` bytes and ends on a character boundary.
    pub fn truncate(self, bytes: &mut Vec<u8>, max: usize) {
        if bytes.len() <= max {
            return;
        }
        let mut cut = max;
        if self == Self::Utf8 {
            while cut > 0 && (bytes[cut] & 0xC0) == 0x80 {
                cut -= 1;
            }
        }
        bytes.truncate(cut);
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(DIGITS[usize::from(byte >> 4)]));
        out.push(char::from(DIGITS[usize::from(byte & 0x0F)]));
    }
    out
}

pub fn hex_decode(text: &str) -> Result<Vec<u8>, Error> {
    let invalid = || {
        Error::new(ErrorKind::Serialization).with_message(format!("\"{text}\" is not hex"))
    };
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(invalid());
    }
    let nibble = |byte: u8| -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    };
    text.as_bytes()
        .chunks(2)
        .map(|pair| Some((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(invalid)
}

/// Wraps `value` in the enclosure and escapes embedded enclosure and escape characters.
pub fn enclose(value: &str, out: &mut String) {
    out.push(ENCLOSURE);
    for ch in value.chars() {
        if ch == ENCLOSURE || ch == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(ch);
    }
    out.push(ENCLOSURE);
}

/// Splits one record line (terminator already removed) into fields; `None` is SQL NULL.
pub fn split_fields(line: &str) -> Result<Vec<Option<String>>, Error> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        let mut value = String::new();
        let mut enclosed = false;
        let mut raw = String::new();
        if chars.peek() == Some(&ENCLOSURE) {
            enclosed = true;
            chars.next();
            let mut closed = false;
            while let Some(ch) = chars.next() {
                match ch {
                    ESCAPE => match chars.next() {
                        Some(next) => value.push(next),
                        None => break,
                    },
                    ENCLOSURE => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(Error::new(ErrorKind::Serialization)
                    .with_message(format!("unterminated enclosure in field {}", fields.len())));
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch == DELIMITER {
                    break;
                }
                chars.next();
                raw.push(ch);
            }
        }

        if enclosed {
            fields.push(Some(value));
        } else if raw == NULL_TOKEN {
            fields.push(None);
        } else {
            fields.push(Some(unescape(&raw)));
        }

        match chars.next() {
            Some(DELIMITER) => continue,
            None => break,
            Some(other) => {
                return Err(Error::new(ErrorKind::Serialization).with_message(format!(
                    "expected '{DELIMITER}' after field {}, found {other:?}",
                    fields.len() - 1
                )));
            }
        }
    }
    Ok(fields)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == ESCAPE {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(ch);
    }
    out
}
