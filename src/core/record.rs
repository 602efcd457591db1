//! Purpose: Frame a row of columns as one binary or delimited-text record.
//! Exports: `Record`, `RecordOptions`, `DataFormat`, `LineTerminator`.
//! Role: Unit of data written to a pipe endpoint by a load session.
//! Invariants: Binary records start with a little-endian u16 equal to the bytes that follow it.
//! Invariants: A binary record body never exceeds `MAX_RECORD_BODY`; oversized layouts
//! are rejected when the record is built.
//! Invariants: Text records render SQL NULL as the bare token `\N`.
use std::io::{self, BufRead, Read, Write};

use crate::core::codec::text::{self, Charset, NULL_TOKEN};
use crate::core::codec::{ByteReader, ByteWriter, Column, ColumnKind, ColumnSpec, Endian, NullIndicator};
use crate::core::error::{Error, ErrorKind};

pub const LENGTH_PREFIX: usize = 2;
pub const MAX_RECORD_BODY: usize = u16::MAX as usize;
pub const RECORD_ENDIAN: Endian = Endian::Little;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataFormat {
    Text,
    Binary,
}

impl DataFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" | "txt" | "txt_variable" => Some(Self::Text),
            "binary" | "bin" => Some(Self::Binary),
            _ => None,
        }
    }

    /// Value for the `@bh_dataformat` session variable.
    pub fn format_directive(self) -> &'static str {
        match self {
            Self::Text => "txt_variable",
            Self::Binary => "binary",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineTerminator {
    Lf,
    CrLf,
}

impl LineTerminator {
    pub fn native() -> Self {
        if cfg!(windows) { Self::CrLf } else { Self::Lf }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }

    /// Escaped form for a quoted SQL string literal.
    pub fn sql_literal(self) -> &'static str {
        match self {
            Self::Lf => "\\n",
            Self::CrLf => "\\r\\n",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RecordOptions {
    pub charset: Charset,
    pub strict: bool,
    pub line_terminator: LineTerminator,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            charset: Charset::Latin1,
            strict: false,
            line_terminator: LineTerminator::native(),
        }
    }
}

#[derive(Debug)]
pub struct Record {
    columns: Vec<Column>,
    nulls: NullIndicator,
    format: DataFormat,
    options: RecordOptions,
    binary: ByteWriter,
    text: String,
    text_bytes: Vec<u8>,
    scratch: Vec<u8>,
}

impl Record {
    pub fn new(columns: Vec<Column>, format: DataFormat, options: RecordOptions) -> Result<Self, Error> {
        let nulls = NullIndicator::new(columns.len());
        if format == DataFormat::Binary {
            let worst = nulls.byte_len()
                + columns
                    .iter()
                    .map(|column| column.kind().max_binary_width())
                    .sum::<usize>();
            if worst > MAX_RECORD_BODY {
                return Err(Error::new(ErrorKind::Serialization)
                    .with_message(format!(
                        "record layout may need {worst} bytes, binary records hold at most {MAX_RECORD_BODY}"
                    ))
                    .with_hint("Narrow VARCHAR/VARBINARY columns or use the text format."));
            }
        }
        Ok(Self {
            columns,
            nulls,
            format,
            options,
            binary: ByteWriter::with_limit(LENGTH_PREFIX + MAX_RECORD_BODY, RECORD_ENDIAN),
            text: String::new(),
            text_bytes: Vec::new(),
            scratch: Vec::new(),
        })
    }

    /// Builds one column per spec, applying the record's charset and strictness.
    pub fn from_specs(specs: &[ColumnSpec], format: DataFormat, options: RecordOptions) -> Result<Self, Error> {
        let binary = format == DataFormat::Binary;
        let columns = specs
            .iter()
            .map(|spec| {
                Ok(Column::new(spec.name.clone(), ColumnKind::from_spec(spec, binary)?)
                    .with_charset(options.charset)
                    .with_strict(options.strict))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Self::new(columns, format, options)
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn options(&self) -> RecordOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_mut(&mut self, index: usize) -> Option<&mut Column> {
        self.columns.get_mut(index)
    }

    pub fn column_by_name(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|column| column.name() == name)
    }

    /// Sets every column to NULL.
    pub fn clear(&mut self) {
        for column in &mut self.columns {
            column.set_null(true);
        }
    }

    /// Encodes the current values in this record's format and returns the bytes.
    pub fn encode(&mut self) -> Result<&[u8], Error> {
        match self.format {
            DataFormat::Binary => self.encode_binary(),
            DataFormat::Text => self.encode_text(),
        }
    }

    pub fn write_to<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<(), Error> {
        let bytes = self.encode()?;
        out.write_all(bytes).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to write record")
                .with_source(err)
        })
    }

    pub fn encode_binary(&mut self) -> Result<&[u8], Error> {
        self.binary.clear();
        self.binary.put_u16(0)?;
        self.nulls.reset();
        for (index, column) in self.columns.iter().enumerate() {
            self.nulls.set(index, column.is_null());
        }
        self.binary.put_slice(self.nulls.as_bytes())?;
        for column in &self.columns {
            column.encode_binary(&mut self.binary)?;
        }
        let body = self.binary.len() - LENGTH_PREFIX;
        let body = u16::try_from(body).map_err(|_| {
            Error::new(ErrorKind::Serialization)
                .with_message(format!("record body of {body} bytes overflows the length prefix"))
        })?;
        self.binary.patch_u16(0, body)?;
        Ok(self.binary.as_slice())
    }

    pub fn encode_text(&mut self) -> Result<&[u8], Error> {
        self.text.clear();
        for (index, column) in self.columns.iter().enumerate() {
            if index > 0 {
                self.text.push(text::DELIMITER);
            }
            match column.encode_text()? {
                None => self.text.push_str(NULL_TOKEN),
                Some(value) if column.needs_enclosure() => text::enclose(&value, &mut self.text),
                Some(value) => self.text.push_str(&value),
            }
        }
        self.text.push_str(self.options.line_terminator.as_str());
        self.text_bytes = self.options.charset.encode(&self.text, true)?;
        Ok(&self.text_bytes)
    }

    /// Decodes one binary record from the front of `frame`; returns the bytes consumed.
    pub fn decode_binary(&mut self, frame: &[u8]) -> Result<usize, Error> {
        let mut input = ByteReader::new(frame, RECORD_ENDIAN);
        let body = usize::from(input.get_u16()?);
        let body_bytes = input.take(body)?;
        let mut input = ByteReader::new(body_bytes, RECORD_ENDIAN);
        let bitmap = input.take(self.nulls.byte_len())?;
        self.nulls.load(bitmap);
        for (index, column) in self.columns.iter_mut().enumerate() {
            column.decode_binary(&mut input, self.nulls.is_null(index))?;
        }
        if input.remaining() != 0 {
            return Err(Error::new(ErrorKind::Serialization).with_message(format!(
                "record length prefix says {body} bytes but columns used {}",
                input.position()
            )));
        }
        Ok(LENGTH_PREFIX + body)
    }

    /// Reads the next binary record; `Ok(false)` on a clean end of stream.
    pub fn read_binary<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<bool, Error> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match read_full(reader, &mut prefix)? {
            0 => return Ok(false),
            LENGTH_PREFIX => {}
            _ => {
                return Err(Error::new(ErrorKind::Serialization)
                    .with_message("stream ended inside a record length prefix"));
            }
        }
        let body = usize::from(u16::from_le_bytes(prefix));
        let mut frame = std::mem::take(&mut self.scratch);
        frame.clear();
        frame.extend_from_slice(&prefix);
        frame.resize(LENGTH_PREFIX + body, 0);
        let result = reader
            .read_exact(&mut frame[LENGTH_PREFIX..])
            .map_err(|err| {
                Error::new(ErrorKind::Serialization)
                    .with_message("stream ended inside a record body")
                    .with_source(err)
            })
            .and_then(|()| self.decode_binary(&frame));
        self.scratch = frame;
        result.map(|_| true)
    }

    /// Parses one text record; a trailing line terminator is ignored.
    pub fn decode_text(&mut self, line: &str) -> Result<(), Error> {
        let line = line
            .strip_suffix("\r\n")
            .or_else(|| line.strip_suffix('\n'))
            .unwrap_or(line);
        let fields = text::split_fields(line)?;
        if fields.len() != self.columns.len() {
            return Err(Error::new(ErrorKind::Serialization).with_message(format!(
                "text record has {} fields, expected {}",
                fields.len(),
                self.columns.len()
            )));
        }
        for (column, field) in self.columns.iter_mut().zip(fields) {
            match field {
                None => column.set_null(true),
                Some(value) => column.set_from_text(&value)?,
            }
        }
        Ok(())
    }

    /// Reads the next text record; values must not contain line terminators.
    pub fn read_text<R: BufRead + ?Sized>(&mut self, reader: &mut R) -> Result<bool, Error> {
        self.scratch.clear();
        let read = reader.read_until(b'\n', &mut self.scratch).map_err(|err| {
            Error::new(ErrorKind::Serialization)
                .with_message("failed to read text record")
                .with_source(err)
        })?;
        if read == 0 {
            return Ok(false);
        }
        let line = self.options.charset.decode(&self.scratch)?;
        self.decode_text(&line)?;
        Ok(true)
    }
}

fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::Serialization)
                    .with_message("failed to read record")
                    .with_source(err));
            }
        }
    }
    Ok(filled)
}
