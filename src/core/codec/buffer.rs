// Bounded byte writer and checked byte reader for record encoding.
use bytes::{BufMut, BytesMut};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endian {
    Little,
    Big,
}

/// Append-only buffer that refuses to grow past a fixed limit.
#[derive(Debug)]
pub struct ByteWriter {
    buf: BytesMut,
    endian: Endian,
    limit: usize,
}

impl ByteWriter {
    pub fn with_limit(limit: usize, endian: Endian) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit),
            endian,
            limit,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn reserve(&self, additional: usize) -> Result<(), Error> {
        if self.buf.len() + additional > self.limit {
            return Err(Error::new(ErrorKind::Serialization).with_message(format!(
                "record exceeds buffer capacity of {} bytes",
                self.limit
            )));
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.reserve(1)?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), Error> {
        self.reserve(2)?;
        match self.endian {
            Endian::Little => self.buf.put_u16_le(value),
            Endian::Big => self.buf.put_u16(value),
        }
        Ok(())
    }

    pub fn put_i16(&mut self, value: i16) -> Result<(), Error> {
        self.put_u16(value as u16)
    }

    pub fn put_i32(&mut self, value: i32) -> Result<(), Error> {
        self.reserve(4)?;
        match self.endian {
            Endian::Little => self.buf.put_i32_le(value),
            Endian::Big => self.buf.put_i32(value),
        }
        Ok(())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<(), Error> {
        self.reserve(8)?;
        match self.endian {
            Endian::Little => self.buf.put_i64_le(value),
            Endian::Big => self.buf.put_i64(value),
        }
        Ok(())
    }

    pub fn put_f32(&mut self, value: f32) -> Result<(), Error> {
        self.put_i32(value.to_bits() as i32)
    }

    pub fn put_f64(&mut self, value: f64) -> Result<(), Error> {
        self.put_i64(value.to_bits() as i64)
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.reserve(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    pub fn put_fill(&mut self, byte: u8, count: usize) -> Result<(), Error> {
        self.reserve(count)?;
        self.buf.put_bytes(byte, count);
        Ok(())
    }

    /// Overwrites two bytes at `at` with `value` in this writer's byte order.
    pub fn patch_u16(&mut self, at: usize, value: u16) -> Result<(), Error> {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        let slot = self.buf.get_mut(at..at + 2).ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("length slot outside buffer")
        })?;
        slot.copy_from_slice(&bytes);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < len {
            return Err(Error::new(ErrorKind::Serialization).with_message(format!(
                "truncated record: need {len} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, Error> {
        let raw = self.array::<2>()?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    pub fn get_i16(&mut self) -> Result<i16, Error> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_i32(&mut self) -> Result<i32, Error> {
        let raw = self.array::<4>()?;
        Ok(match self.endian {
            Endian::Little => i32::from_le_bytes(raw),
            Endian::Big => i32::from_be_bytes(raw),
        })
    }

    pub fn get_i64(&mut self) -> Result<i64, Error> {
        let raw = self.array::<8>()?;
        Ok(match self.endian {
            Endian::Little => i64::from_le_bytes(raw),
            Endian::Big => i64::from_be_bytes(raw),
        })
    }

    pub fn get_f32(&mut self) -> Result<f32, Error> {
        Ok(f32::from_bits(self.get_i32()? as u32))
    }

    pub fn get_f64(&mut self) -> Result<f64, Error> {
        Ok(f64::from_bits(self.get_i64()? as u64))
    }
}
