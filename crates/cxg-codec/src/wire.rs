// SPDX-License-Identifier: Apache-2.0

//! Byte-level layout shared by the encoder and the decoder.
//!
//! All integers and floats are little-endian. A buffer is
//! `magic | version | n_rows:u32 | n_cols:u32 | flags:u8 | [col_index] | columns*`
//! and every column is `type_code:u8 | payload`.

use crate::error::CodecError;

pub(crate) const MAGIC: &[u8; 4] = b"CXGM";
pub(crate) const VERSION: u8 = 1;
pub(crate) const FLAG_COL_INDEX: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeCode {
    DenseUInt32 = 1,
    DenseInt32 = 2,
    DenseFloat32 = 3,
    SparseFloat32 = 4,
    SparseFloat64 = 5,
    CategoricalU8 = 6,
    CategoricalU16 = 7,
    CategoricalU32 = 8,
    Json = 9,
}

impl TypeCode {
    pub(crate) fn from_u8(raw: u8) -> Result<Self, CodecError> {
        Ok(match raw {
            1 => Self::DenseUInt32,
            2 => Self::DenseInt32,
            3 => Self::DenseFloat32,
            4 => Self::SparseFloat32,
            5 => Self::SparseFloat64,
            6 => Self::CategoricalU8,
            7 => Self::CategoricalU16,
            8 => Self::CategoricalU32,
            9 => Self::Json,
            other => return Err(CodecError::UnknownTypeCode(other)),
        })
    }

    /// Smallest categorical code width that fits `cardinality` categories.
    #[must_use]
    pub fn categorical_for(cardinality: usize) -> Self {
        if cardinality <= 1 << 8 {
            Self::CategoricalU8
        } else if cardinality <= 1 << 16 {
            Self::CategoricalU16
        } else {
            Self::CategoricalU32
        }
    }
}

pub(crate) fn len_u32(n: usize) -> Result<u32, CodecError> {
    u32::try_from(n).map_err(|_| CodecError::TooLarge(n))
}

pub(crate) struct Writer {
    pub(crate) buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn u32_slice(&mut self, v: &[u32]) {
        self.buf.reserve(v.len() * 4);
        for x in v {
            self.buf.extend_from_slice(&x.to_le_bytes());
        }
    }

    pub(crate) fn i32_slice(&mut self, v: &[i32]) {
        self.buf.reserve(v.len() * 4);
        for x in v {
            self.buf.extend_from_slice(&x.to_le_bytes());
        }
    }

    pub(crate) fn f32_slice(&mut self, v: &[f32]) {
        self.buf.reserve(v.len() * 4);
        for x in v {
            self.buf.extend_from_slice(&x.to_le_bytes());
        }
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn words(&mut self, n: usize, width: usize) -> Result<&'a [u8], CodecError> {
        let total = n
            .checked_mul(width)
            .ok_or(CodecError::TooLarge(n))?;
        self.take(total)
    }

    pub(crate) fn u32_vec(&mut self, n: usize) -> Result<Vec<u32>, CodecError> {
        Ok(self
            .words(n, 4)?
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub(crate) fn i32_vec(&mut self, n: usize) -> Result<Vec<i32>, CodecError> {
        Ok(self
            .words(n, 4)?
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub(crate) fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>, CodecError> {
        Ok(self
            .words(n, 4)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub(crate) fn f64_vec(&mut self, n: usize) -> Result<Vec<f64>, CodecError> {
        Ok(self
            .words(n, 8)?
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect())
    }

    pub(crate) fn u16_vec(&mut self, n: usize) -> Result<Vec<u32>, CodecError> {
        Ok(self
            .words(n, 2)?
            .chunks_exact(2)
            .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect())
    }

    pub(crate) fn u8_vec(&mut self, n: usize) -> Result<Vec<u32>, CodecError> {
        Ok(self.take(n)?.iter().map(|b| u32::from(*b)).collect())
    }
}
