use serde::{Deserialize, Serialize};

use crate::ids::{FIRST_LOCAL_ID, NodeId};

const HALF_MAX_BITS: u16 = 0x7BFF;

/// Short id marker: a full `u32` id follows.
const WIDE_ID: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WireFormat {
    /// Half floats and 16-bit id offsets, widened when an id falls outside.
    #[default]
    Packed,
    Full,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} bytes, {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("unknown record tag {0}")]
    UnknownRecordTag(u8),
    #[error("unknown command kind {0}")]
    UnknownCommand(u8),
    #[error("unknown property value tag {0}")]
    UnknownValueTag(u8),
    #[error("unknown game status {0}")]
    UnknownStatus(i32),
}

pub fn f32_to_half(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;

    if value.is_nan() {
        return sign | 0x7E00;
    }

    let abs = bits & 0x7FFF_FFFF;

    // 65520 and above would round to infinity
    if abs >= 0x477F_F000 {
        return sign | HALF_MAX_BITS;
    }

    if abs < 0x3880_0000 {
        if abs < 0x3300_0000 {
            return sign;
        }
        let exponent = (abs >> 23) as i32;
        let mantissa = (abs & 0x007F_FFFF) | 0x0080_0000;
        let shift = (126 - exponent) as u32;
        let truncated = mantissa >> shift;
        let remainder = mantissa & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        let rounded = if remainder > halfway || (remainder == halfway && truncated & 1 == 1) {
            truncated + 1
        } else {
            truncated
        };
        return sign | rounded as u16;
    }

    let exponent = ((abs >> 23) as i32 - 112) as u32;
    let mantissa = abs & 0x007F_FFFF;
    let mut half = (exponent << 10) | (mantissa >> 13);
    let remainder = mantissa & 0x1FFF;
    if remainder > 0x1000 || (remainder == 0x1000 && half & 1 == 1) {
        half += 1;
    }
    sign | half as u16
}

pub fn half_to_f32(half: u16) -> f32 {
    let negative = half & 0x8000 != 0;
    let exponent = ((half >> 10) & 0x1F) as u32;
    let mantissa = (half & 0x03FF) as u32;

    let magnitude = match exponent {
        0 => mantissa as f32 / 16_777_216.0,
        31 if mantissa == 0 => f32::INFINITY,
        31 => f32::NAN,
        _ => f32::from_bits(((exponent + 112) << 23) | (mantissa << 13)),
    };

    if negative { -magnitude } else { magnitude }
}

#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_float(&mut self, value: f32, format: WireFormat) {
        match format {
            WireFormat::Packed => self.write_u16(f32_to_half(value)),
            WireFormat::Full => self.write_f32(value),
        }
    }

    pub fn write_id(&mut self, id: NodeId, format: WireFormat) {
        match format {
            WireFormat::Full => self.write_u32(id),
            WireFormat::Packed => {
                if id == 0 {
                    self.write_u16(0);
                    return;
                }
                match id
                    .checked_sub(FIRST_LOCAL_ID)
                    .filter(|offset| (1..WIDE_ID as u32).contains(offset))
                {
                    Some(offset) => self.write_u16(offset as u16),
                    None => {
                        self.write_u16(WIDE_ID);
                        self.write_u32(id);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < count {
            return Err(WireError::UnexpectedEnd {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        self.take(count)
    }

    pub fn read_float(&mut self, format: WireFormat) -> Result<f32, WireError> {
        match format {
            WireFormat::Packed => Ok(half_to_f32(self.read_u16()?)),
            WireFormat::Full => self.read_f32(),
        }
    }

    pub fn read_id(&mut self, format: WireFormat) -> Result<NodeId, WireError> {
        match format {
            WireFormat::Full => self.read_u32(),
            WireFormat::Packed => match self.read_u16()? {
                0 => Ok(0),
                WIDE_ID => self.read_u32(),
                offset => Ok(FIRST_LOCAL_ID + offset as u32),
            },
        }
    }
}
