//! The generic sized operand value.

use std::fmt;

/// Capacity of a [`Value`] in bytes, enough for a full ZMM register.
pub const VALUE_CAPACITY: usize = 64;

macro_rules! value_lane_impl {
    ($get:ident : $set:ident => $t:ident) => {
        pub fn $get(&self, index: usize) -> $t {
            let mut raw = [0; std::mem::size_of::<$t>()];
            let n = raw.len();
            raw.copy_from_slice(&self.data[index * n..][..n]);
            $t::from_le_bytes(raw)
        }
        pub fn $set(&mut self, index: usize, value: $t) {
            let raw = value.to_le_bytes();
            self.data[index * raw.len()..][..raw.len()].copy_from_slice(&raw);
        }
    };
}

/// A sized little-endian operand value.
///
/// This is the uniform currency of every operand read and write: register, memory, and
/// immediate operands all round-trip through a `Value` of their declared size.
/// The backing store is a plain byte array addressable as 1/2/4/8-byte lanes, which keeps the
/// type free of any union-style aliasing.
#[derive(Clone, Copy)]
pub struct Value {
    data: [u8; VALUE_CAPACITY],
    size: usize,
}
impl Value {
    /// Creates a zeroed value of the given size.
    /// Sizes above [`VALUE_CAPACITY`] are clamped; callers validate operand sizes up front.
    pub fn new(size: usize) -> Self {
        debug_assert!(size >= 1 && size <= VALUE_CAPACITY);
        Value { data: [0; VALUE_CAPACITY], size: size.min(VALUE_CAPACITY) }
    }
    /// Creates a value of the given size (at most 8) from the low bytes of `v`.
    pub fn from_u64(v: u64, size: usize) -> Self {
        debug_assert!(size >= 1 && size <= 8);
        let mut res = Value::new(size.min(8));
        let raw = v.to_le_bytes();
        res.data[..res.size].copy_from_slice(&raw[..res.size]);
        res
    }
    /// Creates a value holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut res = Value::new(bytes.len());
        res.data[..res.size].copy_from_slice(&bytes[..res.size]);
        res
    }

    /// The declared size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
    /// The value content as a byte slice of the declared size.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }
    /// Mutable view of the value content.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.data[..size]
    }

    /// The low 8 bytes as a `u64`, zero extended when the declared size is smaller.
    pub fn as_u64(&self) -> u64 {
        let mut raw = [0u8; 8];
        let n = self.size.min(8);
        raw[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(raw)
    }
    /// The low 8 bytes sign extended from the declared size.
    pub fn as_i64(&self) -> i64 {
        let v = self.as_u64();
        match self.size {
            1 => v as u8 as i8 as i64,
            2 => v as u16 as i16 as i64,
            4 => v as u32 as i32 as i64,
            _ => v as i64,
        }
    }

    pub fn get_u8(&self, index: usize) -> u8 {
        self.data[index]
    }
    pub fn set_u8(&mut self, index: usize, value: u8) {
        self.data[index] = value;
    }

    value_lane_impl! { get_u16 : set_u16 => u16 }
    value_lane_impl! { get_u32 : set_u32 => u32 }
    value_lane_impl! { get_u64 : set_u64 => u64 }

    /// Returns a copy resized to `size`, zero extending or truncating as needed.
    pub fn resized(&self, size: usize) -> Value {
        let mut res = Value::new(size);
        let n = self.size.min(res.size);
        res.data[..n].copy_from_slice(&self.data[..n]);
        res
    }
}
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Value[{}](", self.size)?;
        for b in self.bytes().iter().rev() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[test]
fn test_value_round_trip() {
    let v = Value::from_u64(0x1122334455667788, 8);
    assert_eq!(v.as_u64(), 0x1122334455667788);
    assert_eq!(v.get_u8(0), 0x88);
    assert_eq!(v.get_u16(1), 0x5566);
    assert_eq!(v.get_u32(1), 0x11223344);

    let v = Value::from_u64(0x1122334455667788, 4);
    assert_eq!(v.size(), 4);
    assert_eq!(v.as_u64(), 0x55667788);

    let v = Value::from_u64(0x80, 1);
    assert_eq!(v.as_i64(), -128);

    let mut v = Value::new(16);
    v.set_u64(1, 0xdeadbeef);
    assert_eq!(v.get_u64(1), 0xdeadbeef);
    assert_eq!(v.get_u64(0), 0);
    assert_eq!(v.resized(8).as_u64(), 0);
}
