// Copyright © 2020 the courier developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Little-endian payload encoding and decoding helpers.

use std::mem::size_of;

use crate::net::NetError;
use crate::net::NetworkPacket;
use crate::net::MAX_PAYLOAD;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

/// Appends little-endian primitives to a packet's payload.
pub struct PacketEncoder<'a> {
    packet: &'a mut NetworkPacket,
}

impl<'a> PacketEncoder<'a> {
    pub fn new(packet: &'a mut NetworkPacket) -> PacketEncoder<'a> {
        PacketEncoder { packet }
    }

    fn reserve(&mut self, bytes: usize) -> Result<(), NetError> {
        if self.packet.payload().len() + bytes > MAX_PAYLOAD {
            return Err(NetError::PayloadTooLarge);
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), NetError> {
        self.reserve(size_of::<u8>())?;
        self.packet.payload_mut().push(value);
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), NetError> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), NetError> {
        let mut buf = [0; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), NetError> {
        self.write_u16(value as u16)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), NetError> {
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), NetError> {
        self.write_u32(value as u32)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), NetError> {
        let mut buf = [0; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), NetError> {
        self.write_u64(value as u64)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), NetError> {
        self.write_u32(value.to_bits())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), NetError> {
        self.write_u64(value.to_bits())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), NetError> {
        self.write_u8(value as u8)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        self.reserve(bytes.len())?;
        self.packet.payload_mut().extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<(), NetError> {
        if value.len() > u16::max_value() as usize {
            return Err(NetError::PayloadTooLarge);
        }
        self.write_u16(value.len() as u16)?;
        self.write_bytes(value.as_bytes())
    }
}

/// Reads little-endian primitives back out of a packet's payload.
pub struct PacketDecoder<'a> {
    payload: &'a [u8],
    head: usize,
}

impl<'a> PacketDecoder<'a> {
    pub fn new(packet: &'a NetworkPacket) -> PacketDecoder<'a> {
        PacketDecoder {
            payload: packet.payload(),
            head: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.head
    }

    fn take(&mut self, bytes: usize) -> Result<&'a [u8], NetError> {
        if self.remaining() < bytes {
            return Err(NetError::malformed(format!(
                "payload underrun: wanted {} bytes, {} left",
                bytes,
                self.remaining()
            )));
        }
        let slice = &self.payload[self.head..self.head + bytes];
        self.head += bytes;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, NetError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, NetError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, NetError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16, NetError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, NetError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, NetError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, NetError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, NetError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, NetError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, NetError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, NetError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self, bytes: usize) -> Result<&'a [u8], NetError> {
        self.take(bytes)
    }

    pub fn read_string(&mut self) -> Result<String, NetError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetError::malformed("string payload is not valid UTF-8"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encoder_decoder_read_write_eq() {
        let mut packet = NetworkPacket::new();
        {
            let mut encoder = PacketEncoder::new(&mut packet);
            encoder.write_u8(0xAB).unwrap();
            encoder.write_i16(-1234).unwrap();
            encoder.write_u32(0xDEAD_BEEF).unwrap();
            encoder.write_i64(-1).unwrap();
            encoder.write_f32(23.07).unwrap();
            encoder.write_bool(true).unwrap();
            encoder.write_string("challenge").unwrap();
        }

        let mut decoder = PacketDecoder::new(&packet);
        assert_eq!(decoder.read_u8().unwrap(), 0xAB);
        assert_eq!(decoder.read_i16().unwrap(), -1234);
        assert_eq!(decoder.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(decoder.read_i64().unwrap(), -1);
        assert_eq!(decoder.read_f32().unwrap(), 23.07);
        assert_eq!(decoder.read_bool().unwrap(), true);
        assert_eq!(decoder.read_string().unwrap(), "challenge");
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_decoder_underrun_fails() {
        let mut packet = NetworkPacket::new();
        PacketEncoder::new(&mut packet).write_u16(7).unwrap();

        let mut decoder = PacketDecoder::new(&packet);
        assert!(decoder.read_u64().is_err());
    }

    #[test]
    fn test_encoder_overflow_fails() {
        let mut packet = NetworkPacket::new();
        let mut encoder = PacketEncoder::new(&mut packet);
        encoder.write_bytes(&vec![0; MAX_PAYLOAD]).unwrap();
        assert!(encoder.write_u8(0).is_err());
    }
}
