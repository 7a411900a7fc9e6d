//! Примитивы gob: unsigned/signed integers, length-prefixed bytes.
//!
//! uint < 128 занимает один байт. Иначе: байт `-(n)` (число следующих
//! байт) и n байт big-endian без ведущих нулей. int кодируется как
//! uint со знаком в младшем бите.

use relay_api::RelayError;

// ═══════════════════════════════════════════════════════════════
//  Writer
// ═══════════════════════════════════════════════════════════════

pub fn put_uint(buf: &mut Vec<u8>, v: u64) {
    if v < 0x80 {
        buf.push(v as u8);
        return;
    }
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let n = bytes.len() - skip;
    buf.push((n as u8).wrapping_neg());
    buf.extend_from_slice(&bytes[skip..]);
}

pub fn put_int(buf: &mut Vec<u8>, v: i64) {
    let u = if v < 0 { ((!v) as u64) << 1 | 1 } else { (v as u64) << 1 };
    put_uint(buf, u);
}

pub fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

// ═══════════════════════════════════════════════════════════════
//  Reader
// ═══════════════════════════════════════════════════════════════

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Остаток состоит только из нулей (padding приёмного буфера).
    pub fn only_padding_left(&self) -> bool {
        self.buf[self.pos..].iter().all(|b| *b == 0)
    }

    fn byte(&mut self) -> Result<u8, RelayError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| RelayError::decode("gob: unexpected end of data"))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], RelayError> {
        if n > self.remaining() {
            return Err(RelayError::decode(format!(
                "gob: need {n} bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn uint(&mut self) -> Result<u64, RelayError> {
        let b = self.byte()?;
        if b < 0x80 {
            return Ok(b as u64);
        }
        let n = b.wrapping_neg() as usize;
        if n > 8 {
            return Err(RelayError::decode(format!("gob: invalid uint length {n}")));
        }
        let bytes = self.take(n)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    pub fn int(&mut self) -> Result<i64, RelayError> {
        let u = self.uint()?;
        if u & 1 == 1 {
            Ok(!((u >> 1) as i64))
        } else {
            Ok((u >> 1) as i64)
        }
    }

    /// Длина (uint), проверенная против остатка буфера.
    pub fn length(&mut self) -> Result<usize, RelayError> {
        let n = self.uint()?;
        if n > self.remaining() as u64 {
            return Err(RelayError::decode(format!(
                "gob: length {n} exceeds {} remaining bytes",
                self.remaining()
            )));
        }
        Ok(n as usize)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], RelayError> {
        let n = self.length()?;
        self.take(n)
    }

    pub fn string(&mut self) -> Result<&'a str, RelayError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw).map_err(|e| RelayError::decode(format!("gob: string is not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_small_and_large() {
        let mut buf = Vec::new();
        put_uint(&mut buf, 7);
        put_uint(&mut buf, 256);
        assert_eq!(buf, [0x07, 0xfe, 0x01, 0x00]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.uint().unwrap(), 7);
        assert_eq!(r.uint().unwrap(), 256);
        assert!(r.is_empty());
    }

    #[test]
    fn int_uses_sign_bit() {
        // Go: -65 → ff 81, 65 → ff 82, 100 → ff c8, 2 → 04
        let cases: [(i64, &[u8]); 4] = [
            (-65, &[0xff, 0x81]),
            (65, &[0xff, 0x82]),
            (100, &[0xff, 0xc8]),
            (2, &[0x04]),
        ];
        for (v, expected) in cases {
            let mut buf = Vec::new();
            put_int(&mut buf, v);
            assert_eq!(buf, expected, "encoding {v}");
            assert_eq!(Reader::new(&buf).int().unwrap(), v);
        }
    }

    #[test]
    fn int_extremes() {
        for v in [i64::MIN, i64::MAX, -1, 0] {
            let mut buf = Vec::new();
            put_int(&mut buf, v);
            assert_eq!(Reader::new(&buf).int().unwrap(), v);
        }
    }

    #[test]
    fn length_past_end_is_rejected() {
        let mut r = Reader::new(&[0x05, b'a', b'b']);
        assert!(matches!(r.bytes(), Err(RelayError::Decode(_))));
    }

    #[test]
    fn uint_with_bad_length_byte() {
        // 0x80 → length 128
        let mut r = Reader::new(&[0x80, 0, 0]);
        assert!(r.uint().is_err());
    }
}
