// Copyright (C) 2013-2020 Blockstack PBC, a public benefit corporation
// Copyright (C) 2020 Stacks Open Internet Foundation
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::fmt::Write;

use sha2::{Digest, Sha512_256};

use crate::util::HexError;

/// SHA-512/256 digest, used for cache validators.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha512Trunc256Sum(pub [u8; 32]);
impl_array_hexstring_fmt!(Sha512Trunc256Sum);
impl_byte_array_newtype!(Sha512Trunc256Sum, u8, 32);
impl_byte_array_serde!(Sha512Trunc256Sum);

impl Sha512Trunc256Sum {
    #[cfg(test)]
    pub fn from_data(data: &[u8]) -> Sha512Trunc256Sum {
        Sha512Trunc256Sum::from_hasher(Sha512_256::new_with_prefix(data))
    }

    pub fn from_hasher(hasher: Sha512_256) -> Sha512Trunc256Sum {
        let mut ret = [0u8; 32];
        ret.copy_from_slice(hasher.finalize().as_slice());
        Sha512Trunc256Sum(ret)
    }
}

/// Convert a hexadecimal string to its bytes.  A leading `0x` is ignored.
pub fn hex_bytes(s: &str) -> Result<Vec<u8>, HexError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() % 2 != 0 {
        return Err(HexError::BadLength(s.len()));
    }
    let chars: Vec<char> = digits.chars().collect();
    let mut v = Vec::with_capacity(chars.len() / 2);
    for pair in chars.chunks(2) {
        let (f, s) = (pair[0], pair[1]);
        match (f.to_digit(16), s.to_digit(16)) {
            (None, _) => return Err(HexError::BadCharacter(f)),
            (_, None) => return Err(HexError::BadCharacter(s)),
            (Some(f), Some(s)) => v.push((f * 0x10 + s) as u8),
        }
    }
    Ok(v)
}

/// Convert a slice of u8 to a hex string
pub fn to_hex(s: &[u8]) -> String {
    let mut r = String::with_capacity(s.len() * 2);
    for b in s.iter() {
        // writing to a String never fails
        let _ = write!(r, "{:02x}", b);
    }
    r
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = hex_bytes("0xdeadBEEF").unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(to_hex(&bytes), "deadbeef");
        assert_eq!(hex_bytes("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_hex_errors() {
        assert_eq!(hex_bytes("abc"), Err(HexError::BadLength(3)));
        assert_eq!(hex_bytes("zz"), Err(HexError::BadCharacter('z')));
        assert_eq!(hex_bytes("0xa"), Err(HexError::BadLength(3)));
    }

    #[test]
    fn test_sha512_256() {
        // FIPS 180-4 test vector for "abc"
        let h = Sha512Trunc256Sum::from_data(b"abc");
        assert_eq!(
            h.to_hex(),
            "53048e2681941ef99b2e29b76b4c7dabe4c2d0c634fc6d46e0e2f13107e7af23"
        );
    }
}
