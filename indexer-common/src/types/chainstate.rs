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

/// Identifies a Stacks block within one fork: the hash of the block header hash
/// together with the consensus hash of the burnchain sortition that selected it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StacksBlockId(pub [u8; 32]);
impl_array_hexstring_fmt!(StacksBlockId);
impl_byte_array_newtype!(StacksBlockId, u8, 32);
impl_byte_array_serde!(StacksBlockId);

/// Hash of a block (or microblock) header.  The same block may be mined
/// into more than one fork, so this alone does not identify a chain position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHeaderHash(pub [u8; 32]);
impl_array_hexstring_fmt!(BlockHeaderHash);
impl_byte_array_newtype!(BlockHeaderHash, u8, 32);
impl_byte_array_serde!(BlockHeaderHash);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BurnchainHeaderHash(pub [u8; 32]);
impl_array_hexstring_fmt!(BurnchainHeaderHash);
impl_byte_array_newtype!(BurnchainHeaderHash, u8, 32);
impl_byte_array_serde!(BurnchainHeaderHash);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid(pub [u8; 32]);
impl_array_hexstring_fmt!(Txid);
impl_byte_array_newtype!(Txid, u8, 32);
impl_byte_array_serde!(Txid);

#[cfg(feature = "rusqlite")]
impl_byte_array_rusqlite_only!(StacksBlockId);
#[cfg(feature = "rusqlite")]
impl_byte_array_rusqlite_only!(BlockHeaderHash);
#[cfg(feature = "rusqlite")]
impl_byte_array_rusqlite_only!(BurnchainHeaderHash);
#[cfg(feature = "rusqlite")]
impl_byte_array_rusqlite_only!(Txid);

impl StacksBlockId {
    pub fn sentinel() -> StacksBlockId {
        StacksBlockId([0u8; 32])
    }
}

impl BlockHeaderHash {
    pub fn sentinel() -> BlockHeaderHash {
        BlockHeaderHash([0u8; 32])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hash_json() {
        let id = StacksBlockId([0x11; 32]);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(
            s,
            "\"0x1111111111111111111111111111111111111111111111111111111111111111\""
        );
        let back: StacksBlockId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);

        // unprefixed form is accepted too
        let txid: Txid = serde_json::from_str(
            "\"2222222222222222222222222222222222222222222222222222222222222222\"",
        )
        .unwrap();
        assert_eq!(txid, Txid([0x22; 32]));

        assert!(serde_json::from_str::<Txid>("\"0x22\"").is_err());
    }

    #[test]
    fn test_sentinels_are_zero() {
        assert!(StacksBlockId::sentinel().is_zero());
        assert!(BlockHeaderHash::sentinel().is_zero());
        assert!(!Txid([0x01; 32]).is_zero());
    }
}
