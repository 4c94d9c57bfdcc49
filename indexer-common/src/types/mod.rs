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

pub mod chainstate;

use std::fmt;
use std::str::FromStr;

/// A standard Stacks principal in its c32check string form (e.g. `SP2J6...`).
/// Only the shape is checked; the checksum is the node's business.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StacksAddress(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError(pub String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid Stacks address '{}'", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl StacksAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Is this a mainnet address?
    pub fn is_mainnet(&self) -> bool {
        self.0.starts_with("SP") || self.0.starts_with("SM")
    }
}

impl FromStr for StacksAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<StacksAddress, AddressParseError> {
        let well_formed = s.len() >= 5
            && s.len() <= 41
            && s.starts_with('S')
            && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !well_formed {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(StacksAddress(s.to_string()))
    }
}

impl TryFrom<String> for StacksAddress {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<StacksAddress, AddressParseError> {
        StacksAddress::from_str(&s)
    }
}

impl From<StacksAddress> for String {
    fn from(addr: StacksAddress) -> String {
        addr.0
    }
}

impl fmt::Display for StacksAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for StacksAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(feature = "rusqlite")]
impl rusqlite::types::ToSql for StacksAddress {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput> {
        Ok(self.0.as_str().into())
    }
}

#[cfg(feature = "rusqlite")]
impl rusqlite::types::FromSql for StacksAddress {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        StacksAddress::from_str(s).map_err(|_| rusqlite::types::FromSqlError::InvalidType)
    }
}
