// SPDX-License-Identifier: AGPL-3.0-or-later
// JaalDB - Distributed Caching Object Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Keys for the two cached namespaces.
//!
//! Objects are keyed by 64-bit ids allocated in batches from the server.
//! Bindings are keyed by UTF-8 names ordered by unsigned lexicographic byte
//! order, with two synthetic sentinels: [`BindingKey::First`] sorts strictly
//! below every name and [`BindingKey::Last`] strictly above. The sentinels
//! let the cache hold an entry for "the end of the namespace" and let range
//! queries start from "before everything" without reserving real names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a stored object.
pub type ObjectId = u64;

/// A key in the ordered binding namespace.
///
/// The derived ordering is the required one: variant order puts `First`
/// below every `Name` and `Last` above, and `String` comparison is already
/// unsigned lexicographic byte order of the UTF-8 form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BindingKey {
    /// Sorts strictly below any name. Never bound.
    First,
    /// A real binding name.
    Name(String),
    /// Sorts strictly above any name. Never bound.
    Last,
}

impl BindingKey {
    /// Key for a real name.
    pub fn for_name(name: impl Into<String>) -> Self {
        BindingKey::Name(name.into())
    }

    /// Key for a search start point: `None` means "before every name".
    pub fn allow_first(name: Option<&str>) -> Self {
        match name {
            Some(n) => BindingKey::Name(n.to_string()),
            None => BindingKey::First,
        }
    }

    /// Key for a server-supplied next name: `None` means "no higher name".
    pub fn allow_last(name: Option<String>) -> Self {
        match name {
            Some(n) => BindingKey::Name(n),
            None => BindingKey::Last,
        }
    }

    /// The name, if this key is a real name.
    pub fn name(&self) -> Option<&str> {
        match self {
            BindingKey::Name(n) => Some(n),
            _ => None,
        }
    }

    /// The name for results where `Last` stands for "no higher bound name".
    pub fn name_allow_last(&self) -> Option<String> {
        match self {
            BindingKey::Name(n) => Some(n.clone()),
            BindingKey::Last => None,
            BindingKey::First => None,
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self, BindingKey::First)
    }

    pub fn is_last(&self) -> bool {
        matches!(self, BindingKey::Last)
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::First => write!(f, "<first>"),
            BindingKey::Name(n) => write!(f, "{:?}", n),
            BindingKey::Last => write!(f, "<last>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_ordering() {
        let first = BindingKey::First;
        let empty = BindingKey::for_name("");
        let a = BindingKey::for_name("a");
        let last = BindingKey::Last;

        assert!(first < empty);
        assert!(empty < a);
        assert!(a < last);
        assert!(first < last);
    }

    #[test]
    fn test_unsigned_byte_ordering() {
        // 'Z' (0x5a) sorts below 'a' (0x61); multi-byte UTF-8 sorts above
        // ASCII because its lead byte is >= 0xc2.
        assert!(BindingKey::for_name("Z") < BindingKey::for_name("a"));
        assert!(BindingKey::for_name("a") < BindingKey::for_name("ab"));
        assert!(BindingKey::for_name("z") < BindingKey::for_name("\u{00e9}"));
    }

    #[test]
    fn test_allow_helpers() {
        assert_eq!(BindingKey::allow_first(None), BindingKey::First);
        assert_eq!(
            BindingKey::allow_first(Some("x")),
            BindingKey::for_name("x")
        );
        assert_eq!(BindingKey::allow_last(None), BindingKey::Last);
        assert_eq!(
            BindingKey::allow_last(Some("x".into())),
            BindingKey::for_name("x")
        );
    }

    #[test]
    fn test_name_accessors() {
        assert_eq!(BindingKey::for_name("n").name(), Some("n"));
        assert_eq!(BindingKey::Last.name(), None);
        assert_eq!(BindingKey::Last.name_allow_last(), None);
        assert_eq!(
            BindingKey::for_name("n").name_allow_last(),
            Some("n".to_string())
        );
    }
}
