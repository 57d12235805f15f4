// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Versioned symbol token handling.

ELF symbol version requirements are recorded as tokens like `GLIBC_2.17`
or `CXXABI_1.3.7`: a *group* naming the version namespace and a dotted
integer version. Policies constrain the maximum version allowed per
group, so the version component needs a total order.
*/

use std::{cmp::Ordering, fmt, str::FromStr};

/// A dotted integer version such as `2.17` or `3.4.19`.
///
/// Ordering is lexicographic on the integer components, so
/// `2.9 < 2.17 < 2.17.1`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DottedVersion(Vec<u32>);

impl DottedVersion {
    /// Parse a version string consisting of dot-separated decimal integers.
    ///
    /// Returns `None` for anything else, including empty components.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }

        let mut components = Vec::new();
        for part in s.split('.') {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            components.push(u32::from_str(part).ok()?);
        }

        Some(Self(components))
    }

    /// The integer components of this version.
    pub fn components(&self) -> &[u32] {
        &self.0
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&parts)
    }
}

/// A symbol version token split into its group and version.
///
/// Tokens that do not match `GROUP_X(.Y…)` keep their raw spelling but
/// carry no parsed version. Such tokens never satisfy a numeric
/// constraint.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SymbolVersion {
    group: String,
    version: Option<DottedVersion>,
    raw: String,
}

impl SymbolVersion {
    /// Split a token such as `GLIBC_2.17` at its first underscore.
    pub fn parse(token: &str) -> Self {
        match token.split_once('_') {
            Some((group, version)) => Self {
                group: group.to_string(),
                version: DottedVersion::parse(version),
                raw: token.to_string(),
            },
            None => Self {
                group: token.to_string(),
                version: None,
                raw: token.to_string(),
            },
        }
    }

    /// The version namespace, e.g. `GLIBC` or `CXXABI`.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The parsed version, when the token had a dotted integer one.
    pub fn version(&self) -> Option<&DottedVersion> {
        self.version.as_ref()
    }

    /// The token as it appeared in the binary.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether this requirement is satisfied by a policy allowing
    /// versions of the group up to `max`.
    ///
    /// Unparsable versions are never compatible with a numeric maximum.
    pub fn satisfied_by(&self, max: &DottedVersion) -> bool {
        match &self.version {
            Some(version) => version <= max,
            None => false,
        }
    }
}

impl fmt::Display for SymbolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_version_ordering() {
        let v2_9 = DottedVersion::parse("2.9").unwrap();
        let v2_17 = DottedVersion::parse("2.17").unwrap();
        let v2_17_1 = DottedVersion::parse("2.17.1").unwrap();

        assert!(v2_9 < v2_17);
        assert!(v2_17 < v2_17_1);
        assert_eq!(v2_17, DottedVersion::parse("2.17").unwrap());
        assert_eq!(v2_17_1.to_string(), "2.17.1");
    }

    #[test]
    fn dotted_version_rejects_garbage() {
        assert!(DottedVersion::parse("").is_none());
        assert!(DottedVersion::parse("2.").is_none());
        assert!(DottedVersion::parse(".2").is_none());
        assert!(DottedVersion::parse("2.x").is_none());
        assert!(DottedVersion::parse("PRIVATE").is_none());
    }

    #[test]
    fn token_parse() {
        let sv = SymbolVersion::parse("GLIBC_2.17");
        assert_eq!(sv.group(), "GLIBC");
        assert_eq!(sv.version().unwrap().components(), &[2, 17]);

        let sv = SymbolVersion::parse("GLIBCXX_3.4.19");
        assert_eq!(sv.group(), "GLIBCXX");
        assert_eq!(sv.version().unwrap().components(), &[3, 4, 19]);

        // No underscore: group only, no version.
        let sv = SymbolVersion::parse("NCURSES6");
        assert_eq!(sv.group(), "NCURSES6");
        assert!(sv.version().is_none());

        // Non-numeric tail is retained but unparsed.
        let sv = SymbolVersion::parse("GLIBC_PRIVATE");
        assert_eq!(sv.group(), "GLIBC");
        assert!(sv.version().is_none());
        assert_eq!(sv.raw(), "GLIBC_PRIVATE");
    }

    #[test]
    fn satisfaction() {
        let max = DottedVersion::parse("2.17").unwrap();

        assert!(SymbolVersion::parse("GLIBC_2.5").satisfied_by(&max));
        assert!(SymbolVersion::parse("GLIBC_2.17").satisfied_by(&max));
        assert!(!SymbolVersion::parse("GLIBC_2.30").satisfied_by(&max));
        // Unparsable tokens never satisfy numeric constraints.
        assert!(!SymbolVersion::parse("GLIBC_PRIVATE").satisfied_by(&max));
    }
}
