// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Platform policy tables and scoring.

A policy names a portable ABI subset: the shared libraries a conforming
platform provides (`lib_whitelist`), the maximum symbol version allowed
per version group, and symbols a library must not be asked for
(`blacklist`). Policies are ordered by priority; higher priority means
a stricter, more broadly installable ABI. The priority-zero `linux`
policy admits everything.

The embedded tables mirror the manylinux / musllinux policy documents.
Custom tables can be loaded from a JSON file of the same shape.
*/

use {
    crate::{
        arch::Architecture,
        elf::Libc,
        error::{AuditError, Result},
        version::{DottedVersion, SymbolVersion},
    },
    once_cell::sync::Lazy,
    regex::Regex,
    serde::Deserialize,
    std::collections::{BTreeMap, BTreeSet},
};

/// Policy table for glibc-flavored platforms.
pub const MANYLINUX_POLICY_JSON: &str = include_str!("manylinux-policy.json");

/// Policy table for musl-flavored platforms.
pub const MUSLLINUX_POLICY_JSON: &str = include_str!("musllinux-policy.json");

static LIBPYTHON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^libpython\d+\.\d+m?\.so(\.\d)*$").unwrap());

/// One element of the JSON policy document, before architecture
/// expansion.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyElement {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub priority: i32,
    /// Architecture token to version group to maximum allowed version.
    pub symbol_versions: BTreeMap<String, BTreeMap<String, String>>,
    pub lib_whitelist: BTreeSet<String>,
    #[serde(default)]
    pub blacklist: BTreeMap<String, BTreeSet<String>>,
}

/// A policy specialized to one architecture.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Architecture-suffixed name, e.g. `manylinux_2_17_x86_64`.
    pub name: String,
    /// Architecture-suffixed legacy aliases, e.g. `manylinux2014_x86_64`.
    pub aliases: Vec<String>,
    pub priority: i32,
    /// Maximum allowed version per symbol version group.
    pub symbol_versions: BTreeMap<String, DottedVersion>,
    pub lib_whitelist: BTreeSet<String>,
    pub blacklist: BTreeMap<String, BTreeSet<String>>,
}

/// A symbol version demand exceeding a policy's maximum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolViolation {
    pub group: String,
    /// The offending token as spelled in the binary.
    pub token: String,
    pub max: DottedVersion,
}

impl Policy {
    /// The permissive priority-zero policy.
    pub fn is_default_linux(&self) -> bool {
        self.priority == 0
    }

    /// All platform tags this policy grants: its name plus aliases.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags = vec![self.name.clone()];
        tags.extend(self.aliases.iter().cloned());
        tags
    }

    /// Platform tags this policy replaces when applied, i.e. the
    /// generic `linux_{arch}` spelling of the same architecture.
    pub fn replace_platforms(&self) -> Vec<String> {
        if self.name.starts_with("linux") {
            return Vec::new();
        }

        let parts: Vec<&str> = self.name.split('_').collect();
        let arch_parts = if self.name.starts_with("manylinux_") || self.name.starts_with("musllinux_")
        {
            // manylinux_2_17_x86_64 -> x86_64 (which may itself contain '_')
            &parts[3..]
        } else {
            // manylinux1_x86_64 -> x86_64
            &parts[1..]
        };

        vec![format!("linux_{}", arch_parts.join("_"))]
    }

    /// Check versioned symbol demands against this policy's maxima.
    ///
    /// `symbols` maps library soname to requested version tokens. Only
    /// whitelisted libraries constrain the policy; a token whose group
    /// the policy does not describe is ignored.
    pub fn symbol_violations(
        &self,
        symbols: &BTreeMap<String, BTreeSet<String>>,
    ) -> Vec<SymbolViolation> {
        let mut violations = Vec::new();

        for (library, tokens) in symbols {
            if !self.lib_whitelist.contains(library) {
                continue;
            }
            for token in tokens {
                let sv = SymbolVersion::parse(token);
                if let Some(max) = self.symbol_versions.get(sv.group()) {
                    if !sv.satisfied_by(max) {
                        violations.push(SymbolViolation {
                            group: sv.group().to_string(),
                            token: token.clone(),
                            max: max.clone(),
                        });
                    }
                }
            }
        }

        violations
    }

    /// Blacklisted symbols a binary actually references.
    ///
    /// `needed` is the binary's `DT_NEEDED` set and `undefined` its
    /// undefined dynamic symbol names; only libraries the binary links
    /// against can expose it to their blacklists.
    pub fn blacklist_hits(
        &self,
        needed: &BTreeSet<String>,
        undefined: &BTreeSet<String>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut hits = BTreeMap::new();

        for (library, symbols) in &self.blacklist {
            if !needed.contains(library) {
                continue;
            }
            let used: BTreeSet<String> = symbols.intersection(undefined).cloned().collect();
            if !used.is_empty() {
                hits.insert(library.clone(), used);
            }
        }

        hits
    }
}

/// The ordered policy table for one architecture and libc flavor.
#[derive(Clone, Debug)]
pub struct PolicySet {
    policies: Vec<Policy>,
    architecture: Architecture,
}

impl PolicySet {
    /// Load the embedded policy table for a libc flavor.
    ///
    /// For musl, `musl_policy` restricts the table to the named
    /// `musllinux_X_Y` policy plus the default, mirroring how a musl
    /// host only certifies its own ABI level.
    pub fn load_default(
        libc: Libc,
        architecture: Architecture,
        musl_policy: Option<&str>,
    ) -> Result<Self> {
        let json = match libc {
            Libc::Glibc => MANYLINUX_POLICY_JSON,
            Libc::Musl => MUSLLINUX_POLICY_JSON,
        };
        Self::from_json(json, libc, architecture, musl_policy)
    }

    /// Parse and validate a policy table document.
    pub fn from_json(
        text: &str,
        libc: Libc,
        architecture: Architecture,
        musl_policy: Option<&str>,
    ) -> Result<Self> {
        let elements: Vec<PolicyElement> = serde_json::from_str(text)?;
        validate_monotonicity(&elements)?;

        if let Some(musl_policy) = musl_policy {
            let known = elements.iter().any(|e| e.name == musl_policy);
            if !known {
                return Err(AuditError::UnknownPolicy(musl_policy.to_string()));
            }
        }

        let arch_token = architecture.token();
        let mut policies = Vec::new();

        for element in elements {
            if let Some(musl_policy) = musl_policy {
                if element.name != "linux" && element.name != musl_policy {
                    continue;
                }
            }

            let is_linux = element.name == "linux";
            if !is_linux && !element.symbol_versions.contains_key(arch_token) {
                continue;
            }

            let symbol_versions = if is_linux {
                BTreeMap::new()
            } else {
                let mut parsed = BTreeMap::new();
                for (group, max) in &element.symbol_versions[arch_token] {
                    let version = DottedVersion::parse(max).ok_or_else(|| {
                        AuditError::InvalidPolicy(format!(
                            "policy {} has unparsable version {} for group {}",
                            element.name, max, group
                        ))
                    })?;
                    parsed.insert(group.clone(), version);
                }
                parsed
            };

            policies.push(Policy {
                name: format!("{}_{}", element.name, arch_token),
                aliases: element
                    .aliases
                    .iter()
                    .map(|a| format!("{}_{}", a, arch_token))
                    .collect(),
                priority: element.priority,
                symbol_versions,
                lib_whitelist: fixup_musl_soname(libc, architecture, &element.lib_whitelist),
                blacklist: element.blacklist,
            });
        }

        if !policies.iter().any(|p| p.priority == 0) {
            return Err(AuditError::InvalidPolicy(
                "table lacks a priority-zero default policy".to_string(),
            ));
        }

        policies.sort_by_key(|p| p.priority);

        Ok(Self {
            policies,
            architecture,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Policies in ascending priority order.
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Policies in descending priority order (strictest first).
    pub fn by_descending_priority(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter().rev()
    }

    /// The strictest policy in the table.
    pub fn highest(&self) -> &Policy {
        self.policies.last().expect("table is never empty")
    }

    /// The permissive default policy.
    pub fn lowest(&self) -> &Policy {
        self.policies.first().expect("table is never empty")
    }

    /// Look up a policy by name or legacy alias.
    pub fn find(&self, name: &str) -> Result<&Policy> {
        self.policies
            .iter()
            .find(|p| p.name == name || p.aliases.iter().any(|a| a == name))
            .ok_or_else(|| AuditError::UnknownPolicy(name.to_string()))
    }
}

/// The default musllinux policy name for a probed musl version.
pub fn default_musl_policy(version: &DottedVersion) -> Option<String> {
    let components = version.components();
    match (components.first(), components.get(1)) {
        (Some(major), Some(minor)) => Some(format!("musllinux_{}_{}", major, minor)),
        _ => None,
    }
}

/// Libraries never considered external regardless of policy: the
/// dynamic loader itself and the Python runtime the wheel is loaded
/// into.
pub fn is_always_excluded(soname: &str) -> bool {
    soname.contains("ld-linux")
        || soname == "ld64.so.2"
        || soname == "ld64.so.1"
        || LIBPYTHON_RE.is_match(soname)
}

/// musl spells its libc soname per architecture; the whitelisted
/// `libc.so` placeholder is rewritten to the concrete name.
fn fixup_musl_soname(
    libc: Libc,
    architecture: Architecture,
    whitelist: &BTreeSet<String>,
) -> BTreeSet<String> {
    if libc != Libc::Musl {
        return whitelist.clone();
    }

    let musl_arch = match architecture {
        Architecture::I686 => "x86",
        Architecture::Armv7l => "armv7",
        other => other.token(),
    };

    whitelist
        .iter()
        .map(|soname| {
            if soname == "libc.so" {
                format!("libc.musl-{}.so.1", musl_arch)
            } else {
                soname.clone()
            }
        })
        .collect()
}

/// Reject tables where a lower-priority policy retracts something a
/// higher-priority one grants; tags must stay forward compatible.
fn validate_monotonicity(elements: &[PolicyElement]) -> Result<()> {
    let mut by_priority: Vec<&PolicyElement> = elements.iter().collect();
    by_priority.sort_by_key(|e| std::cmp::Reverse(e.priority));

    let mut whitelist: BTreeSet<String> = BTreeSet::new();
    let mut maxima: BTreeMap<String, BTreeMap<String, DottedVersion>> = BTreeMap::new();

    for element in by_priority {
        if element.name == "linux" {
            continue;
        }

        if !whitelist.is_subset(&element.lib_whitelist) {
            let missing: Vec<&String> = whitelist.difference(&element.lib_whitelist).collect();
            return Err(AuditError::InvalidPolicy(format!(
                "policy {} drops whitelisted libraries {:?} granted by stricter policies",
                element.name, missing
            )));
        }
        whitelist.extend(element.lib_whitelist.iter().cloned());

        for (arch, groups) in &element.symbol_versions {
            let arch_maxima = maxima.entry(arch.clone()).or_default();
            for (group, max) in groups {
                let max = DottedVersion::parse(max).ok_or_else(|| {
                    AuditError::InvalidPolicy(format!(
                        "policy {} has unparsable version {} for group {}",
                        element.name, max, group
                    ))
                })?;
                if let Some(existing) = arch_maxima.get(group) {
                    if &max < existing {
                        return Err(AuditError::InvalidPolicy(format!(
                            "policy {} lowers {} {} maximum below a stricter policy's",
                            element.name, arch, group
                        )));
                    }
                }
                arch_maxima.insert(group.clone(), max);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manylinux_x86_64() -> PolicySet {
        PolicySet::load_default(Libc::Glibc, Architecture::X86_64, None).unwrap()
    }

    #[test]
    fn table_shape() {
        let set = manylinux_x86_64();

        assert_eq!(set.lowest().name, "linux_x86_64");
        assert!(set.lowest().is_default_linux());
        assert_eq!(set.highest().name, "manylinux_2_5_x86_64");

        let priorities: Vec<i32> = set.policies().iter().map(|p| p.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn alias_lookup() {
        let set = manylinux_x86_64();

        let by_alias = set.find("manylinux2014_x86_64").unwrap();
        assert_eq!(by_alias.name, "manylinux_2_17_x86_64");

        let by_name = set.find("manylinux_2_17_x86_64").unwrap();
        assert_eq!(by_name.priority, by_alias.priority);

        assert!(matches!(
            set.find("manylinux_9_99_x86_64"),
            Err(AuditError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn arch_filtering() {
        let aarch64 = PolicySet::load_default(Libc::Glibc, Architecture::Aarch64, None).unwrap();
        // manylinux_2_5 never existed for aarch64.
        assert!(aarch64.find("manylinux_2_5_aarch64").is_err());
        assert!(aarch64.find("manylinux_2_17_aarch64").is_ok());
    }

    #[test]
    fn replace_platforms() {
        let set = manylinux_x86_64();
        let p = set.find("manylinux_2_17_x86_64").unwrap();
        assert_eq!(p.replace_platforms(), vec!["linux_x86_64"]);
        assert!(set.lowest().replace_platforms().is_empty());
    }

    #[test]
    fn symbol_violation_detection() {
        let set = manylinux_x86_64();
        let p = set.find("manylinux_2_17_x86_64").unwrap();

        let mut symbols: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        symbols.insert(
            "libc.so.6".to_string(),
            ["GLIBC_2.17", "GLIBC_2.30"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        // Requests of non-whitelisted libraries never constrain.
        symbols.insert(
            "libfoo.so.1".to_string(),
            ["FOO_9.9"].iter().map(|s| s.to_string()).collect(),
        );

        let violations = p.symbol_violations(&symbols);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].group, "GLIBC");
        assert_eq!(violations[0].token, "GLIBC_2.30");
        assert_eq!(violations[0].max, DottedVersion::parse("2.17").unwrap());

        let relaxed = set.find("manylinux_2_34_x86_64").unwrap();
        assert!(relaxed.symbol_violations(&symbols).is_empty());
    }

    #[test]
    fn blacklist_detection() {
        let set = manylinux_x86_64();
        let p = set.find("manylinux_2_17_x86_64").unwrap();

        let needed: BTreeSet<String> = ["libz.so.1".to_string()].into_iter().collect();
        let undefined: BTreeSet<String> =
            ["inflate_fast".to_string(), "deflate".to_string()].into_iter().collect();

        let hits = p.blacklist_hits(&needed, &undefined);
        assert_eq!(hits["libz.so.1"].len(), 1);
        assert!(hits["libz.so.1"].contains("inflate_fast"));

        // Without the library linked, its blacklist does not apply.
        let hits = p.blacklist_hits(&BTreeSet::new(), &undefined);
        assert!(hits.is_empty());
    }

    #[test]
    fn musl_table() {
        let set = PolicySet::load_default(Libc::Musl, Architecture::X86_64, Some("musllinux_1_2"))
            .unwrap();

        assert_eq!(set.policies().len(), 2);
        let musl = set.find("musllinux_1_2_x86_64").unwrap();
        assert!(musl.lib_whitelist.contains("libc.musl-x86_64.so.1"));

        assert!(matches!(
            PolicySet::load_default(Libc::Musl, Architecture::X86_64, Some("musllinux_9_9")),
            Err(AuditError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn default_musl_policy_name() {
        let v = DottedVersion::parse("1.2.4").unwrap();
        assert_eq!(default_musl_policy(&v).unwrap(), "musllinux_1_2");
    }

    #[test]
    fn always_excluded() {
        assert!(is_always_excluded("ld-linux-x86-64.so.2"));
        assert!(is_always_excluded("ld64.so.2"));
        assert!(is_always_excluded("libpython3.10.so.1.0"));
        assert!(!is_always_excluded("libssl.so.1.1"));
    }

    #[test]
    fn monotonicity_rejected() {
        let bad = r#"[
            {"name": "linux", "aliases": [], "priority": 0,
             "symbol_versions": {}, "lib_whitelist": [], "blacklist": {}},
            {"name": "strict", "aliases": [], "priority": 100,
             "symbol_versions": {"x86_64": {"GLIBC": "2.5"}},
             "lib_whitelist": ["libc.so.6", "libm.so.6"], "blacklist": {}},
            {"name": "loose", "aliases": [], "priority": 50,
             "symbol_versions": {"x86_64": {"GLIBC": "2.17"}},
             "lib_whitelist": ["libc.so.6"], "blacklist": {}}
        ]"#;

        assert!(matches!(
            PolicySet::from_json(bad, Libc::Glibc, Architecture::X86_64, None),
            Err(AuditError::InvalidPolicy(_))
        ));

        let bad_versions = r#"[
            {"name": "linux", "aliases": [], "priority": 0,
             "symbol_versions": {}, "lib_whitelist": [], "blacklist": {}},
            {"name": "strict", "aliases": [], "priority": 100,
             "symbol_versions": {"x86_64": {"GLIBC": "2.17"}},
             "lib_whitelist": ["libc.so.6"], "blacklist": {}},
            {"name": "loose", "aliases": [], "priority": 50,
             "symbol_versions": {"x86_64": {"GLIBC": "2.12"}},
             "lib_whitelist": ["libc.so.6"], "blacklist": {}}
        ]"#;

        assert!(matches!(
            PolicySet::from_json(bad_versions, Libc::Glibc, Architecture::X86_64, None),
            Err(AuditError::InvalidPolicy(_))
        ));
    }
}
