// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Whole-archive ABI analysis.

Runs the inspector and resolver over every ELF file in an unpacked
wheel, builds the dependency graph, and scores it against a policy
table. The resulting report is the single record both the `show`
renderer and the repair planner consume.
*/

use {
    crate::{
        arch::Architecture,
        elf::{ElfFile, Libc},
        error::{AuditError, Result},
        graph::{DependencyGraph, RootBinary},
        policy::{is_always_excluded, Policy, PolicySet, SymbolViolation},
        resolver::Resolver,
        version::SymbolVersion,
        wheel::UnpackedWheel,
    },
    glob::Pattern,
    log::{debug, warn},
    std::{
        collections::{BTreeMap, BTreeSet, VecDeque},
        path::PathBuf,
    },
};

/// Per-policy external reference summary.
#[derive(Clone, Debug)]
pub struct ExternalRefs {
    /// Graft candidates under this policy: soname to resolved path
    /// (`None` when unresolved).
    pub libs: BTreeMap<String, Option<PathBuf>>,

    /// Blacklisted symbols the roots reference, per library.
    pub blacklist: BTreeMap<String, BTreeSet<String>>,

    /// Versioned symbols that would travel with the wheel under this
    /// policy: the roots' own demands plus those of every graft
    /// candidate.
    pub symbols: BTreeMap<String, BTreeSet<String>>,
}

/// The analysis record for one wheel.
#[derive(Clone, Debug)]
pub struct WheelAbiReport {
    pub architecture: Architecture,
    pub libc: Option<Libc>,
    pub graph: DependencyGraph,

    /// Versioned symbols the roots request, per library.
    pub versioned_symbols: BTreeMap<String, BTreeSet<String>>,

    /// Per-policy external references, keyed by policy name.
    pub external_refs: BTreeMap<String, ExternalRefs>,

    /// Strictest policy whose symbol-version and blacklist constraints
    /// hold.
    pub sym_policy: Policy,

    /// Strictest policy with no graft candidates.
    pub ref_policy: Policy,

    /// Strictest policy whose blacklist is clean.
    pub blacklist_policy: Policy,

    /// The policy the wheel already satisfies outright.
    pub overall_policy: Policy,
}

impl WheelAbiReport {
    /// Verify the archive can be taken to `target` by grafting alone.
    ///
    /// Symbol-version excesses and blacklisted symbol references cannot
    /// be repaired; they are fatal for the requested policy.
    pub fn validate_target(&self, target: &Policy) -> Result<()> {
        let refs = self
            .external_refs
            .get(&target.name)
            .ok_or_else(|| AuditError::UnknownPolicy(target.name.clone()))?;

        if let Some(violation) = target.symbol_violations(&refs.symbols).into_iter().next() {
            return Err(violation_error(&target.name, &violation));
        }

        if let Some((library, symbols)) = refs.blacklist.iter().next() {
            let symbol = symbols.iter().next().cloned().unwrap_or_default();
            return Err(AuditError::BlacklistedSymbol {
                library: library.clone(),
                symbol,
            });
        }

        Ok(())
    }
}

fn violation_error(policy: &str, violation: &SymbolViolation) -> AuditError {
    let sv = SymbolVersion::parse(&violation.token);
    let actual = sv
        .version()
        .map(|v| v.to_string())
        .unwrap_or_else(|| violation.token.clone());

    AuditError::PolicyViolation {
        policy: policy.to_string(),
        group: violation.group.clone(),
        actual,
        max: violation.max.to_string(),
    }
}

/// Analyze an unpacked wheel against a policy table.
///
/// With `lenient` set, binaries that fail to parse are skipped with a
/// warning (the `show` behavior); otherwise they abort the analysis
/// (the `repair` behavior).
pub fn analyze_wheel(
    wheel: &UnpackedWheel,
    policies: &PolicySet,
    resolver: &Resolver,
    exclude: &[Pattern],
    lenient: bool,
) -> Result<WheelAbiReport> {
    let mut roots = Vec::new();

    for rel in wheel.elf_files()? {
        let full = wheel.root().join(&rel);
        match ElfFile::open(&full) {
            Ok(elf) => {
                debug!("processing: {}", rel.display());
                roots.push(RootBinary {
                    archive_path: rel,
                    elf,
                });
            }
            Err(e) if lenient => {
                warn!("skipping {}: {}", rel.display(), e);
            }
            Err(e) => return Err(e),
        }
    }

    if roots.is_empty() {
        return Err(AuditError::NonPlatformWheel);
    }

    let graph = DependencyGraph::build(roots, resolver, exclude, wheel.root())?;

    let libc = graph.roots.iter().find_map(|r| r.elf.libc);
    let versioned_symbols = graph.root_symbol_versions();

    let mut external_refs = BTreeMap::new();
    for policy in policies.policies() {
        external_refs.insert(
            policy.name.clone(),
            external_refs_for_policy(&graph, policy, &versioned_symbols),
        );
    }

    let ref_policy = facet_policy(policies, |p| external_refs[&p.name].libs.is_empty());
    let blacklist_policy = facet_policy(policies, |p| external_refs[&p.name].blacklist.is_empty());
    let sym_policy = facet_policy(policies, |p| {
        p.symbol_violations(&external_refs[&p.name].symbols).is_empty()
    });

    let overall_policy = [&sym_policy, &ref_policy, &blacklist_policy]
        .into_iter()
        .min_by_key(|p| p.priority)
        .expect("three candidates")
        .clone();

    Ok(WheelAbiReport {
        architecture: graph.architecture,
        libc,
        versioned_symbols,
        external_refs,
        sym_policy,
        ref_policy,
        blacklist_policy,
        overall_policy,
        graph,
    })
}

/// The strictest policy satisfying `ok`; the priority-zero default
/// always does.
fn facet_policy(policies: &PolicySet, ok: impl Fn(&Policy) -> bool) -> Policy {
    for policy in policies.by_descending_priority() {
        if policy.is_default_linux() || ok(policy) {
            return policy.clone();
        }
    }

    policies.lowest().clone()
}

fn external_refs_for_policy(
    graph: &DependencyGraph,
    policy: &Policy,
    root_symbols: &BTreeMap<String, BTreeSet<String>>,
) -> ExternalRefs {
    if policy.is_default_linux() {
        // The default policy whitelists everything; nothing is external
        // and no blacklist applies.
        return ExternalRefs {
            libs: BTreeMap::new(),
            blacklist: BTreeMap::new(),
            symbols: root_symbols.clone(),
        };
    }

    let mut libs: BTreeMap<String, Option<PathBuf>> = BTreeMap::new();
    let mut frontier: VecDeque<String> = graph
        .root_needed()
        .into_iter()
        .filter(|soname| keeps_as_external(graph, policy, soname))
        .collect();

    while let Some(soname) = frontier.pop_front() {
        if libs.contains_key(&soname) {
            continue;
        }

        let node = match graph.external.get(&soname) {
            Some(node) => node,
            None => continue,
        };
        libs.insert(soname.clone(), node.path.clone());

        if let Some(elf) = &node.elf {
            for dep in &elf.needed {
                if keeps_as_external(graph, policy, dep) && !libs.contains_key(dep) {
                    frontier.push_back(dep.clone());
                }
            }
        }
    }

    let mut blacklist: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for root in &graph.roots {
        let needed: BTreeSet<String> = root.elf.needed.iter().cloned().collect();
        for (library, symbols) in policy.blacklist_hits(&needed, &root.elf.undefined_symbols) {
            blacklist.entry(library).or_default().extend(symbols);
        }
    }

    // Grafted libraries travel with the wheel, so their own symbol
    // demands count against the policy too.
    let mut symbols = root_symbols.clone();
    for soname in libs.keys() {
        if let Some(node) = graph.external.get(soname) {
            if let Some(elf) = &node.elf {
                for (library, tokens) in &elf.versioned_symbols {
                    symbols
                        .entry(library.clone())
                        .or_default()
                        .extend(tokens.iter().cloned());
                }
            }
        }
    }

    ExternalRefs {
        libs,
        blacklist,
        symbols,
    }
}

/// Whether `soname` stays an external (graftable) reference under a
/// policy: present in the graph, not whitelisted, not the loader or
/// libpython, and not already shipped inside the archive.
fn keeps_as_external(graph: &DependencyGraph, policy: &Policy, soname: &str) -> bool {
    if is_always_excluded(soname) || policy.lib_whitelist.contains(soname) {
        return false;
    }

    match graph.external.get(soname) {
        Some(node) => !node.internal,
        None => false,
    }
}
