// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Transitive dependency graph over an archive's binaries.

Roots are the ELF files found in the archive payload; external nodes
are the libraries their `DT_NEEDED` entries resolve to on the host.
Expansion iterates to a fixed point, marking nodes as they are queued
so cycles among external libraries terminate. Each external node
accumulates the set of importers and the union of versioned symbols
requested of it.
*/

use {
    crate::{
        arch::Architecture,
        elf::ElfFile,
        error::{AuditError, Result},
        resolver::{expand_dst_tokens, normalize_lexically, Resolver},
    },
    glob::Pattern,
    log::{debug, warn},
    std::{
        collections::{BTreeMap, BTreeSet, VecDeque},
        path::{Path, PathBuf},
    },
};

/// A binary from the archive payload.
#[derive(Clone, Debug)]
pub struct RootBinary {
    /// Path of the binary relative to the archive root.
    pub archive_path: PathBuf,
    pub elf: ElfFile,
}

/// A library reached from the roots, resolved on the host filesystem.
#[derive(Clone, Debug)]
pub struct ExternalLibrary {
    /// The name dependents used to refer to this library.
    pub soname: String,

    /// The resolved file's own soname (`DT_SONAME`, else file name).
    pub real_soname: String,

    /// Resolved absolute path; `None` when the search failed.
    pub path: Option<PathBuf>,

    /// Parsed file, when resolved.
    pub elf: Option<ElfFile>,

    /// Whether the resolution landed inside the archive payload. Such
    /// libraries already travel with the archive and are never graft
    /// candidates.
    pub internal: bool,

    /// Identifiers of the binaries importing this library: archive
    /// paths for roots, sonames for libraries.
    pub importers: BTreeSet<String>,

    /// Versioned symbol tokens importers request of this library.
    pub requested_versions: BTreeSet<String>,
}

/// A soname observed resolving to two different paths.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SonameConflict {
    pub soname: String,
    pub first: PathBuf,
    pub second: PathBuf,
}

/// The dependency graph of one archive.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    pub architecture: Architecture,
    pub roots: Vec<RootBinary>,
    pub external: BTreeMap<String, ExternalLibrary>,
    pub conflicts: Vec<SonameConflict>,
    pub excluded: BTreeSet<String>,
}

impl DependencyGraph {
    /// Build the graph for `roots`.
    ///
    /// `exclude` patterns remove matching sonames (or resolved paths)
    /// from consideration entirely. `payload_root` is the directory the
    /// archive was extracted into; resolutions inside it are internal.
    pub fn build(
        roots: Vec<RootBinary>,
        resolver: &Resolver,
        exclude: &[Pattern],
        payload_root: &Path,
    ) -> Result<Self> {
        let architecture = common_architecture(&roots)?;

        let mut graph = Self {
            architecture,
            roots,
            external: BTreeMap::new(),
            conflicts: Vec::new(),
            excluded: BTreeSet::new(),
        };

        // Work items carry the dependent to scan plus the expanded
        // RPATH entries of its transitive parents (legacy chain).
        let mut queue: VecDeque<(ElfFile, String, Vec<PathBuf>)> = VecDeque::new();

        for root in &graph.roots {
            let importer = root.archive_path.display().to_string();
            queue.push_back((root.elf.clone(), importer, Vec::new()));
        }

        while let Some((dependent, importer, parent_rpaths)) = queue.pop_front() {
            let origin = dependent
                .path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let arch = dependent.arch().ok();

            // This dependent's own RPATHs join the chain its children see.
            let mut chain = parent_rpaths.clone();
            for entry in &dependent.rpaths {
                chain.push(normalize_lexically(&expand_dst_tokens(entry, &origin, arch)));
            }

            for soname in &dependent.needed {
                if is_excluded(soname, None, exclude) {
                    debug!("excluding {}", soname);
                    graph.excluded.insert(soname.clone());
                    continue;
                }

                let requested = dependent
                    .versioned_symbols
                    .get(soname)
                    .cloned()
                    .unwrap_or_default();

                if let Some(node) = graph.external.get_mut(soname) {
                    node.importers.insert(importer.clone());
                    node.requested_versions.extend(requested);

                    // The graph is only coherent when a soname means one
                    // file. A different resolution from this context is
                    // a conflict the planner refuses to act on.
                    if let (Some(existing), Some(other)) = (
                        node.path.clone(),
                        resolver.resolve(&dependent, soname, &parent_rpaths),
                    ) {
                        if existing != other {
                            warn!(
                                "{} resolves to both {} and {}",
                                soname,
                                existing.display(),
                                other.display()
                            );
                            graph.conflicts.push(SonameConflict {
                                soname: soname.clone(),
                                first: existing,
                                second: other,
                            });
                        }
                    }
                    continue;
                }

                let path = resolver.resolve(&dependent, soname, &parent_rpaths);

                if let Some(path) = &path {
                    if is_excluded(soname, Some(path), exclude) {
                        debug!("excluding {} ({})", soname, path.display());
                        graph.excluded.insert(soname.clone());
                        continue;
                    }
                }

                let elf = match &path {
                    Some(path) => Some(ElfFile::open(path)?),
                    None => None,
                };

                let internal = path
                    .as_ref()
                    .map(|p| p.starts_with(payload_root))
                    .unwrap_or(false);

                let real_soname = elf
                    .as_ref()
                    .map(|e| e.soname_or_filename())
                    .unwrap_or_else(|| soname.clone());

                let mut node = ExternalLibrary {
                    soname: soname.clone(),
                    real_soname,
                    path: path.clone(),
                    elf: elf.clone(),
                    internal,
                    importers: BTreeSet::new(),
                    requested_versions: requested,
                };
                node.importers.insert(importer.clone());
                graph.external.insert(soname.clone(), node);

                // Recurse into the resolved library so its own needs
                // join the graph. The external map doubles as the
                // visited mark, so cycles terminate here.
                if let Some(elf) = elf {
                    queue.push_back((elf, soname.clone(), chain.clone()));
                }
            }
        }

        Ok(graph)
    }

    /// The union of versioned symbols the roots request, per library.
    pub fn root_symbol_versions(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for root in &self.roots {
            for (library, tokens) in &root.elf.versioned_symbols {
                merged
                    .entry(library.clone())
                    .or_default()
                    .extend(tokens.iter().cloned());
            }
        }
        merged
    }

    /// Sonames the roots directly need, in deterministic order.
    pub fn root_needed(&self) -> BTreeSet<String> {
        self.roots
            .iter()
            .flat_map(|r| r.elf.needed.iter().cloned())
            .collect()
    }
}

fn common_architecture(roots: &[RootBinary]) -> Result<Architecture> {
    let mut arch: Option<Architecture> = None;
    for root in roots {
        let root_arch = root.elf.arch()?;
        match arch {
            None => arch = Some(root_arch),
            Some(existing) if existing != root_arch => {
                return Err(AuditError::HeterogeneousArchive(
                    existing.to_string(),
                    root_arch.to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    arch.ok_or(AuditError::NonPlatformWheel)
}

fn is_excluded(soname: &str, path: Option<&PathBuf>, exclude: &[Pattern]) -> bool {
    exclude.iter().any(|p| {
        p.matches(soname)
            || path
                .map(|path| p.matches(&path.to_string_lossy()))
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::ElfFixture, object::elf::{EM_AARCH64, EM_X86_64}};

    fn root_at(path: &Path, fixture: ElfFixture) -> RootBinary {
        std::fs::write(path, fixture.build()).unwrap();
        RootBinary {
            archive_path: PathBuf::from(path.file_name().unwrap()),
            elf: ElfFile::open(path).unwrap(),
        }
    }

    #[test]
    fn transitive_expansion_and_aggregation() {
        let scratch = tempfile::tempdir().unwrap();
        let payload = scratch.path().join("payload");
        let system = scratch.path().join("system");
        std::fs::create_dir_all(&payload).unwrap();
        std::fs::create_dir_all(&system).unwrap();

        // libfoo itself needs libbar; both live in the system dir.
        std::fs::write(
            system.join("libbar.so.2"),
            ElfFixture::new(EM_X86_64).soname("libbar.so.2").build(),
        )
        .unwrap();
        std::fs::write(
            system.join("libfoo.so.1"),
            ElfFixture::new(EM_X86_64)
                .soname("libfoo.so.1")
                .needed("libbar.so.2")
                .verneed("libbar.so.2", &["BAR_1.0"])
                .build(),
        )
        .unwrap();

        let root = root_at(
            &payload.join("ext.so"),
            ElfFixture::new(EM_X86_64)
                .needed("libfoo.so.1")
                .verneed("libfoo.so.1", &["FOO_1.1"]),
        );

        let resolver = Resolver::default().with_trusted_dirs(vec![system.clone()]);
        let graph = DependencyGraph::build(vec![root], &resolver, &[], &payload).unwrap();

        assert_eq!(graph.architecture, Architecture::X86_64);
        assert_eq!(graph.external.len(), 2);

        let foo = &graph.external["libfoo.so.1"];
        assert_eq!(foo.path.as_deref(), Some(system.join("libfoo.so.1")).as_deref());
        assert!(foo.importers.contains("ext.so"));
        assert!(foo.requested_versions.contains("FOO_1.1"));
        assert!(!foo.internal);

        let bar = &graph.external["libbar.so.2"];
        assert!(bar.importers.contains("libfoo.so.1"));
        assert!(bar.requested_versions.contains("BAR_1.0"));
    }

    #[test]
    fn internal_resolution_is_marked() {
        let scratch = tempfile::tempdir().unwrap();
        let payload = scratch.path().join("payload");
        std::fs::create_dir_all(payload.join("pkg.libs")).unwrap();

        std::fs::write(
            payload.join("pkg.libs/libvendored.so.1"),
            ElfFixture::new(EM_X86_64).soname("libvendored.so.1").build(),
        )
        .unwrap();

        let root = root_at(
            &payload.join("ext.so"),
            ElfFixture::new(EM_X86_64)
                .needed("libvendored.so.1")
                .runpath("$ORIGIN/pkg.libs"),
        );

        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        let graph = DependencyGraph::build(vec![root], &resolver, &[], &payload).unwrap();

        assert!(graph.external["libvendored.so.1"].internal);
    }

    #[test]
    fn unresolved_is_recorded_not_fatal() {
        let scratch = tempfile::tempdir().unwrap();
        let payload = scratch.path().join("payload");
        std::fs::create_dir_all(&payload).unwrap();

        let root = root_at(
            &payload.join("ext.so"),
            ElfFixture::new(EM_X86_64).needed("libnowhere.so.5"),
        );

        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        let graph = DependencyGraph::build(vec![root], &resolver, &[], &payload).unwrap();

        let node = &graph.external["libnowhere.so.5"];
        assert!(node.path.is_none());
        assert!(node.elf.is_none());
    }

    #[test]
    fn exclusion_patterns() {
        let scratch = tempfile::tempdir().unwrap();
        let payload = scratch.path().join("payload");
        std::fs::create_dir_all(&payload).unwrap();

        let root = root_at(
            &payload.join("ext.so"),
            ElfFixture::new(EM_X86_64)
                .needed("libcuda.so.1")
                .needed("libkept.so.1"),
        );

        let exclude = vec![Pattern::new("libcuda.so.*").unwrap()];
        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        let graph = DependencyGraph::build(vec![root], &resolver, &exclude, &payload).unwrap();

        assert!(!graph.external.contains_key("libcuda.so.1"));
        assert!(graph.excluded.contains("libcuda.so.1"));
        assert!(graph.external.contains_key("libkept.so.1"));
    }

    #[test]
    fn heterogeneous_roots_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let payload = scratch.path().join("payload");
        std::fs::create_dir_all(&payload).unwrap();

        let a = root_at(&payload.join("a.so"), ElfFixture::new(EM_X86_64));
        let b = root_at(&payload.join("b.so"), ElfFixture::new(EM_AARCH64));

        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        let err = DependencyGraph::build(vec![a, b], &resolver, &[], &payload).unwrap_err();
        assert!(matches!(err, AuditError::HeterogeneousArchive(_, _)));
    }

    #[test]
    fn soname_conflict_detected() {
        let scratch = tempfile::tempdir().unwrap();
        let payload = scratch.path().join("payload");
        let dir_a = scratch.path().join("a");
        let dir_b = scratch.path().join("b");
        for d in [&payload, &dir_a, &dir_b] {
            std::fs::create_dir_all(d).unwrap();
        }

        for dir in [&dir_a, &dir_b] {
            std::fs::write(
                dir.join("libdup.so.1"),
                ElfFixture::new(EM_X86_64).soname("libdup.so.1").build(),
            )
            .unwrap();
        }

        let first = root_at(
            &payload.join("one.so"),
            ElfFixture::new(EM_X86_64)
                .needed("libdup.so.1")
                .runpath(&format!("{}", dir_a.display())),
        );
        let second = root_at(
            &payload.join("two.so"),
            ElfFixture::new(EM_X86_64)
                .needed("libdup.so.1")
                .runpath(&format!("{}", dir_b.display())),
        );

        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        let graph =
            DependencyGraph::build(vec![first, second], &resolver, &[], &payload).unwrap();

        assert_eq!(graph.conflicts.len(), 1);
        assert_eq!(graph.conflicts[0].soname, "libdup.so.1");
    }
}
