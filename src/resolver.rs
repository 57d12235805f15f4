// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Needed-library resolution.

Replicates the deterministic part of the runtime loader's search order
to locate a `DT_NEEDED` entry starting from a dependent binary:
dependent `DT_RUNPATH` (else `DT_RPATH`, plus ancestors' `DT_RPATH`
when walking the legacy chain), `LD_LIBRARY_PATH` when the caller opted
in, the parsed `ld.so.cache`, and finally the trusted directories.

A candidate only satisfies a dependency when its ELF class, endianness
and machine match the dependent's. Nothing is executed; files are only
read.
*/

use {
    crate::{
        arch::Architecture,
        elf::{read_ident, ElfFile, Libc},
        ldcache::LdsoCache,
        musl,
        version::{DottedVersion, SymbolVersion},
    },
    log::debug,
    std::path::{Path, PathBuf},
};

/// The libc flavor and version found on the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostLibc {
    pub libc: Libc,
    pub version: Option<DottedVersion>,
}

/// Determine the host's libc flavor from the filesystem.
pub fn system_libc() -> Libc {
    if musl::find_musl_libc().is_some() {
        debug!("detected musl libc");
        Libc::Musl
    } else {
        Libc::Glibc
    }
}

/// Needed-library resolver for one invocation.
///
/// All inputs influencing the search are explicit so tests can pin
/// them: the environment is never read here.
#[derive(Clone, Debug)]
pub struct Resolver {
    trusted_dirs: Option<Vec<PathBuf>>,
    ld_library_path: Option<String>,
    cache: LdsoCache,
    rpath_chain: bool,
}

impl Default for Resolver {
    fn default() -> Self {
        Self {
            trusted_dirs: None,
            ld_library_path: None,
            cache: LdsoCache::default(),
            rpath_chain: true,
        }
    }
}

impl Resolver {
    /// A resolver using the host's `ld.so.cache` and trusted
    /// directories.
    pub fn host() -> Self {
        Self {
            cache: LdsoCache::load_default(),
            ..Self::default()
        }
    }

    /// Consult the given `LD_LIBRARY_PATH` value during search.
    pub fn with_ld_library_path(mut self, value: Option<String>) -> Self {
        self.ld_library_path = value;
        self
    }

    /// Replace the loader cache.
    pub fn with_cache(mut self, cache: LdsoCache) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the trusted directories (tests pin these).
    pub fn with_trusted_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.trusted_dirs = Some(dirs);
        self
    }

    /// Enable or disable the legacy parent-`DT_RPATH` chain walk.
    pub fn with_rpath_chain(mut self, enabled: bool) -> Self {
        self.rpath_chain = enabled;
        self
    }

    /// Whether the parent-RPATH chain walk is enabled.
    pub fn rpath_chain(&self) -> bool {
        self.rpath_chain
    }

    /// Locate `soname` for `dependent`.
    ///
    /// `parent_rpaths` carries the already-expanded `DT_RPATH` entries
    /// of the dependent's transitive parents; they participate only
    /// when the dependent has no `DT_RUNPATH` and the chain walk is
    /// enabled.
    pub fn resolve(
        &self,
        dependent: &ElfFile,
        soname: &str,
        parent_rpaths: &[PathBuf],
    ) -> Option<PathBuf> {
        let origin = dependent
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        // A slash makes the entry a literal path, not a search name.
        if soname.contains('/') {
            let candidate = if Path::new(soname).is_absolute() {
                PathBuf::from(soname)
            } else {
                origin.join(soname)
            };
            return candidate.exists().then(|| candidate);
        }

        let arch = dependent.arch().ok();

        let mut dirs: Vec<PathBuf> = Vec::new();

        if !dependent.runpaths.is_empty() {
            for entry in &dependent.runpaths {
                dirs.push(expand_dst_tokens(entry, &origin, arch));
            }
        } else {
            for entry in &dependent.rpaths {
                dirs.push(expand_dst_tokens(entry, &origin, arch));
            }
            if self.rpath_chain {
                dirs.extend(parent_rpaths.iter().cloned());
            }
        }

        if let Some(env_path) = &self.ld_library_path {
            for entry in env_path.split(':') {
                dirs.push(expand_dst_tokens(entry, &origin, arch));
            }
        }

        for dir in dedupe(dirs) {
            let candidate = normalize_lexically(&dir.join(soname));
            if self.candidate_matches(&candidate, dependent) {
                return Some(candidate);
            }
        }

        for path in self.cache.find(soname) {
            let candidate = PathBuf::from(path);
            if self.candidate_matches(&candidate, dependent) {
                return Some(candidate);
            }
        }

        for dir in self.trusted_dirs_for(arch, dependent.libc) {
            let candidate = normalize_lexically(&dir.join(soname));
            if self.candidate_matches(&candidate, dependent) {
                return Some(candidate);
            }
        }

        None
    }

    fn trusted_dirs_for(&self, arch: Option<Architecture>, libc: Option<Libc>) -> Vec<PathBuf> {
        if let Some(dirs) = &self.trusted_dirs {
            return dirs.clone();
        }

        // musl has its own search list, configurable through
        // /etc/ld-musl-{arch}.path.
        if libc == Some(Libc::Musl) {
            return musl::musl_search_paths(Path::new("/etc"));
        }

        let mut dirs = Vec::new();
        if arch.map(|a| a.is_64bit()).unwrap_or(false) {
            dirs.push(PathBuf::from("/lib64"));
            dirs.push(PathBuf::from("/usr/lib64"));
        }
        dirs.push(PathBuf::from("/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
        dirs
    }

    fn candidate_matches(&self, candidate: &Path, dependent: &ElfFile) -> bool {
        match read_ident(candidate) {
            Ok(Some(ident)) => ident.is_compatible(&dependent.ident),
            _ => false,
        }
    }

    /// Determine the flavor and version of the libc a binary consumes.
    ///
    /// glibc versions come from the version definitions of the resolved
    /// `libc.so.6`; musl versions from running the interpreter, which
    /// doubles as `libc.so` and reports itself on stderr.
    pub fn detect_host_libc(&self, dependent: &ElfFile) -> Option<HostLibc> {
        match dependent.libc? {
            Libc::Glibc => {
                let libc_path = self.resolve(dependent, "libc.so.6", &[])?;
                let libc = ElfFile::open(&libc_path).ok()?;
                let version = libc
                    .version_definitions
                    .iter()
                    .filter_map(|token| {
                        let sv = SymbolVersion::parse(token);
                        if sv.group() == "GLIBC" {
                            sv.version().cloned()
                        } else {
                            None
                        }
                    })
                    .max();
                Some(HostLibc {
                    libc: Libc::Glibc,
                    version,
                })
            }
            Libc::Musl => {
                let interp = dependent
                    .interpreter
                    .as_ref()
                    .map(PathBuf::from)
                    .or_else(musl::find_musl_libc)?;
                Some(HostLibc {
                    libc: Libc::Musl,
                    version: musl::musl_version(&interp),
                })
            }
        }
    }
}

/// Expand the dynamic string tokens the loader substitutes in search
/// path entries. An empty entry means the working directory.
pub fn expand_dst_tokens(entry: &str, origin: &Path, arch: Option<Architecture>) -> PathBuf {
    if entry.is_empty() {
        return std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    let origin_str = origin.to_string_lossy();
    let mut expanded = entry.to_string();
    for (token, replacement) in [
        ("$ORIGIN", origin_str.as_ref()),
        ("${ORIGIN}", origin_str.as_ref()),
    ] {
        expanded = expanded.replace(token, replacement);
    }

    if let Some(arch) = arch {
        for (token, replacement) in [
            ("$LIB", arch.lib_token()),
            ("${LIB}", arch.lib_token()),
            ("$PLATFORM", arch.token()),
            ("${PLATFORM}", arch.token()),
        ] {
            expanded = expanded.replace(token, replacement);
        }
    }

    PathBuf::from(expanded)
}

fn dedupe(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    dirs.into_iter().filter(|d| seen.insert(d.clone())).collect()
}

/// Lexically resolve `.` and `..` components, the way the loader's
/// path handling does; symlinks are not consulted.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if matches!(out.last(), Some(std::path::Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out.iter().collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::ElfFixture,
        object::elf::{EM_386, EM_X86_64},
    };

    fn write_lib(dir: &Path, name: &str, machine: u16) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, ElfFixture::new(machine).soname(name).build()).unwrap();
        path
    }

    fn write_dependent(dir: &Path, fixture: ElfFixture) -> ElfFile {
        let path = dir.join("extension.so");
        std::fs::write(&path, fixture.build()).unwrap();
        ElfFile::open(&path).unwrap()
    }

    #[test]
    fn origin_runpath_resolution() {
        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        let lib_dir = root.path().join("lib");
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::create_dir_all(&lib_dir).unwrap();

        let lib = write_lib(&lib_dir, "libfoo.so.1", EM_X86_64);
        let dependent = write_dependent(
            &bin_dir,
            ElfFixture::new(EM_X86_64)
                .needed("libfoo.so.1")
                .runpath("$ORIGIN/../lib"),
        );

        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        assert_eq!(
            resolver.resolve(&dependent, "libfoo.so.1", &[]),
            Some(lib)
        );
        assert_eq!(resolver.resolve(&dependent, "libmissing.so.9", &[]), None);
    }

    #[test]
    fn runpath_shadows_rpath() {
        let root = tempfile::tempdir().unwrap();
        let rpath_dir = root.path().join("rpath");
        let runpath_dir = root.path().join("runpath");
        std::fs::create_dir_all(&rpath_dir).unwrap();
        std::fs::create_dir_all(&runpath_dir).unwrap();

        write_lib(&rpath_dir, "libfoo.so.1", EM_X86_64);
        let dependent = write_dependent(
            root.path(),
            ElfFixture::new(EM_X86_64)
                .needed("libfoo.so.1")
                .rpath("$ORIGIN/rpath")
                .runpath("$ORIGIN/runpath"),
        );

        // RUNPATH is present, so the RPATH directory is never searched.
        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        assert_eq!(resolver.resolve(&dependent, "libfoo.so.1", &[]), None);
    }

    #[test]
    fn class_mismatch_skips_candidate() {
        let root = tempfile::tempdir().unwrap();
        let first = root.path().join("first");
        let second = root.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        write_lib(&first, "libfoo.so.1", EM_386);
        let good = write_lib(&second, "libfoo.so.1", EM_X86_64);

        let dependent =
            write_dependent(root.path(), ElfFixture::new(EM_X86_64).needed("libfoo.so.1"));

        let resolver = Resolver::default().with_trusted_dirs(vec![first, second]);
        assert_eq!(resolver.resolve(&dependent, "libfoo.so.1", &[]), Some(good));
    }

    #[test]
    fn parent_rpath_chain() {
        let root = tempfile::tempdir().unwrap();
        let chain_dir = root.path().join("chain");
        std::fs::create_dir_all(&chain_dir).unwrap();

        let lib = write_lib(&chain_dir, "libbar.so.2", EM_X86_64);
        let dependent =
            write_dependent(root.path(), ElfFixture::new(EM_X86_64).needed("libbar.so.2"));

        let parents = vec![chain_dir];

        let resolver = Resolver::default().with_trusted_dirs(vec![]);
        assert_eq!(
            resolver.resolve(&dependent, "libbar.so.2", &parents),
            Some(lib)
        );

        let no_chain = Resolver::default()
            .with_trusted_dirs(vec![])
            .with_rpath_chain(false);
        assert_eq!(no_chain.resolve(&dependent, "libbar.so.2", &parents), None);
    }

    #[test]
    fn ld_library_path_only_when_pinned() {
        let root = tempfile::tempdir().unwrap();
        let env_dir = root.path().join("env");
        std::fs::create_dir_all(&env_dir).unwrap();

        let lib = write_lib(&env_dir, "libbaz.so.3", EM_X86_64);
        let dependent =
            write_dependent(root.path(), ElfFixture::new(EM_X86_64).needed("libbaz.so.3"));

        let without = Resolver::default().with_trusted_dirs(vec![]);
        assert_eq!(without.resolve(&dependent, "libbaz.so.3", &[]), None);

        let with = Resolver::default()
            .with_trusted_dirs(vec![])
            .with_ld_library_path(Some(env_dir.to_string_lossy().into_owned()));
        assert_eq!(with.resolve(&dependent, "libbaz.so.3", &[]), Some(lib));
    }

    #[test]
    fn cache_resolution() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cached");
        std::fs::create_dir_all(&cache_dir).unwrap();
        let lib = write_lib(&cache_dir, "libz.so.1", EM_X86_64);

        let cache = crate::ldcache::LdsoCache::from_entries(vec![crate::ldcache::CacheEntry {
            name: "libz.so.1".to_string(),
            path: lib.to_string_lossy().into_owned(),
        }]);

        let dependent =
            write_dependent(root.path(), ElfFixture::new(EM_X86_64).needed("libz.so.1"));

        let resolver = Resolver::default()
            .with_trusted_dirs(vec![])
            .with_cache(cache);
        assert_eq!(resolver.resolve(&dependent, "libz.so.1", &[]), Some(lib));
    }

    #[test]
    fn expand_tokens() {
        let origin = Path::new("/scratch/pkg");
        assert_eq!(
            expand_dst_tokens("$ORIGIN/../pkg.libs", origin, Some(Architecture::X86_64)),
            PathBuf::from("/scratch/pkg/../pkg.libs")
        );
        assert_eq!(
            expand_dst_tokens("/opt/$LIB/extra", origin, Some(Architecture::X86_64)),
            PathBuf::from("/opt/lib64/extra")
        );
        assert_eq!(
            expand_dst_tokens("/opt/${PLATFORM}", origin, Some(Architecture::Aarch64)),
            PathBuf::from("/opt/aarch64")
        );
    }
}
