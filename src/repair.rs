// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Wheel repair: planning and execution.

Repair takes the analysis record and a target policy and rewrites the
unpacked wheel so the policy holds: external libraries are grafted into
a `{distribution}.libs` directory under collision-free names, dependents'
`DT_NEEDED` entries are rewritten to the new names, and every touched
binary receives a `$ORIGIN`-relative `DT_RUNPATH` reaching the graft
directory. Planning is pure; execution copies files and drives the
external patcher, leaves first, in a deterministic order.
*/

use {
    crate::{
        audit::WheelAbiReport,
        error::{AuditError, Result},
        patcher::ElfPatcher,
        policy::Policy,
        resolver::normalize_lexically,
        wheel::UnpackedWheel,
    },
    duct::cmd,
    log::{debug, info},
    sha2::{Digest, Sha256},
    std::{
        collections::{BTreeMap, BTreeSet},
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
};

const S_IWUSR: u32 = 0o200;

/// Options steering a repair.
#[derive(Clone, Debug)]
pub struct RepairOptions {
    /// Suffix of the graft directory appended to the distribution
    /// name.
    pub lib_sdir: String,

    /// Directory receiving the output wheel.
    pub out_dir: PathBuf,

    /// Whether to rewrite the platform tags in the file name and
    /// `WHEEL` metadata.
    pub update_tags: bool,

    /// Tag only with the target policy, omitting legacy aliases.
    pub only_plat: bool,

    /// Strip debug symbols from grafted libraries.
    pub strip: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            lib_sdir: ".libs".to_string(),
            out_dir: PathBuf::from("wheelhouse"),
            update_tags: true,
            only_plat: false,
            strip: false,
        }
    }
}

/// One library to copy into the graft directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GraftAction {
    pub soname: String,
    pub src: PathBuf,
    pub new_name: String,
}

/// The dynamic-record rewrites for one binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchAction {
    /// Path relative to the wheel root.
    pub target: PathBuf,
    pub set_soname: Option<String>,
    pub replacements: Vec<(String, String)>,
    pub runpath: Option<String>,
}

/// A complete repair plan for one wheel.
#[derive(Clone, Debug)]
pub struct RepairPlan {
    /// Graft directory relative to the wheel root.
    pub graft_dir: PathBuf,

    /// Copies to perform, dependencies before dependents.
    pub grafts: Vec<GraftAction>,

    /// Patches in execution order: grafted copies first (same order as
    /// `grafts`), then root binaries.
    pub patches: Vec<PatchAction>,

    /// Platform tags to add.
    pub platforms: Vec<String>,

    /// Platform tags the added ones supersede.
    pub remove_platforms: Vec<String>,
}

impl RepairPlan {
    /// Whether this plan only adjusts tags.
    pub fn is_tag_only(&self) -> bool {
        self.grafts.is_empty()
    }
}

/// Compute the repair plan taking `wheel` to `target`.
pub fn plan_repair(
    wheel: &UnpackedWheel,
    report: &WheelAbiReport,
    target: &Policy,
    options: &RepairOptions,
) -> Result<RepairPlan> {
    report.validate_target(target)?;

    if let Some(conflict) = report.graph.conflicts.first() {
        return Err(AuditError::SonameConflict {
            soname: conflict.soname.clone(),
            first: conflict.first.display().to_string(),
            second: conflict.second.display().to_string(),
        });
    }

    let refs = &report.external_refs[&target.name];
    let graft_dir = PathBuf::from(format!("{}{}", wheel.name.distribution, options.lib_sdir));

    // Assign collision-free names first; rewrites reference them.
    let mut new_names: BTreeMap<String, String> = BTreeMap::new();
    let mut sources: BTreeMap<String, PathBuf> = BTreeMap::new();

    for (soname, path) in &refs.libs {
        let src = path.clone().ok_or_else(|| {
            let dependent = report
                .graph
                .external
                .get(soname)
                .and_then(|n| n.importers.iter().next().cloned())
                .unwrap_or_default();
            AuditError::Unresolved {
                soname: soname.clone(),
                dependent,
            }
        })?;

        let hash = hash8(&src)?;
        new_names.insert(soname.clone(), graft_name(soname, &hash));
        sources.insert(soname.clone(), src);
    }

    // Dependencies before dependents so a freshly-renamed library is
    // final before anything referring to it is patched.
    let deps_of = |soname: &String| -> BTreeSet<String> {
        report
            .graph
            .external
            .get(soname)
            .and_then(|n| n.elf.as_ref())
            .map(|elf| {
                elf.needed
                    .iter()
                    .filter(|n| new_names.contains_key(*n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    };
    let order = topological_order(new_names.keys().cloned().collect(), deps_of);

    let mut grafts = Vec::new();
    let mut patches = Vec::new();

    for soname in &order {
        let new_name = &new_names[soname];
        grafts.push(GraftAction {
            soname: soname.clone(),
            src: sources[soname].clone(),
            new_name: new_name.clone(),
        });

        let replacements = report
            .graph
            .external
            .get(soname)
            .and_then(|n| n.elf.as_ref())
            .map(|elf| {
                elf.needed
                    .iter()
                    .filter_map(|n| new_names.get(n).map(|nn| (n.clone(), nn.clone())))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        patches.push(PatchAction {
            target: graft_dir.join(new_name),
            set_soname: Some(new_name.clone()),
            replacements,
            runpath: Some("$ORIGIN".to_string()),
        });
    }

    for root in &report.graph.roots {
        let replacements: Vec<(String, String)> = root
            .elf
            .needed
            .iter()
            .filter_map(|n| new_names.get(n).map(|nn| (n.clone(), nn.clone())))
            .collect();

        if replacements.is_empty() {
            continue;
        }

        let binary_dir = root
            .archive_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        let to_grafts = relative_path(&binary_dir, &graft_dir);
        let new_entry = format!("$ORIGIN/{}", to_grafts.display())
            .trim_end_matches('/')
            .to_string();

        let mut entries = preserved_runpath_entries(wheel, root.archive_path.as_path(), &root.elf);
        if !entries.contains(&new_entry) {
            entries.push(new_entry);
        }

        patches.push(PatchAction {
            target: root.archive_path.clone(),
            set_soname: None,
            replacements,
            runpath: Some(entries.join(":")),
        });
    }

    let platforms = if options.only_plat {
        vec![target.name.clone()]
    } else {
        target.all_tags()
    };

    Ok(RepairPlan {
        graft_dir,
        grafts,
        patches,
        platforms,
        remove_platforms: target.replace_platforms(),
    })
}

/// Apply a plan to the unpacked wheel and write the output archive.
///
/// The input archive is never touched; the output wheel materializes
/// only after every step succeeded.
pub fn execute_repair(
    wheel: &mut UnpackedWheel,
    plan: &RepairPlan,
    patcher: &dyn ElfPatcher,
    options: &RepairOptions,
) -> Result<PathBuf> {
    if !plan.is_tag_only() {
        fs::create_dir_all(wheel.root().join(&plan.graft_dir))?;
    }

    for graft in &plan.grafts {
        let dest = wheel.root().join(&plan.graft_dir).join(&graft.new_name);
        if dest.exists() {
            continue;
        }

        debug!("grafting: {} -> {}", graft.src.display(), dest.display());
        fs::copy(&graft.src, &dest)?;

        let mut permissions = fs::metadata(&dest)?.permissions();
        if permissions.mode() & S_IWUSR == 0 {
            permissions.set_mode(permissions.mode() | S_IWUSR);
            fs::set_permissions(&dest, permissions)?;
        }

        if options.strip {
            strip_symbols(&dest)?;
        }
    }

    for patch in &plan.patches {
        let target = wheel.root().join(&patch.target);

        if let Some(soname) = &patch.set_soname {
            patcher.set_soname(&target, soname)?;
        }
        if !patch.replacements.is_empty() {
            patcher.replace_needed(&target, &patch.replacements)?;
        }
        if let Some(runpath) = &patch.runpath {
            patcher.set_rpath(&target, runpath)?;
        }
    }

    if options.update_tags {
        wheel.add_platform_tags(&plan.platforms, &plan.remove_platforms)?;
    }

    wheel.rewrite_record()?;

    fs::create_dir_all(&options.out_dir)?;
    let out = wheel.write_into_directory(&options.out_dir)?;
    info!("fixed-up wheel written: {}", out.display());

    Ok(out)
}

fn strip_symbols(path: &Path) -> Result<()> {
    info!("stripping symbols from {}", path.display());

    let output = cmd("strip", vec!["-s".to_string(), path.to_string_lossy().into_owned()])
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| AuditError::StripFailed {
            path: path.display().to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(AuditError::StripFailed {
            path: path.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

/// First 8 hex characters of the SHA-256 of the file's bytes.
fn hash8(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    let mut digest = Sha256::new();
    digest.update(&data);
    let digest = digest.finalize();

    Ok(digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// The collision-free graft name for a library referred to as
/// `soname`: `libfoo.so.1` with hash `ab12cd34` becomes
/// `libfoo-ab12cd34.so.1`. A name already carrying the hash is kept,
/// which keeps repeated repairs stable.
fn graft_name(soname: &str, hash: &str) -> String {
    match soname.split_once('.') {
        Some((stem, rest)) => {
            if stem.ends_with(&format!("-{}", hash)) {
                soname.to_string()
            } else {
                format!("{}-{}.{}", stem, hash, rest)
            }
        }
        None => format!("{}-{}", soname, hash),
    }
}

/// Order `nodes` so every node follows its dependencies; ties and
/// cycles fall back to name order so the result is deterministic.
fn topological_order(
    nodes: BTreeSet<String>,
    deps_of: impl Fn(&String) -> BTreeSet<String>,
) -> Vec<String> {
    let mut remaining = nodes;
    let mut order = Vec::new();
    let mut placed: BTreeSet<String> = BTreeSet::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|n| deps_of(n).iter().all(|d| placed.contains(d) || !remaining.contains(d)))
            .cloned()
            .collect();

        // A dependency cycle: break it in name order.
        let batch = if ready.is_empty() {
            vec![remaining.iter().next().expect("non-empty").clone()]
        } else {
            ready
        };

        for node in batch {
            remaining.remove(&node);
            placed.insert(node.clone());
            order.push(node);
        }
    }

    order
}

/// Existing `$ORIGIN`-relative RUNPATH entries of a binary that still
/// point inside the wheel. Anything else, notably absolute paths
/// leaked from the build machine, is dropped.
fn preserved_runpath_entries(
    wheel: &UnpackedWheel,
    archive_path: &Path,
    elf: &crate::elf::ElfFile,
) -> Vec<String> {
    let binary_dir = archive_path.parent().unwrap_or_else(|| Path::new(""));

    let mut kept = Vec::new();
    for entry in elf.runpaths.iter().chain(elf.rpaths.iter()) {
        let suffix = entry
            .strip_prefix("$ORIGIN")
            .or_else(|| entry.strip_prefix("${ORIGIN}"));

        let suffix = match suffix {
            Some(suffix) => suffix.trim_start_matches('/'),
            None => {
                debug!("dropping rpath entry {}", entry);
                continue;
            }
        };

        let resolved = normalize_lexically(&binary_dir.join(suffix));
        if resolved.starts_with("..") {
            debug!("rpath entry {} points outside the wheel", entry);
            continue;
        }
        if !wheel.root().join(&resolved).is_dir() {
            debug!("rpath entry {} no longer resolves", entry);
            continue;
        }

        if !kept.contains(entry) {
            debug!("preserved rpath entry {}", entry);
            kept.push(entry.clone());
        }
    }

    kept
}

/// The relative path from directory `from` to directory `to`, both
/// relative to the same root.
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graft_naming() {
        assert_eq!(graft_name("libfoo.so.1", "ab12cd34"), "libfoo-ab12cd34.so.1");
        assert_eq!(graft_name("libssl.so.1.1", "deadbeef"), "libssl-deadbeef.so.1.1");
        assert_eq!(graft_name("weird", "deadbeef"), "weird-deadbeef");
        // Re-grafting an already-hashed name is stable.
        assert_eq!(
            graft_name("libfoo-ab12cd34.so.1", "ab12cd34"),
            "libfoo-ab12cd34.so.1"
        );
    }

    #[test]
    fn hash_is_stable_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();

        let h = hash8(&path).unwrap();
        assert_eq!(h.len(), 8);
        // sha256("hello world") starts with b94d27b9.
        assert_eq!(h, "b94d27b9");
    }

    #[test]
    fn topological_leaves_first() {
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        deps.insert("liba.so".into(), ["libb.so".to_string()].into_iter().collect());
        deps.insert("libb.so".into(), ["libc.so".to_string()].into_iter().collect());
        deps.insert("libc.so".into(), BTreeSet::new());

        let order = topological_order(
            deps.keys().cloned().collect(),
            |n| deps.get(n).cloned().unwrap_or_default(),
        );
        assert_eq!(order, vec!["libc.so", "libb.so", "liba.so"]);
    }

    #[test]
    fn topological_cycle_terminates() {
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        deps.insert("liba.so".into(), ["libb.so".to_string()].into_iter().collect());
        deps.insert("libb.so".into(), ["liba.so".to_string()].into_iter().collect());

        let order = topological_order(
            deps.keys().cloned().collect(),
            |n| deps.get(n).cloned().unwrap_or_default(),
        );
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn relative_paths() {
        assert_eq!(
            relative_path(Path::new("pkg/sub"), Path::new("demo.libs")),
            PathBuf::from("../../demo.libs")
        );
        assert_eq!(
            relative_path(Path::new(""), Path::new("demo.libs")),
            PathBuf::from("demo.libs")
        );
        assert_eq!(
            relative_path(Path::new("pkg"), Path::new("pkg")),
            PathBuf::from("")
        );
    }

    #[test]
    fn normalize_paths() {
        assert_eq!(
            normalize_lexically(Path::new("pkg/../demo.libs")),
            PathBuf::from("demo.libs")
        );
        assert_eq!(normalize_lexically(Path::new("a/./b")), PathBuf::from("a/b"));
        assert_eq!(normalize_lexically(Path::new("../x")), PathBuf::from("../x"));
    }
}
