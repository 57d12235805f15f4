// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! musl libc discovery and version probing. */

use {
    crate::version::DottedVersion,
    duct::cmd,
    log::debug,
    once_cell::sync::Lazy,
    regex::Regex,
    std::path::{Path, PathBuf},
};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Version (\d+(?:\.\d+)*)").unwrap());

/// Locate the musl libc shared object in `dir`.
///
/// musl installs exactly one `libc.musl-{arch}.so.1`; its presence is
/// how a musl host is recognized.
pub fn find_musl_libc_in(dir: &Path) -> Option<PathBuf> {
    let pattern = dir.join("libc.musl-*.so.1");
    let mut matches = glob::glob(&pattern.to_string_lossy()).ok()?;
    matches.next().and_then(|m| m.ok())
}

/// Locate the musl libc in the default `/lib`.
pub fn find_musl_libc() -> Option<PathBuf> {
    find_musl_libc_in(Path::new("/lib"))
}

/// The library directories the musl loader searches.
///
/// musl reads a colon-separated list from `/etc/ld-musl-{arch}.path`
/// when that file exists; without it the loader falls back to
/// `/lib:/usr/local/lib:/usr/lib`. `etc_dir` is the directory holding
/// the path file so tests can pin it.
pub fn musl_search_paths(etc_dir: &Path) -> Vec<PathBuf> {
    let pattern = etc_dir.join("ld-musl-*.path");
    let path_file = glob::glob(&pattern.to_string_lossy())
        .ok()
        .and_then(|mut matches| matches.next())
        .and_then(|m| m.ok());

    if let Some(path_file) = path_file {
        match std::fs::read_to_string(&path_file) {
            Ok(text) => return parse_path_file(&text),
            Err(e) => debug!("ignoring {}: {}", path_file.display(), e),
        }
    }

    ["/lib", "/usr/local/lib", "/usr/lib"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn parse_path_file(text: &str) -> Vec<PathBuf> {
    text.split(':')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Determine the version of a musl libc by running it.
///
/// The musl shared object doubles as the dynamic loader and is
/// runnable; invoked without arguments it prints its version to
/// stderr.
pub fn musl_version(libc_path: &Path) -> Option<DottedVersion> {
    let output = cmd(libc_path, Vec::<String>::new())
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .ok()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    match VERSION_RE.captures(&stderr) {
        Some(captures) => DottedVersion::parse(&captures[1]),
        None => {
            debug!(
                "could not find musl version in output of {}",
                libc_path.display()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_regex() {
        let stderr = "musl libc (x86_64)\nVersion 1.2.4\nDynamic Program Loader\n";
        let captures = VERSION_RE.captures(stderr).unwrap();
        assert_eq!(
            DottedVersion::parse(&captures[1]).unwrap(),
            DottedVersion::parse("1.2.4").unwrap()
        );

        assert!(VERSION_RE.captures("no version here").is_none());
    }

    #[test]
    fn musl_discovery() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_musl_libc_in(dir.path()).is_none());

        let path = dir.path().join("libc.musl-x86_64.so.1");
        std::fs::write(&path, b"\x7fELF").unwrap();
        assert_eq!(find_musl_libc_in(dir.path()), Some(path));
    }

    #[test]
    fn search_paths_from_path_file() {
        let etc = tempfile::tempdir().unwrap();
        std::fs::write(
            etc.path().join("ld-musl-x86_64.path"),
            "/opt/musl/lib:/lib\n",
        )
        .unwrap();

        assert_eq!(
            musl_search_paths(etc.path()),
            vec![PathBuf::from("/opt/musl/lib"), PathBuf::from("/lib")]
        );
    }

    #[test]
    fn search_paths_default_without_path_file() {
        let etc = tempfile::tempdir().unwrap();

        assert_eq!(
            musl_search_paths(etc.path()),
            vec![
                PathBuf::from("/lib"),
                PathBuf::from("/usr/local/lib"),
                PathBuf::from("/usr/lib"),
            ]
        );
    }

    #[test]
    fn path_file_entries_are_trimmed() {
        assert_eq!(
            parse_path_file(" /lib :\n:/usr/lib\n"),
            vec![PathBuf::from("/lib"), PathBuf::from("/usr/lib")]
        );
    }
}
