// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! External binary patcher invocation. */

use {
    crate::error::{AuditError, Result},
    duct::cmd,
    log::debug,
    once_cell::sync::Lazy,
    regex::Regex,
    std::path::Path,
};

static PATCHELF_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"patchelf\s+(\d+)\.(\d+)").unwrap());

/// Rewrites dynamic linking records in ELF files.
///
/// All `DT_NEEDED` renames for one file are handed over together so an
/// implementation can batch them into a single invocation.
pub trait ElfPatcher {
    fn replace_needed(&self, path: &Path, pairs: &[(String, String)]) -> Result<()>;
    fn set_soname(&self, path: &Path, soname: &str) -> Result<()>;
    fn set_rpath(&self, path: &Path, rpath: &str) -> Result<()>;
    fn get_rpath(&self, path: &Path) -> Result<String>;
}

/// The `patchelf` command line tool.
pub struct Patchelf {
    _private: (),
}

impl Patchelf {
    /// Locate `patchelf` and verify it is recent enough.
    ///
    /// RPATH rewriting needs patchelf >= 0.14; anything older corrupts
    /// large binaries.
    pub fn new() -> Result<Self> {
        let output = cmd("patchelf", ["--version"])
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|e| AuditError::PatcherFailed {
                path: "patchelf".to_string(),
                stderr: format!("cannot run patchelf: {}", e),
            })?;

        if !output.status.success() {
            return Err(AuditError::PatcherFailed {
                path: "patchelf".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let supported = PATCHELF_VERSION_RE
            .captures(&stdout)
            .map(|c| {
                let major: u32 = c[1].parse().unwrap_or(0);
                let minor: u32 = c[2].parse().unwrap_or(0);
                (major, minor) >= (0, 14)
            })
            .unwrap_or(false);

        if !supported {
            return Err(AuditError::PatcherFailed {
                path: "patchelf".to_string(),
                stderr: format!(
                    "patchelf >= 0.14 required, found {}",
                    stdout.trim()
                ),
            });
        }

        Ok(Self { _private: () })
    }

    fn run(&self, path: &Path, args: &[&str]) -> Result<String> {
        debug!("patchelf {} {}", args.join(" "), path.display());

        let mut full_args: Vec<&str> = args.to_vec();
        let path_str = path.to_string_lossy();
        full_args.push(path_str.as_ref());

        let output = cmd("patchelf", full_args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|e| AuditError::PatcherFailed {
                path: path.display().to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(AuditError::PatcherFailed {
                path: path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ElfPatcher for Patchelf {
    fn replace_needed(&self, path: &Path, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let mut args: Vec<&str> = Vec::with_capacity(pairs.len() * 3);
        for (old, new) in pairs {
            args.push("--replace-needed");
            args.push(old.as_str());
            args.push(new.as_str());
        }

        self.run(path, &args).map(|_| ())
    }

    fn set_soname(&self, path: &Path, soname: &str) -> Result<()> {
        self.run(path, &["--set-soname", soname]).map(|_| ())
    }

    fn set_rpath(&self, path: &Path, rpath: &str) -> Result<()> {
        self.run(path, &["--remove-rpath"])?;
        self.run(path, &["--force-rpath", "--set-rpath", rpath])
            .map(|_| ())
    }

    fn get_rpath(&self, path: &Path) -> Result<String> {
        self.run(path, &["--print-rpath"])
            .map(|out| out.trim().to_string())
    }
}

/// A patcher that records nothing and changes nothing.
///
/// Used for tag-only repairs, where no binary needs patching, and by
/// tests exercising the planner and executor without `patchelf`.
pub struct NoopPatcher;

impl ElfPatcher for NoopPatcher {
    fn replace_needed(&self, _path: &Path, _pairs: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    fn set_soname(&self, _path: &Path, _soname: &str) -> Result<()> {
        Ok(())
    }

    fn set_rpath(&self, _path: &Path, _rpath: &str) -> Result<()> {
        Ok(())
    }

    fn get_rpath(&self, _path: &Path) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_regex() {
        let c = PATCHELF_VERSION_RE.captures("patchelf 0.14.3").unwrap();
        assert_eq!(&c[1], "0");
        assert_eq!(&c[2], "14");

        assert!(PATCHELF_VERSION_RE.captures("not a version").is_none());
    }
}
