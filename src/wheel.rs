// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Wheel archive access.

A wheel is a zip archive whose name encodes distribution tags and whose
`*.dist-info/` directory describes the build. This module unpacks a
wheel into a scratch directory, classifies its contents, rewrites the
`WHEEL` tag list and `RECORD` digests, and repacks deterministically.
*/

use {
    crate::{
        elf::has_elf_magic,
        error::{AuditError, Result},
    },
    log::{debug, info},
    once_cell::sync::Lazy,
    regex::Regex,
    sha2::{Digest, Sha256},
    std::{
        fs,
        io::{Seek, Write},
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
    tempfile::TempDir,
    walkdir::WalkDir,
    zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter},
};

/// Wheel file name structure per PEP 427.
///
/// This is copied from the wheel.wheelfile Python module.
static RE_WHEEL_INFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<namever>(?P<name>.+?)-(?P<ver>.+?))(-(?P<build>\d[^-]*))?-(?P<pyver>.+?)-(?P<abi>.+?)-(?P<plat>.+?)\.whl$").unwrap()
});

const S_IWUSR: u32 = 0o200;

/// Parsed components of a wheel file name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WheelName {
    pub distribution: String,
    pub version: String,
    pub build: Option<String>,
    pub python_tag: String,
    pub abi_tag: String,
    /// The platform segment; may be a dot-compressed list of tags.
    pub platform_tag: String,
}

impl WheelName {
    /// Parse a wheel basename such as
    /// `demo-1.0-cp310-cp310-linux_x86_64.whl`.
    pub fn parse(basename: &str) -> Result<Self> {
        let captures = RE_WHEEL_INFO.captures(basename).ok_or_else(|| {
            AuditError::InvalidWheel(format!("failed to parse wheel file name: {}", basename))
        })?;

        Ok(Self {
            distribution: captures.name("name").unwrap().as_str().to_string(),
            version: captures.name("ver").unwrap().as_str().to_string(),
            build: captures.name("build").map(|m| m.as_str().to_string()),
            python_tag: captures.name("pyver").unwrap().as_str().to_string(),
            abi_tag: captures.name("abi").unwrap().as_str().to_string(),
            platform_tag: captures.name("plat").unwrap().as_str().to_string(),
        })
    }

    /// Reassemble the file name from the current components.
    pub fn file_name(&self) -> String {
        let mut parts = vec![self.distribution.clone(), self.version.clone()];
        if let Some(build) = &self.build {
            parts.push(build.clone());
        }
        parts.push(self.python_tag.clone());
        parts.push(self.abi_tag.clone());
        parts.push(self.platform_tag.clone());
        format!("{}.whl", parts.join("-"))
    }

    /// The `{name}-{version}` prefix used by `.dist-info` directories.
    pub fn name_version(&self) -> String {
        format!("{}-{}", self.distribution, self.version)
    }

    /// Individual platform tags in the (possibly dot-compressed)
    /// platform segment.
    pub fn platform_tags(&self) -> Vec<&str> {
        self.platform_tag.split('.').collect()
    }
}

/// Key/value headers of a `WHEEL` (or `METADATA`) file.
#[derive(Clone, Debug)]
pub struct WheelMetadata {
    headers: Vec<(String, String)>,
}

impl WheelMetadata {
    /// Parse metadata from file content.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let message = mailparse::parse_mail(data)
            .map_err(|e| AuditError::InvalidWheel(format!("parsing WHEEL metadata: {}", e)))?;

        let headers = message
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect();

        Ok(Self { headers })
    }

    pub fn find_first(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn find_all(&self, key: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace every `key` header with the given values, keeping the
    /// first occurrence's position.
    pub fn replace_all(&mut self, key: &str, values: &[String]) {
        let position = self
            .headers
            .iter()
            .position(|(k, _)| k == key)
            .unwrap_or(self.headers.len());
        self.headers.retain(|(k, _)| k != key);

        for (offset, value) in values.iter().enumerate() {
            self.headers
                .insert(position + offset, (key.to_string(), value.clone()));
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.replace_all(key, &[value.to_string()]);
    }

    /// Serialize back to the email-header format wheels use.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.into_bytes()
    }
}

/// A wheel unpacked into an exclusively-owned scratch directory.
///
/// The scratch directory is removed when the value drops, success or
/// failure; the source archive is never modified.
pub struct UnpackedWheel {
    scratch: TempDir,
    pub name: WheelName,
}

impl UnpackedWheel {
    /// Extract `path` into a fresh scratch directory, preserving file
    /// modes.
    pub fn unpack(path: &Path) -> Result<Self> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AuditError::InvalidWheel(format!("{} has no file name", path.display()))
            })?;
        let name = WheelName::parse(&basename)?;

        let scratch = TempDir::new()?;
        let file = fs::File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        debug!("unpacking {} into {}", path.display(), scratch.path().display());

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let relative = entry
                .enclosed_name()
                .ok_or_else(|| {
                    AuditError::InvalidWheel(format!(
                        "archive member {} escapes the archive root",
                        entry.name()
                    ))
                })?
                .to_path_buf();

            let dest = scratch.path().join(&relative);

            if entry.is_dir() {
                fs::create_dir_all(&dest)?;
                continue;
            }

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut out = fs::File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)?;

            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
        }

        Ok(Self { scratch, name })
    }

    /// The scratch directory holding the unpacked payload.
    pub fn root(&self) -> &Path {
        self.scratch.path()
    }

    /// Every regular file in the payload, relative to the root, in
    /// deterministic order.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(self.root()).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                AuditError::InvalidWheel(format!("walking unpacked wheel: {}", e))
            })?;
            if entry.file_type().is_file() {
                files.push(
                    entry
                        .path()
                        .strip_prefix(self.root())
                        .expect("walked path is under root")
                        .to_path_buf(),
                );
            }
        }
        Ok(files)
    }

    /// Payload files bearing the ELF magic, relative to the root.
    pub fn elf_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .files()?
            .into_iter()
            .filter(|rel| has_elf_magic(&self.root().join(rel)))
            .collect())
    }

    /// The single `*.dist-info` directory, relative to the root.
    pub fn dist_info_dir(&self) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(self.root())? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry.file_name().to_string_lossy().ends_with(".dist-info")
            {
                candidates.push(PathBuf::from(entry.file_name()));
            }
        }

        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            n => Err(AuditError::InvalidWheel(format!(
                "expected exactly one .dist-info directory, found {}",
                n
            ))),
        }
    }

    /// Read and parse `.dist-info/WHEEL`.
    pub fn wheel_metadata(&self) -> Result<WheelMetadata> {
        let path = self.root().join(self.dist_info_dir()?).join("WHEEL");
        let data = fs::read(&path)
            .map_err(|_| AuditError::InvalidWheel("missing .dist-info/WHEEL".to_string()))?;
        WheelMetadata::from_bytes(&data)
    }

    /// Add platform tags to the wheel, removing superseded ones.
    ///
    /// Updates the `WHEEL` file's `Tag:` lines (the product of existing
    /// python/abi pairs with the added platforms) and this wheel's file
    /// name platform segment (the sorted dot-join of surviving tags).
    /// A wheel that stops being `any` is forced to `Root-Is-Purelib:
    /// false`.
    pub fn add_platform_tags(&mut self, platforms: &[String], remove: &[String]) -> Result<()> {
        let mut to_remove: Vec<String> = remove.to_vec();
        let mut definitely_not_purelib = false;

        let original_tags: Vec<String> = self
            .name
            .platform_tags()
            .iter()
            .map(|t| t.to_string())
            .collect();
        info!("previous filename tags: {}", original_tags.join(", "));

        let mut fname_tags: Vec<String> = original_tags
            .iter()
            .filter(|t| !to_remove.contains(t))
            .cloned()
            .collect();
        for tag in platforms {
            if !fname_tags.contains(tag) {
                fname_tags.push(tag.clone());
            }
        }

        // A wheel cannot be both generic and platform specific.
        if fname_tags.len() > 1 && fname_tags.iter().any(|t| t == "any") {
            fname_tags.retain(|t| t != "any");
            to_remove.push("any".to_string());
            definitely_not_purelib = true;
        }

        fname_tags.sort();
        if fname_tags != original_tags {
            info!("new filename tags: {}", fname_tags.join(", "));
        } else {
            info!("no filename tags change needed");
        }

        let mut metadata = self.wheel_metadata()?;
        let in_info_tags: Vec<String> = metadata
            .find_all("Tag")
            .iter()
            .map(|t| t.to_string())
            .collect();

        // Unique python/abi pairs, keeping first-seen order.
        let mut pyc_apis: Vec<String> = Vec::new();
        for tag in &in_info_tags {
            let prefix = tag.rsplitn(2, '-').nth(1).unwrap_or(tag).to_string();
            if !pyc_apis.contains(&prefix) {
                pyc_apis.push(prefix);
            }
        }

        let wanted: Vec<String> = pyc_apis
            .iter()
            .flat_map(|prefix| platforms.iter().map(move |p| format!("{}-{}", prefix, p)))
            .collect();
        let unwanted: Vec<String> = pyc_apis
            .iter()
            .flat_map(|prefix| to_remove.iter().map(move |p| format!("{}-{}", prefix, p)))
            .collect();

        let mut updated: Vec<String> = in_info_tags
            .iter()
            .filter(|t| !unwanted.contains(t))
            .cloned()
            .collect();
        for tag in wanted {
            if !updated.contains(&tag) {
                updated.push(tag);
            }
        }

        if updated != in_info_tags {
            metadata.replace_all("Tag", &updated);
            if definitely_not_purelib {
                metadata.set("Root-Is-Purelib", "false");
                info!("changed wheel type to platlib");
            }

            let path = self.root().join(self.dist_info_dir()?).join("WHEEL");
            fs::write(path, metadata.to_bytes())?;
        } else {
            info!("no WHEEL info change needed");
        }

        self.name.platform_tag = fname_tags.join(".");

        Ok(())
    }

    /// Rewrite `.dist-info/RECORD` with fresh digests and lengths.
    ///
    /// Removes any `RECORD.jws` signature, which the rewrite
    /// invalidates.
    pub fn rewrite_record(&self) -> Result<()> {
        let dist_info = self.dist_info_dir()?;
        let record_rel = dist_info.join("RECORD");

        let signature = self.root().join(dist_info.join("RECORD.jws"));
        if signature.exists() {
            fs::remove_file(&signature)?;
        }

        let mut rows = Vec::new();
        for rel in self.files()? {
            if rel == record_rel {
                continue;
            }

            let data = fs::read(self.root().join(&rel))?;
            let mut digest = Sha256::new();
            digest.update(&data);
            let digest =
                base64::encode_config(digest.finalize().as_slice(), base64::URL_SAFE_NO_PAD);

            rows.push(format!(
                "{},sha256={},{}",
                csv_field(&rel.to_string_lossy()),
                digest,
                data.len()
            ));
        }
        rows.push(format!("{},,", csv_field(&record_rel.to_string_lossy())));

        fs::write(self.root().join(&record_rel), rows.join("\n") + "\n")?;

        Ok(())
    }

    /// Write the wheel under its current name into `directory`.
    ///
    /// Timestamps come from `SOURCE_DATE_EPOCH` when set. The archive
    /// is built fully in memory and only lands on disk when complete.
    pub fn write_into_directory(&self, directory: &Path) -> Result<PathBuf> {
        let timestamp = std::env::var("SOURCE_DATE_EPOCH")
            .ok()
            .and_then(|raw| raw.parse::<i64>().ok());
        self.write_into_directory_with_timestamp(directory, timestamp)
    }

    /// As [Self::write_into_directory] with an explicit epoch so tests
    /// can pin the environment.
    pub fn write_into_directory_with_timestamp(
        &self,
        directory: &Path,
        epoch: Option<i64>,
    ) -> Result<PathBuf> {
        let out_path = directory.join(self.name.file_name());

        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        self.write_archive(&mut cursor, epoch)?;
        fs::write(&out_path, cursor.into_inner())?;

        Ok(out_path)
    }

    fn write_archive(&self, writer: &mut (impl Write + Seek), epoch: Option<i64>) -> Result<()> {
        let modified = zip_datetime(epoch);

        // Entries sorted, with the .dist-info/ files last per PEP 427.
        let dist_info = self.dist_info_dir()?;
        let mut files = self.files()?;
        files.sort_by(|a, b| {
            (a.starts_with(&dist_info), a).cmp(&(b.starts_with(&dist_info), b))
        });

        let mut zf = ZipWriter::new(writer);

        for rel in files {
            let full = self.root().join(&rel);
            let mode = fs::metadata(&full)?.permissions().mode() & 0o7777;

            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(mode)
                .last_modified_time(modified);

            // Zip member names always use forward slashes.
            let member = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            zf.start_file(member, options)?;
            zf.write_all(&fs::read(&full)?)?;
        }

        zf.finish()?;

        Ok(())
    }
}

fn zip_datetime(epoch: Option<i64>) -> zip::DateTime {
    if let Some(epoch) = epoch {
        if let Ok(odt) = time::OffsetDateTime::from_unix_timestamp(epoch) {
            if let Ok(dt) = zip::DateTime::from_date_and_time(
                odt.year() as u16,
                odt.month() as u8,
                odt.day(),
                odt.hour(),
                odt.minute(),
                odt.second(),
            ) {
                return dt;
            }
        }
    }

    // Zip's epoch, 1980-01-01.
    zip::DateTime::default()
}

/// Quote a RECORD field the way csv expects when it contains a
/// delimiter or quote.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wheel_name_parse() {
        let name = WheelName::parse("demo-1.0-cp310-cp310-linux_x86_64.whl").unwrap();
        assert_eq!(name.distribution, "demo");
        assert_eq!(name.version, "1.0");
        assert_eq!(name.build, None);
        assert_eq!(name.python_tag, "cp310");
        assert_eq!(name.abi_tag, "cp310");
        assert_eq!(name.platform_tag, "linux_x86_64");
        assert_eq!(name.file_name(), "demo-1.0-cp310-cp310-linux_x86_64.whl");
        assert_eq!(name.name_version(), "demo-1.0");
    }

    #[test]
    fn wheel_name_with_build_tag() {
        let name = WheelName::parse("demo-1.0-2build1-cp310-cp310-linux_x86_64.whl").unwrap();
        assert_eq!(name.build.as_deref(), Some("2build1"));
        assert_eq!(
            name.file_name(),
            "demo-1.0-2build1-cp310-cp310-linux_x86_64.whl"
        );
    }

    #[test]
    fn wheel_name_multiple_platform_tags() {
        let name = WheelName::parse(
            "demo-1.0-cp310-cp310-manylinux1_x86_64.manylinux_2_5_x86_64.whl",
        )
        .unwrap();
        assert_eq!(
            name.platform_tags(),
            vec!["manylinux1_x86_64", "manylinux_2_5_x86_64"]
        );
    }

    #[test]
    fn wheel_name_rejects_garbage() {
        assert!(WheelName::parse("not-a-wheel.zip").is_err());
    }

    #[test]
    fn metadata_round_trip() {
        let text = b"Wheel-Version: 1.0\nGenerator: bdist_wheel\nRoot-Is-Purelib: false\nTag: cp310-cp310-linux_x86_64\n";
        let mut metadata = WheelMetadata::from_bytes(text).unwrap();

        assert_eq!(metadata.find_first("Wheel-Version"), Some("1.0"));
        assert_eq!(
            metadata.find_all("Tag"),
            vec!["cp310-cp310-linux_x86_64"]
        );

        metadata.replace_all(
            "Tag",
            &[
                "cp310-cp310-manylinux_2_17_x86_64".to_string(),
                "cp310-cp310-manylinux2014_x86_64".to_string(),
            ],
        );
        let out = String::from_utf8(metadata.to_bytes()).unwrap();
        assert!(out.contains("Tag: cp310-cp310-manylinux_2_17_x86_64\n"));
        assert!(out.contains("Tag: cp310-cp310-manylinux2014_x86_64\n"));
        assert!(!out.contains("linux_x86_64\nTag: cp310-cp310-linux_x86_64"));
    }

    #[test]
    fn csv_field_quoting() {
        assert_eq!(csv_field("plain/path.py"), "plain/path.py");
        assert_eq!(csv_field("odd,path.py"), "\"odd,path.py\"");
        assert_eq!(csv_field("q\"uote"), "\"q\"\"uote\"");
    }
}
