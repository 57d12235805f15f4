// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! ELF inspection.

Parses a shared object or executable and extracts the dynamic linking
facts the auditor cares about: needed libraries, soname, search paths,
interpreter, and versioned symbol requirements. Parsing seeks to the
offsets it needs through a [ReadCache]; files are never modified and
never read in full.
*/

use {
    crate::{
        arch::Architecture,
        error::{AuditError, Result},
    },
    object::{
        elf,
        read::{
            elf::{Dyn, FileHeader, ProgramHeader, SectionHeader, Sym},
            ReadCache, ReadRef, SectionIndex,
        },
        Endian, Endianness,
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        fs::File,
        io::Read,
        path::{Path, PathBuf},
    },
};

/// Byte offsets of `e_ident` fields, per the ELF spec. Not exported by
/// the `object` crate as named constants.
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_OSABI: usize = 7;

/// Flavor of libc a binary was linked against.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Libc {
    Glibc,
    Musl,
}

/// ELF identity fields relevant to load compatibility.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ElfIdent {
    pub class_64: bool,
    pub little_endian: bool,
    pub os_abi: u8,
    pub machine: u16,
}

impl ElfIdent {
    /// Whether a library with this identity can satisfy a dependency of
    /// `other`.
    ///
    /// OS ABIs `NONE`, `SYSV` and `GNU` are mutually compatible; class,
    /// endianness and machine must match exactly.
    pub fn is_compatible(&self, other: &ElfIdent) -> bool {
        let abi_ok = self.os_abi == other.os_abi
            || (matches!(self.os_abi, elf::ELFOSABI_NONE | elf::ELFOSABI_GNU)
                && matches!(other.os_abi, elf::ELFOSABI_NONE | elf::ELFOSABI_GNU));

        abi_ok
            && self.class_64 == other.class_64
            && self.little_endian == other.little_endian
            && self.machine == other.machine
    }
}

/// Dynamic linking facts extracted from one ELF file.
///
/// Instances are immutable records; nothing here writes back to the
/// file.
#[derive(Clone, Debug)]
pub struct ElfFile {
    /// Absolute path the file was parsed from.
    pub path: PathBuf,

    pub ident: ElfIdent,

    /// `PT_INTERP` contents, when present.
    pub interpreter: Option<String>,

    /// `DT_SONAME`, when present.
    pub soname: Option<String>,

    /// `DT_NEEDED` entries in file order.
    pub needed: Vec<String>,

    /// `DT_RPATH` entries, colon-split, as stored.
    pub rpaths: Vec<String>,

    /// `DT_RUNPATH` entries, colon-split, as stored.
    pub runpaths: Vec<String>,

    /// Versioned symbol requirements: library soname to version tokens,
    /// from `.gnu.version_r`. Dynamic loader entries are dropped.
    pub versioned_symbols: BTreeMap<String, BTreeSet<String>>,

    /// Version names this object defines (`.gnu.version_d`).
    pub version_definitions: BTreeSet<String>,

    /// Names of undefined dynamic symbols.
    pub undefined_symbols: BTreeSet<String>,

    /// Libc flavor inferred from the interpreter and needed libraries.
    pub libc: Option<Libc>,
}

impl ElfFile {
    /// Parse the ELF file at `path`.
    ///
    /// Fails with [AuditError::NotElf] when the magic bytes mismatch and
    /// [AuditError::MalformedElf] when structures are truncated or
    /// inconsistent.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let cache = ReadCache::new(file);

        let ident = (&cache)
            .read_bytes_at(0, 16)
            .map_err(|_| AuditError::NotElf(path.display().to_string()))?;

        if ident.len() < 16 || ident[0..4] != elf::ELFMAG {
            return Err(AuditError::NotElf(path.display().to_string()));
        }

        match ident[EI_CLASS] {
            elf::ELFCLASS32 => inspect::<elf::FileHeader32<Endianness>, _>(path, &cache),
            elf::ELFCLASS64 => inspect::<elf::FileHeader64<Endianness>, _>(path, &cache),
            other => Err(AuditError::MalformedElf(
                path.display().to_string(),
                format!("unknown ELF class {}", other),
            )),
        }
    }

    /// The policy architecture token for this file.
    ///
    /// Fails with [AuditError::UnsupportedElf] when no policy
    /// architecture describes the machine/class/endianness combination.
    pub fn arch(&self) -> Result<Architecture> {
        Architecture::from_elf(
            self.ident.machine,
            self.ident.class_64,
            self.ident.little_endian,
        )
        .ok_or_else(|| AuditError::UnsupportedElf(self.path.display().to_string()))
    }

    /// The soname identifying this object: `DT_SONAME` when present,
    /// else the file name.
    pub fn soname_or_filename(&self) -> String {
        self.soname.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// Read just enough of a file to learn its ELF identity.
///
/// Returns `Ok(None)` when the file is not ELF. Used to vet library
/// candidates during search without a full parse.
pub fn read_ident(path: &Path) -> Result<Option<ElfIdent>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };

    let mut buf = [0u8; 20];
    if file.read_exact(&mut buf).is_err() {
        return Ok(None);
    }

    if buf[0..4] != elf::ELFMAG {
        return Ok(None);
    }

    let class_64 = match buf[EI_CLASS] {
        elf::ELFCLASS32 => false,
        elf::ELFCLASS64 => true,
        _ => return Ok(None),
    };
    let little_endian = match buf[EI_DATA] {
        elf::ELFDATA2LSB => true,
        elf::ELFDATA2MSB => false,
        _ => return Ok(None),
    };

    // e_machine lives at offset 18 in both ELF classes.
    let machine = if little_endian {
        u16::from_le_bytes([buf[18], buf[19]])
    } else {
        u16::from_be_bytes([buf[18], buf[19]])
    };

    Ok(Some(ElfIdent {
        class_64,
        little_endian,
        os_abi: buf[EI_OSABI],
        machine,
    }))
}

/// Whether a file starts with the ELF magic bytes.
pub fn has_elf_magic(path: &Path) -> bool {
    let mut buf = [0u8; 4];
    match File::open(path) {
        Ok(mut f) => f.read_exact(&mut buf).is_ok() && buf == elf::ELFMAG,
        Err(_) => false,
    }
}

/// Version requirements on the dynamic loader itself are not symbol
/// demands the archive places on the platform; drop them the way the
/// policy check expects.
fn is_dynamic_loader(soname: &str) -> bool {
    soname.starts_with("ld-linux") || soname == "ld64.so.2" || soname == "ld64.so.1"
}

fn inspect<'data, Elf, R>(path: &Path, data: R) -> Result<ElfFile>
where
    Elf: FileHeader<Endian = Endianness>,
    R: ReadRef<'data>,
{
    let display = path.display().to_string();
    let m = |e: object::read::Error| AuditError::MalformedElf(display.clone(), e.to_string());

    let header = Elf::parse(data).map_err(m)?;
    let endian = header.endian().map_err(m)?;

    let ident = ElfIdent {
        class_64: header.is_class_64(),
        little_endian: endian.is_little_endian(),
        os_abi: header.e_ident().os_abi,
        machine: header.e_machine(endian),
    };

    let mut interpreter = None;
    for segment in header.program_headers(endian, data).map_err(m)? {
        if segment.p_type(endian) != elf::PT_INTERP {
            continue;
        }
        let raw = segment.data(endian, data).map_err(|_| {
            AuditError::MalformedElf(display.clone(), "PT_INTERP outside file".to_string())
        })?;
        let raw = match raw.iter().position(|&b| b == 0) {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        interpreter = Some(String::from_utf8_lossy(raw).into_owned());
        break;
    }

    let sections = header.sections(endian, data).map_err(m)?;

    let mut soname = None;
    let mut needed = Vec::new();
    let mut rpaths = Vec::new();
    let mut runpaths = Vec::new();
    let mut undefined_symbols = BTreeSet::new();

    for (section_index, section) in sections.iter().enumerate() {
        if let Some((entries, strings_index)) = section.dynamic(endian, data).map_err(m)? {
            let strings = sections
                .strings(endian, data, strings_index)
                .unwrap_or_default();

            let dyn_string = |entry: &<Elf as FileHeader>::Dyn| -> Result<&'data [u8]> {
                entry
                    .val32(endian)
                    .and_then(|val| strings.get(val).ok())
                    .ok_or_else(|| {
                        AuditError::MalformedElf(
                            display.clone(),
                            "Invalid ELF dyn string".to_string(),
                        )
                    })
            };

            for entry in entries {
                match entry.tag32(endian) {
                    Some(elf::DT_NEEDED) => {
                        let value = dyn_string(entry)?;
                        needed.push(String::from_utf8_lossy(value).into_owned());
                    }
                    Some(elf::DT_SONAME) => {
                        let value = dyn_string(entry)?;
                        soname = Some(String::from_utf8_lossy(value).into_owned());
                    }
                    Some(elf::DT_RPATH) => {
                        let value = dyn_string(entry)?;
                        rpaths = split_search_path(&String::from_utf8_lossy(value));
                    }
                    Some(elf::DT_RUNPATH) => {
                        let value = dyn_string(entry)?;
                        runpaths = split_search_path(&String::from_utf8_lossy(value));
                    }
                    _ => {}
                }
            }
        }

        if section.sh_type(endian) == elf::SHT_DYNSYM {
            if let Some(symbols) = section
                .symbols(endian, data, &sections, SectionIndex(section_index))
                .map_err(m)?
            {
                let strings = symbols.strings();
                for sym in symbols.iter() {
                    if !sym.is_undefined(endian) {
                        continue;
                    }
                    let name = sym.name(endian, strings).map_err(m)?;
                    if !name.is_empty() {
                        undefined_symbols.insert(String::from_utf8_lossy(name).into_owned());
                    }
                }
            }
        }
    }

    let mut versioned_symbols: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    if let Some((mut verneeds, strings_index)) = sections.gnu_verneed(endian, data).map_err(m)? {
        let strings = sections
            .strings(endian, data, strings_index)
            .unwrap_or_default();

        while let Some((verneed, mut vernauxes)) = verneeds.next().map_err(m)? {
            let file =
                String::from_utf8_lossy(verneed.file(endian, strings).map_err(m)?).into_owned();

            if is_dynamic_loader(&file) {
                continue;
            }

            while let Some(vernaux) = vernauxes.next().map_err(m)? {
                let version =
                    String::from_utf8_lossy(vernaux.name(endian, strings).map_err(m)?).into_owned();
                versioned_symbols
                    .entry(file.clone())
                    .or_default()
                    .insert(version);
            }
        }
    }

    let mut version_definitions = BTreeSet::new();
    if let Some((mut verdefs, strings_index)) = sections.gnu_verdef(endian, data).map_err(m)? {
        let strings = sections
            .strings(endian, data, strings_index)
            .unwrap_or_default();

        while let Some((_, mut verdauxes)) = verdefs.next().map_err(m)? {
            if let Some(verdaux) = verdauxes.next().map_err(m)? {
                let name =
                    String::from_utf8_lossy(verdaux.name(endian, strings).map_err(m)?).into_owned();
                version_definitions.insert(name);
            }
        }
    }

    let libc = infer_libc(interpreter.as_deref(), &needed);

    Ok(ElfFile {
        path: path.to_path_buf(),
        ident,
        interpreter,
        soname,
        needed,
        rpaths,
        runpaths,
        versioned_symbols,
        version_definitions,
        undefined_symbols,
        libc,
    })
}

/// Split a `DT_RPATH`/`DT_RUNPATH` value into entries, preserving their
/// stored spelling. Empty entries are meaningful to the loader (they
/// mean the working directory) and are kept.
fn split_search_path(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(':').map(|s| s.to_string()).collect()
}

fn infer_libc(interpreter: Option<&str>, needed: &[String]) -> Option<Libc> {
    if let Some(interp) = interpreter {
        let base = Path::new(interp)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if base.starts_with("ld-musl-") {
            return Some(Libc::Musl);
        }
        if base.starts_with("ld-linux") || base.starts_with("ld64.so") || base == "ld.so.1" {
            return Some(Libc::Glibc);
        }
    }

    for soname in needed {
        if soname.starts_with("libc.musl-") || soname.starts_with("ld-musl-") {
            return Some(Libc::Musl);
        }
        if soname == "libc.so.6" || soname.starts_with("ld-linux-") || soname.starts_with("ld64.so.")
        {
            return Some(Libc::Glibc);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::ElfFixture};

    #[test]
    fn not_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, b"definitely not an object file").unwrap();

        assert!(matches!(
            ElfFile::open(&path),
            Err(AuditError::NotElf(_))
        ));
        assert!(!has_elf_magic(&path));
        assert!(read_ident(&path).unwrap().is_none());
    }

    #[test]
    fn inspect_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libdemo.so.1.2.3");

        let fixture = ElfFixture::new(elf::EM_X86_64)
            .soname("libdemo.so.1")
            .interpreter("/lib64/ld-linux-x86-64.so.2")
            .needed("libc.so.6")
            .needed("libfoo.so.1")
            .runpath("$ORIGIN/../lib:/opt/build/lib")
            .verneed("libc.so.6", &["GLIBC_2.2.5", "GLIBC_2.17"])
            .verneed("ld-linux-x86-64.so.2", &["GLIBC_2.3"])
            .undefined("memcpy")
            .undefined("deflate");
        std::fs::write(&path, fixture.build()).unwrap();

        let elf_file = ElfFile::open(&path).unwrap();
        assert_eq!(elf_file.soname.as_deref(), Some("libdemo.so.1"));
        assert_eq!(elf_file.soname_or_filename(), "libdemo.so.1");
        assert_eq!(elf_file.needed, vec!["libc.so.6", "libfoo.so.1"]);
        assert_eq!(
            elf_file.runpaths,
            vec!["$ORIGIN/../lib".to_string(), "/opt/build/lib".to_string()]
        );
        assert!(elf_file.rpaths.is_empty());
        assert_eq!(
            elf_file.interpreter.as_deref(),
            Some("/lib64/ld-linux-x86-64.so.2")
        );
        assert_eq!(elf_file.libc, Some(Libc::Glibc));
        assert_eq!(elf_file.arch().unwrap(), Architecture::X86_64);

        let libc_versions = elf_file.versioned_symbols.get("libc.so.6").unwrap();
        assert!(libc_versions.contains("GLIBC_2.2.5"));
        assert!(libc_versions.contains("GLIBC_2.17"));
        // Loader version requirements are dropped.
        assert!(!elf_file
            .versioned_symbols
            .contains_key("ld-linux-x86-64.so.2"));

        assert!(elf_file.undefined_symbols.contains("memcpy"));
        assert!(elf_file.undefined_symbols.contains("deflate"));
    }

    #[test]
    fn unsupported_machine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libodd.so");

        // EM_SPARCV9 is real ELF but matches no policy architecture.
        let fixture = ElfFixture::new(elf::EM_SPARCV9).soname("libodd.so");
        std::fs::write(&path, fixture.build()).unwrap();

        let elf_file = ElfFile::open(&path).unwrap();
        assert!(matches!(
            elf_file.arch(),
            Err(AuditError::UnsupportedElf(_))
        ));
    }

    #[test]
    fn ident_compatibility() {
        let a = ElfIdent {
            class_64: true,
            little_endian: true,
            os_abi: elf::ELFOSABI_NONE,
            machine: elf::EM_X86_64,
        };
        let gnu = ElfIdent {
            os_abi: elf::ELFOSABI_GNU,
            ..a
        };
        let i386 = ElfIdent {
            class_64: false,
            machine: elf::EM_386,
            ..a
        };

        assert!(a.is_compatible(&gnu));
        assert!(!a.is_compatible(&i386));
    }
}
