// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Test support code.

Builders for minimal synthetic ELF shared objects and wheel archives,
so inspector, resolver, graph and wheel tests run against real bytes
without needing a compiler toolchain.
*/

use {
    byteorder::{LittleEndian, WriteBytesExt},
    object::elf,
    std::{
        collections::HashMap,
        io::Write,
        path::{Path, PathBuf},
    },
};

const EHSIZE: usize = 64;
const PHENTSIZE: usize = 56;
const SHENTSIZE: usize = 64;
const SYM_SIZE: usize = 24;
const DYN_SIZE: usize = 16;
const VERNEED_SIZE: usize = 16;
const VERNAUX_SIZE: usize = 16;

/// Builds a minimal little-endian ELF64 shared object exposing the
/// dynamic-linking records the auditor reads: `DT_NEEDED`, `DT_SONAME`,
/// `DT_RPATH`/`DT_RUNPATH`, `PT_INTERP`, `.gnu.version_r`, and
/// undefined dynamic symbols.
#[derive(Clone, Debug, Default)]
pub struct ElfFixture {
    machine: u16,
    soname: Option<String>,
    needed: Vec<String>,
    runpath: Option<String>,
    rpath: Option<String>,
    interpreter: Option<String>,
    verneed: Vec<(String, Vec<String>)>,
    undefined: Vec<String>,
}

impl ElfFixture {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            ..Self::default()
        }
    }

    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_string());
        self
    }

    pub fn needed(mut self, soname: &str) -> Self {
        self.needed.push(soname.to_string());
        self
    }

    pub fn runpath(mut self, runpath: &str) -> Self {
        self.runpath = Some(runpath.to_string());
        self
    }

    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpath = Some(rpath.to_string());
        self
    }

    pub fn interpreter(mut self, interpreter: &str) -> Self {
        self.interpreter = Some(interpreter.to_string());
        self
    }

    /// Declare a version requirement on `library` for the given
    /// version tokens, as `.gnu.version_r` records it.
    pub fn verneed(mut self, library: &str, versions: &[&str]) -> Self {
        self.verneed.push((
            library.to_string(),
            versions.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    /// Add an undefined dynamic symbol.
    pub fn undefined(mut self, name: &str) -> Self {
        self.undefined.push(name.to_string());
        self
    }

    /// Produce the file bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut dynstr = vec![0u8];
        let mut interned: HashMap<String, u32> = HashMap::new();

        let mut intern = |table: &mut Vec<u8>, map: &mut HashMap<String, u32>, s: &str| -> u32 {
            if let Some(offset) = map.get(s) {
                return *offset;
            }
            let offset = table.len() as u32;
            table.extend_from_slice(s.as_bytes());
            table.push(0);
            map.insert(s.to_string(), offset);
            offset
        };

        // Intern every string the tables reference, in a stable order.
        let needed_offsets: Vec<u32> = self
            .needed
            .iter()
            .map(|s| intern(&mut dynstr, &mut interned, s))
            .collect();
        let soname_offset = self
            .soname
            .as_ref()
            .map(|s| intern(&mut dynstr, &mut interned, s));
        let runpath_offset = self
            .runpath
            .as_ref()
            .map(|s| intern(&mut dynstr, &mut interned, s));
        let rpath_offset = self
            .rpath
            .as_ref()
            .map(|s| intern(&mut dynstr, &mut interned, s));
        let verneed_offsets: Vec<(u32, Vec<u32>)> = self
            .verneed
            .iter()
            .map(|(file, versions)| {
                (
                    intern(&mut dynstr, &mut interned, file),
                    versions
                        .iter()
                        .map(|v| intern(&mut dynstr, &mut interned, v))
                        .collect(),
                )
            })
            .collect();
        let undefined_offsets: Vec<u32> = self
            .undefined
            .iter()
            .map(|s| intern(&mut dynstr, &mut interned, s))
            .collect();

        // .dynsym: null entry plus one undefined import per name.
        let mut dynsym = vec![0u8; SYM_SIZE];
        for offset in &undefined_offsets {
            dynsym.write_u32::<LittleEndian>(*offset).unwrap();
            dynsym.push((elf::STB_GLOBAL << 4) | elf::STT_FUNC); // st_info
            dynsym.push(0); // st_other
            dynsym.write_u16::<LittleEndian>(0).unwrap(); // st_shndx = SHN_UNDEF
            dynsym.write_u64::<LittleEndian>(0).unwrap(); // st_value
            dynsym.write_u64::<LittleEndian>(0).unwrap(); // st_size
        }

        // .gnu.version_r
        let mut verneed = Vec::new();
        let mut next_other: u16 = 2;
        for (index, (file_offset, version_offsets)) in verneed_offsets.iter().enumerate() {
            let is_last_record = index + 1 == verneed_offsets.len();
            let record_size = VERNEED_SIZE + version_offsets.len() * VERNAUX_SIZE;

            verneed.write_u16::<LittleEndian>(1).unwrap(); // vn_version
            verneed
                .write_u16::<LittleEndian>(version_offsets.len() as u16)
                .unwrap(); // vn_cnt
            verneed.write_u32::<LittleEndian>(*file_offset).unwrap(); // vn_file
            verneed.write_u32::<LittleEndian>(VERNEED_SIZE as u32).unwrap(); // vn_aux
            verneed
                .write_u32::<LittleEndian>(if is_last_record {
                    0
                } else {
                    record_size as u32
                })
                .unwrap(); // vn_next

            for (aux_index, version_offset) in version_offsets.iter().enumerate() {
                let is_last_aux = aux_index + 1 == version_offsets.len();
                verneed.write_u32::<LittleEndian>(0).unwrap(); // vna_hash
                verneed.write_u16::<LittleEndian>(0).unwrap(); // vna_flags
                verneed.write_u16::<LittleEndian>(next_other).unwrap(); // vna_other
                next_other += 1;
                verneed.write_u32::<LittleEndian>(*version_offset).unwrap(); // vna_name
                verneed
                    .write_u32::<LittleEndian>(if is_last_aux { 0 } else { VERNAUX_SIZE as u32 })
                    .unwrap(); // vna_next
            }
        }

        // .dynamic
        let mut dynamic = Vec::new();
        let mut dyn_entry = |table: &mut Vec<u8>, tag: u64, value: u64| {
            table.write_u64::<LittleEndian>(tag).unwrap();
            table.write_u64::<LittleEndian>(value).unwrap();
        };
        for offset in &needed_offsets {
            dyn_entry(&mut dynamic, elf::DT_NEEDED as u64, *offset as u64);
        }
        if let Some(offset) = soname_offset {
            dyn_entry(&mut dynamic, elf::DT_SONAME as u64, offset as u64);
        }
        if let Some(offset) = rpath_offset {
            dyn_entry(&mut dynamic, elf::DT_RPATH as u64, offset as u64);
        }
        if let Some(offset) = runpath_offset {
            dyn_entry(&mut dynamic, elf::DT_RUNPATH as u64, offset as u64);
        }
        dyn_entry(&mut dynamic, elf::DT_NULL as u64, 0);

        // .shstrtab
        let mut shstrtab = vec![0u8];
        let mut shstr_interned = HashMap::new();
        let dynstr_name = intern(&mut shstrtab, &mut shstr_interned, ".dynstr");
        let dynsym_name = intern(&mut shstrtab, &mut shstr_interned, ".dynsym");
        let verneed_name = intern(&mut shstrtab, &mut shstr_interned, ".gnu.version_r");
        let dynamic_name = intern(&mut shstrtab, &mut shstr_interned, ".dynamic");
        let shstrtab_name = intern(&mut shstrtab, &mut shstr_interned, ".shstrtab");

        // File layout.
        let has_verneed = !verneed.is_empty();
        let phnum = usize::from(self.interpreter.is_some());

        let mut offset = EHSIZE + phnum * PHENTSIZE;
        let interp_offset = offset;
        let interp_bytes = self
            .interpreter
            .as_ref()
            .map(|s| {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            })
            .unwrap_or_default();
        offset += interp_bytes.len();

        let dynstr_offset = align_to(offset, 8);
        offset = dynstr_offset + dynstr.len();
        let dynsym_offset = align_to(offset, 8);
        offset = dynsym_offset + dynsym.len();
        let verneed_offset = align_to(offset, 8);
        offset = verneed_offset + verneed.len();
        let dynamic_offset = align_to(offset, 8);
        offset = dynamic_offset + dynamic.len();
        let shstrtab_offset = offset;
        offset += shstrtab.len();
        let shoff = align_to(offset, 8);

        // Section header descriptors:
        // (name, type, flags, offset, size, link, info, align, entsize)
        let mut sections: Vec<(u32, u32, u64, usize, usize, u32, u32, u64, u64)> = Vec::new();
        sections.push((0, elf::SHT_NULL, 0, 0, 0, 0, 0, 0, 0));
        let dynstr_index = sections.len() as u32;
        sections.push((
            dynstr_name,
            elf::SHT_STRTAB,
            elf::SHF_ALLOC as u64,
            dynstr_offset,
            dynstr.len(),
            0,
            0,
            1,
            0,
        ));
        sections.push((
            dynsym_name,
            elf::SHT_DYNSYM,
            elf::SHF_ALLOC as u64,
            dynsym_offset,
            dynsym.len(),
            dynstr_index,
            1,
            8,
            SYM_SIZE as u64,
        ));
        if has_verneed {
            sections.push((
                verneed_name,
                elf::SHT_GNU_VERNEED,
                elf::SHF_ALLOC as u64,
                verneed_offset,
                verneed.len(),
                dynstr_index,
                self.verneed.len() as u32,
                4,
                0,
            ));
        }
        sections.push((
            dynamic_name,
            elf::SHT_DYNAMIC,
            (elf::SHF_ALLOC | elf::SHF_WRITE) as u64,
            dynamic_offset,
            dynamic.len(),
            dynstr_index,
            0,
            8,
            DYN_SIZE as u64,
        ));
        let shstrndx = sections.len() as u16;
        sections.push((
            shstrtab_name,
            elf::SHT_STRTAB,
            0,
            shstrtab_offset,
            shstrtab.len(),
            0,
            0,
            1,
            0,
        ));

        // Emit.
        let mut out = Vec::with_capacity(shoff + sections.len() * SHENTSIZE);

        out.extend_from_slice(&elf::ELFMAG);
        out.push(elf::ELFCLASS64);
        out.push(elf::ELFDATA2LSB);
        out.push(1); // EI_VERSION
        out.push(elf::ELFOSABI_NONE);
        out.extend_from_slice(&[0u8; 8]);
        out.write_u16::<LittleEndian>(elf::ET_DYN).unwrap();
        out.write_u16::<LittleEndian>(self.machine).unwrap();
        out.write_u32::<LittleEndian>(1).unwrap(); // e_version
        out.write_u64::<LittleEndian>(0).unwrap(); // e_entry
        out.write_u64::<LittleEndian>(if phnum > 0 { EHSIZE as u64 } else { 0 })
            .unwrap(); // e_phoff
        out.write_u64::<LittleEndian>(shoff as u64).unwrap(); // e_shoff
        out.write_u32::<LittleEndian>(0).unwrap(); // e_flags
        out.write_u16::<LittleEndian>(EHSIZE as u16).unwrap();
        out.write_u16::<LittleEndian>(PHENTSIZE as u16).unwrap();
        out.write_u16::<LittleEndian>(phnum as u16).unwrap();
        out.write_u16::<LittleEndian>(SHENTSIZE as u16).unwrap();
        out.write_u16::<LittleEndian>(sections.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(shstrndx).unwrap();
        debug_assert_eq!(out.len(), EHSIZE);

        if phnum > 0 {
            out.write_u32::<LittleEndian>(elf::PT_INTERP).unwrap();
            out.write_u32::<LittleEndian>(elf::PF_R).unwrap();
            out.write_u64::<LittleEndian>(interp_offset as u64).unwrap(); // p_offset
            out.write_u64::<LittleEndian>(interp_offset as u64).unwrap(); // p_vaddr
            out.write_u64::<LittleEndian>(interp_offset as u64).unwrap(); // p_paddr
            out.write_u64::<LittleEndian>(interp_bytes.len() as u64).unwrap(); // p_filesz
            out.write_u64::<LittleEndian>(interp_bytes.len() as u64).unwrap(); // p_memsz
            out.write_u64::<LittleEndian>(1).unwrap(); // p_align
        }

        out.extend_from_slice(&interp_bytes);
        pad_to(&mut out, dynstr_offset);
        out.extend_from_slice(&dynstr);
        pad_to(&mut out, dynsym_offset);
        out.extend_from_slice(&dynsym);
        pad_to(&mut out, verneed_offset);
        out.extend_from_slice(&verneed);
        pad_to(&mut out, dynamic_offset);
        out.extend_from_slice(&dynamic);
        out.extend_from_slice(&shstrtab);
        pad_to(&mut out, shoff);

        for (name, sh_type, flags, offset, size, link, info, align, entsize) in sections {
            out.write_u32::<LittleEndian>(name).unwrap();
            out.write_u32::<LittleEndian>(sh_type).unwrap();
            out.write_u64::<LittleEndian>(flags).unwrap();
            out.write_u64::<LittleEndian>(offset as u64).unwrap(); // sh_addr
            out.write_u64::<LittleEndian>(offset as u64).unwrap(); // sh_offset
            out.write_u64::<LittleEndian>(size as u64).unwrap();
            out.write_u32::<LittleEndian>(link).unwrap();
            out.write_u32::<LittleEndian>(info).unwrap();
            out.write_u64::<LittleEndian>(align).unwrap();
            out.write_u64::<LittleEndian>(entsize).unwrap();
        }

        out
    }
}

fn align_to(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

fn pad_to(out: &mut Vec<u8>, offset: usize) {
    assert!(out.len() <= offset, "layout overran computed offset");
    out.resize(offset, 0);
}

/// A file to place in a synthetic wheel.
pub struct WheelEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: u32,
}

impl WheelEntry {
    pub fn new(path: &str, data: Vec<u8>) -> Self {
        Self {
            path: path.to_string(),
            data,
            mode: 0o644,
        }
    }

    pub fn executable(mut self) -> Self {
        self.mode = 0o755;
        self
    }
}

/// Write a synthetic wheel named `basename` into `dir`.
///
/// A `.dist-info` directory with `WHEEL`, `METADATA` and `RECORD`
/// files derived from the basename is added automatically.
pub fn build_wheel(dir: &Path, basename: &str, entries: Vec<WheelEntry>) -> PathBuf {
    let name = crate::wheel::WheelName::parse(basename).expect("valid wheel basename");
    let dist_info = format!("{}.dist-info", name.name_version());

    let wheel_file = {
        let mut text = String::from("Wheel-Version: 1.0\nGenerator: bdist_wheel (0.37.1)\n");
        text.push_str(&format!(
            "Root-Is-Purelib: {}\n",
            name.platform_tag == "any"
        ));
        for plat in name.platform_tags() {
            text.push_str(&format!(
                "Tag: {}-{}-{}\n",
                name.python_tag, name.abi_tag, plat
            ));
        }
        text
    };
    let metadata_file = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
        name.distribution, name.version
    );

    let mut all = entries;
    all.push(WheelEntry::new(
        &format!("{}/WHEEL", dist_info),
        wheel_file.into_bytes(),
    ));
    all.push(WheelEntry::new(
        &format!("{}/METADATA", dist_info),
        metadata_file.into_bytes(),
    ));
    all.push(WheelEntry::new(&format!("{}/RECORD", dist_info), Vec::new()));

    let path = dir.join(basename);
    let file = std::fs::File::create(&path).expect("create wheel file");
    let mut zf = zip::ZipWriter::new(file);

    for entry in all {
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(entry.mode);
        zf.start_file(entry.path, options).expect("start zip member");
        zf.write_all(&entry.data).expect("write zip member");
    }
    zf.finish().expect("finish wheel zip");

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_is_parseable_by_object() {
        use object::read::elf::FileHeader as _;

        let data = ElfFixture::new(elf::EM_X86_64)
            .soname("libdemo.so.1")
            .needed("libc.so.6")
            .verneed("libc.so.6", &["GLIBC_2.17"])
            .undefined("memcpy")
            .build();

        let parsed = elf::FileHeader64::<object::Endianness>::parse(&*data).unwrap();
        let endian = parsed.endian().unwrap();
        assert_eq!(parsed.e_machine.get(endian), elf::EM_X86_64);
    }
}
