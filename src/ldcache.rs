// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `/etc/ld.so.cache` parsing.

The cache written by `ldconfig` maps library names to the paths the
dynamic loader would pick from the trusted directories. Only the "new"
format (`glibc-ld.so.cache1.1`) is parsed; when a cache file carries an
old-format prefix, the embedded new-format section is located by its
magic and parsed from there.
*/

use {
    crate::error::{AuditError, Result},
    byteorder::{NativeEndian, ReadBytesExt},
    log::debug,
    std::{io::Cursor, path::Path},
};

const CACHE_MAGIC_NEW: &[u8] = b"glibc-ld.so.cache1.1";

/// Size of the new-format header: magic, nlibs, len_strings, flags,
/// padding, extension offset, unused.
const HEADER_SIZE: usize = CACHE_MAGIC_NEW.len() + 4 + 4 + 1 + 3 + 4 + 12;

/// Size of one new-format file entry: flags, key, value, osversion,
/// hwcap.
const ENTRY_SIZE: usize = 4 + 4 + 4 + 4 + 8;

/// One cache entry: a library name and the path `ldconfig` recorded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheEntry {
    pub name: String,
    pub path: String,
}

/// Parsed contents of an `ld.so.cache` file.
#[derive(Clone, Debug, Default)]
pub struct LdsoCache {
    entries: Vec<CacheEntry>,
}

impl LdsoCache {
    /// Construct a cache from already-known entries.
    pub fn from_entries(entries: Vec<CacheEntry>) -> Self {
        Self { entries }
    }

    /// Parse a cache file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
            .map_err(|e| AuditError::LdsoCache(format!("{}: {}", path.display(), e)))
    }

    /// Load the system cache, tolerating absence and damage.
    pub fn load_default() -> Self {
        let path = Path::new("/etc/ld.so.cache");
        match Self::load(path) {
            Ok(cache) => cache,
            Err(e) => {
                debug!("ignoring ld.so.cache: {}", e);
                Self::default()
            }
        }
    }

    fn parse(data: &[u8]) -> std::result::Result<Self, String> {
        // An old-format cache may prefix the file; the new-format
        // section is self-contained starting at its magic.
        let start = find_subslice(data, CACHE_MAGIC_NEW)
            .ok_or_else(|| "no new-format cache header found".to_string())?;
        let cache = &data[start..];

        if cache.len() < HEADER_SIZE {
            return Err("truncated cache header".to_string());
        }

        let mut reader = Cursor::new(&cache[CACHE_MAGIC_NEW.len()..]);
        let nlibs = reader
            .read_u32::<NativeEndian>()
            .map_err(|e| e.to_string())? as usize;

        let entries_end = HEADER_SIZE + nlibs * ENTRY_SIZE;
        if cache.len() < entries_end {
            return Err(format!("cache claims {} entries but is truncated", nlibs));
        }

        let mut entries = Vec::with_capacity(nlibs);
        let mut reader = Cursor::new(&cache[HEADER_SIZE..entries_end]);

        for _ in 0..nlibs {
            let _flags = reader.read_i32::<NativeEndian>().map_err(|e| e.to_string())?;
            let key = reader.read_u32::<NativeEndian>().map_err(|e| e.to_string())? as usize;
            let value = reader.read_u32::<NativeEndian>().map_err(|e| e.to_string())? as usize;
            let _osversion = reader.read_u32::<NativeEndian>().map_err(|e| e.to_string())?;
            let _hwcap = reader.read_u64::<NativeEndian>().map_err(|e| e.to_string())?;

            let name = read_string(cache, key)?;
            let path = read_string(cache, value)?;
            entries.push(CacheEntry { name, path });
        }

        Ok(Self { entries })
    }

    /// Paths recorded for `name`, in cache order.
    ///
    /// The loader's hwcap preferences are not replicated; callers vet
    /// each candidate against the dependent's ELF identity instead.
    pub fn find<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |e| e.name == name)
            .map(|e| e.path.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn read_string(cache: &[u8], offset: usize) -> std::result::Result<String, String> {
    let tail = cache
        .get(offset..)
        .ok_or_else(|| format!("string offset {} out of bounds", offset))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| "unterminated string in cache".to_string())?;

    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}
