// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Platform architecture tokens used in policy and tag names. */

use {object::elf, std::fmt};

/// A platform architecture as spelled in policy names and wheel tags.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Architecture {
    Aarch64,
    Armv7l,
    I686,
    Loongarch64,
    Ppc64,
    Ppc64le,
    Riscv64,
    S390x,
    X86_64,
}

impl Architecture {
    /// Map ELF header identity to an architecture token.
    ///
    /// Returns `None` for machine/class/endian combinations no policy
    /// describes.
    pub fn from_elf(machine: u16, class_64: bool, little_endian: bool) -> Option<Self> {
        match (machine, class_64, little_endian) {
            (elf::EM_386, false, true) => Some(Self::I686),
            (elf::EM_X86_64, true, true) => Some(Self::X86_64),
            (elf::EM_AARCH64, true, true) => Some(Self::Aarch64),
            (elf::EM_ARM, false, true) => Some(Self::Armv7l),
            (elf::EM_PPC64, true, true) => Some(Self::Ppc64le),
            (elf::EM_PPC64, true, false) => Some(Self::Ppc64),
            (elf::EM_RISCV, true, true) => Some(Self::Riscv64),
            (elf::EM_S390, true, false) => Some(Self::S390x),
            (elf::EM_LOONGARCH, true, true) => Some(Self::Loongarch64),
            _ => None,
        }
    }

    /// Parse a policy/tag architecture token.
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "aarch64" => Some(Self::Aarch64),
            "armv7l" => Some(Self::Armv7l),
            "i686" => Some(Self::I686),
            "loongarch64" => Some(Self::Loongarch64),
            "ppc64" => Some(Self::Ppc64),
            "ppc64le" => Some(Self::Ppc64le),
            "riscv64" => Some(Self::Riscv64),
            "s390x" => Some(Self::S390x),
            "x86_64" => Some(Self::X86_64),
            _ => None,
        }
    }

    /// The token as it appears in policy names and platform tags.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::Armv7l => "armv7l",
            Self::I686 => "i686",
            Self::Loongarch64 => "loongarch64",
            Self::Ppc64 => "ppc64",
            Self::Ppc64le => "ppc64le",
            Self::Riscv64 => "riscv64",
            Self::S390x => "s390x",
            Self::X86_64 => "x86_64",
        }
    }

    /// Whether binaries for this architecture are 64-bit.
    ///
    /// Decides whether the `lib64` variants of the trusted directories
    /// participate in library search and what `$LIB` expands to.
    pub fn is_64bit(&self) -> bool {
        !matches!(self, Self::Armv7l | Self::I686)
    }

    /// The `$LIB` dynamic string token expansion for this architecture.
    pub fn lib_token(&self) -> &'static str {
        if self.is_64bit() {
            "lib64"
        } else {
            "lib"
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_machine_mapping() {
        assert_eq!(
            Architecture::from_elf(elf::EM_X86_64, true, true),
            Some(Architecture::X86_64)
        );
        assert_eq!(
            Architecture::from_elf(elf::EM_386, false, true),
            Some(Architecture::I686)
        );
        assert_eq!(
            Architecture::from_elf(elf::EM_S390, true, false),
            Some(Architecture::S390x)
        );
        // Big-endian x86-64 is not a thing.
        assert_eq!(Architecture::from_elf(elf::EM_X86_64, true, false), None);
    }

    #[test]
    fn token_round_trip() {
        for arch in [
            Architecture::Aarch64,
            Architecture::Armv7l,
            Architecture::I686,
            Architecture::Ppc64le,
            Architecture::X86_64,
        ] {
            assert_eq!(Architecture::from_token(arch.token()), Some(arch));
        }
        assert_eq!(Architecture::from_token("sparc64"), None);
    }

    #[test]
    fn lib_token() {
        assert_eq!(Architecture::X86_64.lib_token(), "lib64");
        assert_eq!(Architecture::I686.lib_token(), "lib");
        assert_eq!(Architecture::Armv7l.lib_token(), "lib");
    }
}
