//! Thin wrappers around the ELF section attributes that the fold pass cares about.

/// Section flag bit values.
#[allow(unused)]
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_WRITE);
    pub const ALLOC: SectionFlags = SectionFlags::from_u32(object::elf::SHF_ALLOC);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXECINSTR);
    pub const MERGE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_MERGE);
    pub const STRINGS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_STRINGS);
    pub const GROUP: SectionFlags = SectionFlags::from_u32(object::elf::SHF_GROUP);
    pub const TLS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_TLS);
}

/// Section type values.
#[allow(unused)]
pub mod sht {
    use super::SectionType;

    pub const NULL: SectionType = SectionType::from_u32(object::elf::SHT_NULL);
    pub const PROGBITS: SectionType = SectionType::from_u32(object::elf::SHT_PROGBITS);
    pub const NOBITS: SectionType = SectionType::from_u32(object::elf::SHT_NOBITS);
    pub const INIT_ARRAY: SectionType = SectionType::from_u32(object::elf::SHT_INIT_ARRAY);
    pub const FINI_ARRAY: SectionType = SectionType::from_u32(object::elf::SHT_FINI_ARRAY);
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectionFlags(u32);

impl SectionFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_u32(raw: u32) -> SectionFlags {
        SectionFlags(raw)
    }

    pub fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    /// Returns self with the specified flags set.
    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }

    pub const fn raw(self) -> u64 {
        self.0 as u64
    }
}

impl From<u64> for SectionFlags {
    fn from(value: u64) -> Self {
        Self(value as u32)
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contains(shf::WRITE) {
            f.write_str("W")?;
        }
        if self.contains(shf::ALLOC) {
            f.write_str("A")?;
        }
        if self.contains(shf::EXECINSTR) {
            f.write_str("X")?;
        }
        if self.contains(shf::MERGE) {
            f.write_str("M")?;
        }
        if self.contains(shf::STRINGS) {
            f.write_str("S")?;
        }
        if self.contains(shf::GROUP) {
            f.write_str("G")?;
        }
        if self.contains(shf::TLS) {
            f.write_str("T")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SectionType(u32);

impl SectionType {
    pub const fn from_u32(raw: u32) -> SectionType {
        SectionType(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Returns whether `name` is a valid C identifier. Sections with such names can be enumerated
/// from program code via linker-generated `__start_*` / `__stop_*` symbols, so their addresses
/// are observable and they must not be folded.
pub fn is_c_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();

    let Some(first) = bytes.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return false;
    }

    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_c_identifier() {
        assert!(is_c_identifier("foo"));
        assert!(is_c_identifier("_bss_start"));
        assert!(is_c_identifier("tracepoints2"));
        assert!(!is_c_identifier(""));
        assert!(!is_c_identifier(".text"));
        assert!(!is_c_identifier(".text.foo"));
        assert!(!is_c_identifier("2fast"));
        assert!(!is_c_identifier("has-dash"));
    }

    #[test]
    fn test_flags_display() {
        let flags = shf::ALLOC.with(shf::EXECINSTR);
        assert_eq!(flags.to_string(), "AX");
        assert!(flags.contains(shf::ALLOC));
        assert!(!flags.contains(shf::WRITE));
    }
}
