/// Which part of the reservation a blob is placed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Resident,
    Cold,
}

/// Entry points declared in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    Init,
    Api,
    Isr,
    Unload,
}

impl Entry {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Entry::Init => "@init",
            Entry::Api => "@api",
            Entry::Isr => "@isr",
            Entry::Unload => "@unload",
        }
    }

    pub(crate) fn header_offset(self) -> usize {
        match self {
            Entry::Init => 0x10,
            Entry::Api => 0x12,
            Entry::Isr => 0x14,
            Entry::Unload => 0x16,
        }
    }
}

/// Relocation type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    SegOfs,
    Segment,
    Offset,
    RelNear,
    RelFar,
    ImportFar,
    /// Any other tag, for negative tests.
    Raw(u8),
}

impl RelocKind {
    pub fn tag(self) -> u8 {
        match self {
            RelocKind::SegOfs => 0x01,
            RelocKind::Segment => 0x02,
            RelocKind::Offset => 0x03,
            RelocKind::RelNear => 0x04,
            RelocKind::RelFar => 0x05,
            RelocKind::ImportFar => 0x06,
            RelocKind::Raw(tag) => tag,
        }
    }
}

/// Where a relocation patches.
#[derive(Clone, Debug)]
pub enum Target {
    /// `delta` bytes past a labelled blob.
    Label(String, u16),
    /// An absolute image offset, unchecked.
    Offset(u16),
}

/// A relocation to emit.
#[derive(Clone, Debug)]
pub struct RelocDesc {
    pub kind: RelocKind,
    pub target: Target,
    pub aux: u16,
    /// Symbol name for [`RelocKind::ImportFar`]; `aux` is filled in by the writer.
    pub import: Option<String>,
}

impl RelocDesc {
    pub fn at(kind: RelocKind, label: &str, delta: u16, aux: u16) -> Self {
        Self {
            kind,
            target: Target::Label(label.to_string(), delta),
            aux,
            import: None,
        }
    }

    pub fn raw(kind: RelocKind, offset: u16, aux: u16) -> Self {
        Self {
            kind,
            target: Target::Offset(offset),
            aux,
            import: None,
        }
    }

    pub fn import(label: &str, delta: u16, symbol: &str) -> Self {
        Self {
            kind: RelocKind::ImportFar,
            target: Target::Label(label.to_string(), delta),
            aux: 0,
            import: Some(symbol.to_string()),
        }
    }
}

/// An export to emit.
#[derive(Clone, Debug)]
pub struct ExportDesc {
    pub name: String,
    /// Label the export points at, or a raw offset.
    pub target: Target,
    pub flags: u16,
}

/// Flag values used in the image format.
pub mod flags {
    pub const DISCARD_COLD: u16 = 0x0001;
    pub const HAS_ISR: u16 = 0x0002;
    pub const XMS_OPTIONAL: u16 = 0x0008;

    pub const SYM_FUNCTION: u16 = 0x0001;
    pub const SYM_DATA: u16 = 0x0002;
    pub const SYM_FAR_CALL: u16 = 0x0004;
    pub const SYM_ISR_SAFE: u16 = 0x0008;
}
