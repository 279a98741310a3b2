use crate::{arena::MemoryClass, header::HeaderField};
use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `md64_loader` library.
///
/// Every failure path of the loader maps to exactly one variant, so a caller
/// can always tell which stage of a load or unload went wrong.
#[derive(Debug)]
pub enum Error {
    /// An error occurred while opening or reading a module image.
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// The module header failed a structural check.
    ///
    /// This covers a bad signature, an unknown ABI version, a header checksum
    /// mismatch and any violation of the size-field or table-placement rules.
    HeaderInvalid {
        /// The header field that failed validation.
        field: HeaderField,
        /// A descriptive message naming the violated rule.
        msg: Cow<'static, str>,
    },

    /// The image body does not match its stored checksum.
    ImageCorrupt {
        /// Checksum stored in the header.
        expected: u16,
        /// Checksum computed over the body bytes.
        actual: u16,
    },

    /// The host CPU class or feature set does not satisfy the module.
    UnsupportedCpuOrFeature {
        /// A descriptive message about the missing capability.
        msg: Cow<'static, str>,
    },

    /// The memory arena could not satisfy a reservation.
    ///
    /// The arena is left untouched and remains usable for later loads.
    AllocationFailed {
        /// Number of paragraphs requested.
        paragraphs: u32,
        /// The memory class that was tried last.
        class: MemoryClass,
    },

    /// A relocation entry points outside the module image.
    RelocationOutOfBounds {
        /// Index of the entry in the relocation table.
        index: usize,
        /// Patch offset carried by the entry.
        offset: u16,
        /// Number of bytes the patch writes.
        width: usize,
        /// Size of the module image in bytes.
        limit: usize,
    },

    /// A relocation entry carries a type tag the engine does not know.
    UnknownRelocation {
        /// Index of the entry in the relocation table.
        index: usize,
        /// Raw type tag.
        kind: u8,
    },

    /// A symbol could not be resolved.
    SymbolNotFound {
        /// The symbol that was looked up.
        name: Cow<'static, str>,
    },

    /// The global symbol table has no room for another export.
    SymbolTableFull {
        /// Maximum number of entries the table holds.
        capacity: usize,
    },

    /// The module's init entry point reported failure.
    InitFailed {
        /// Status returned by the entry point.
        status: u16,
        /// A descriptive message about the failure.
        msg: Cow<'static, str>,
    },

    /// The module's cleanup entry point reported failure.
    ///
    /// This error is not fatal: the module's memory has been released and its
    /// exports withdrawn by the time it is returned.
    UnloadFailed {
        /// Status returned by the entry point.
        status: u16,
    },

    /// An operation was requested in a lifecycle state that does not allow it.
    InvalidState {
        /// A descriptive message about the rejected operation.
        msg: Cow<'static, str>,
    },

    /// An error occurred in a user-defined collaborator.
    Custom {
        /// A descriptive message about the custom error.
        msg: Cow<'static, str>,
    },
}

/// The error taxonomy a loader failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed image: bad signature, checksum or size fields.
    Structural,
    /// The arena or a fixed-size table ran out of room.
    Resource,
    /// The module is well formed but cannot be linked here.
    Linkage,
    /// Module code reported failure from an entry point.
    Behavioral,
    /// The caller asked for something the current state does not allow.
    Usage,
}

impl Error {
    /// Returns the taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::HeaderInvalid { .. } | Error::ImageCorrupt { .. } | Error::Io { .. } => {
                ErrorClass::Structural
            }
            Error::AllocationFailed { .. } => ErrorClass::Resource,
            Error::UnsupportedCpuOrFeature { .. }
            | Error::RelocationOutOfBounds { .. }
            | Error::UnknownRelocation { .. }
            | Error::SymbolNotFound { .. }
            | Error::SymbolTableFull { .. } => ErrorClass::Linkage,
            Error::InitFailed { .. } | Error::UnloadFailed { .. } => ErrorClass::Behavioral,
            Error::InvalidState { .. } | Error::Custom { .. } => ErrorClass::Usage,
        }
    }

    /// Whether the host may keep running after this error without cleanup.
    ///
    /// Only [`Error::UnloadFailed`] qualifies: the loader already released the
    /// module before reporting it.
    #[inline]
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Error::UnloadFailed { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::HeaderInvalid { field, msg } => {
                write!(f, "Invalid module header ({field:?}): {msg}")
            }
            Error::ImageCorrupt { expected, actual } => write!(
                f,
                "Image checksum mismatch: stored 0x{expected:04x}, computed 0x{actual:04x}"
            ),
            Error::UnsupportedCpuOrFeature { msg } => write!(f, "Unsupported host: {msg}"),
            Error::AllocationFailed { paragraphs, class } => write!(
                f,
                "Allocation of {paragraphs} paragraphs failed in {class:?} memory"
            ),
            Error::RelocationOutOfBounds {
                index,
                offset,
                width,
                limit,
            } => write!(
                f,
                "Relocation #{index} at 0x{offset:04x} (+{width}) exceeds image size {limit}"
            ),
            Error::UnknownRelocation { index, kind } => {
                write!(f, "Relocation #{index} has unknown type 0x{kind:02x}")
            }
            Error::SymbolNotFound { name } => write!(f, "Symbol not found: {name}"),
            Error::SymbolTableFull { capacity } => {
                write!(f, "Global symbol table full ({capacity} entries)")
            }
            Error::InitFailed { status, msg } => {
                write!(f, "Module init failed with status 0x{status:04x}: {msg}")
            }
            Error::UnloadFailed { status } => {
                write!(f, "Module cleanup failed with status 0x{status:04x}")
            }
            Error::InvalidState { msg } => write!(f, "Invalid module state: {msg}"),
            Error::Custom { msg } => write!(f, "Custom error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

/// Creates a header validation error for `field`.
#[cold]
#[inline(never)]
pub(crate) fn header_error(field: HeaderField, msg: impl Into<Cow<'static, str>>) -> Error {
    Error::HeaderInvalid {
        field,
        msg: msg.into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::UnsupportedCpuOrFeature { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn symbol_not_found(name: impl Into<Cow<'static, str>>) -> Error {
    Error::SymbolNotFound { name: name.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn state_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidState { msg: msg.into() }
}

/// Creates a custom error with the specified message.
///
/// Collaborators implemented outside this crate (arenas, dispatchers) use it
/// to report their own failures.
#[cold]
#[inline(never)]
pub fn custom_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Custom { msg: msg.into() }
}
