//! Negotiated install flags and the per-stream encoding flags they resolve to.

use bitflags::bitflags;

bitflags! {
    /// Optional stream sections the runtime asks for, as reported across the
    /// boundary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstallFlags: u32 {
        /// Emit source-position comments.
        const COMMENTS = 0x0001;
        /// Emit the referenced-method table.
        const METHODS = 0x0002;
        /// Emit type provenance unless the client overrides the default.
        const TYPE_INFO = 0x0004;
    }
}

impl Default for InstallFlags {
    fn default() -> Self {
        InstallFlags::TYPE_INFO
    }
}

// Header flag bits.
const HEADER_COMMENTS: u8 = 0x01;
const HEADER_METHODS: u8 = 0x02;
const HEADER_TYPE_INFO: u8 = 0x04;

/// The sections actually present in one encoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingFlags {
    /// Source-position annotations are present.
    pub include_comments: bool,
    /// Referenced-method table is present.
    pub include_methods: bool,
    /// Pool references carry type provenance.
    pub include_type_info: bool,
}

impl Default for EncodingFlags {
    fn default() -> Self {
        Self {
            include_comments: false,
            include_methods: false,
            include_type_info: true,
        }
    }
}

impl EncodingFlags {
    /// Every optional section enabled.
    pub const ALL: Self = Self {
        include_comments: true,
        include_methods: true,
        include_type_info: true,
    };

    /// Resolve the negotiated flags against the client's type-info override.
    ///
    /// Type info follows the override when one is set; otherwise it is on
    /// exactly when the runtime reports [`InstallFlags::TYPE_INFO`].
    pub fn negotiate(flags: InstallFlags, type_info_override: Option<bool>) -> Self {
        Self {
            include_comments: flags.contains(InstallFlags::COMMENTS),
            include_methods: flags.contains(InstallFlags::METHODS),
            include_type_info: type_info_override
                .unwrap_or_else(|| flags.contains(InstallFlags::TYPE_INFO)),
        }
    }

    /// Pack into the header flag byte.
    #[inline]
    pub const fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.include_comments {
            byte |= HEADER_COMMENTS;
        }
        if self.include_methods {
            byte |= HEADER_METHODS;
        }
        if self.include_type_info {
            byte |= HEADER_TYPE_INFO;
        }
        byte
    }

    /// Unpack from the header flag byte. Unknown bits are ignored.
    #[inline]
    pub const fn from_byte(byte: u8) -> Self {
        Self {
            include_comments: byte & HEADER_COMMENTS != 0,
            include_methods: byte & HEADER_METHODS != 0,
            include_type_info: byte & HEADER_TYPE_INFO != 0,
        }
    }
}
