#![deny(unsafe_code)]
//! Coded image item storage for HEIF (ISO/IEC 23008-12) containers.
//!
//! The crate reads and writes the box structure of a HEIF file, keeps the
//! graph of image items, decoder configuration records and item references,
//! and handles the AVC, HEVC and JPEG decoder configuration records.
//!
//! ```rust
//! use heif_store::{Codec, Heif, ImageSize};
//!
//! # fn main() -> heif_store::Result<()> {
//! let mut avcc = vec![1, 66, 0xC0, 30, 0xFF, 0xE1, 0, 4, 0x67, 0x42, 0xC0, 0x1E];
//! avcc.extend_from_slice(&[1, 0, 2, 0x68, 0xCE]);
//!
//! let mut heif = Heif::new();
//! let id = heif.create_item(Codec::Avc, ImageSize::new(1920, 1080)?, avcc.as_slice(), &[0u8; 100])?;
//! let bytes = heif.save()?;
//!
//! let reopened = Heif::open(&bytes)?;
//! assert_eq!(reopened.item(id).map(|item| item.data().len()), Some(100));
//! # Ok(())
//! # }
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::convert::TryInto as _;

pub mod bmff;
mod boxes;
mod config;
mod heif;
mod item;
mod meta;
mod store;

pub use crate::boxes::{BoxLayout, BoxType, FourCC};
pub use crate::config::{
    AvcConfig, AvcHighProfileExt, Codec, CodecStrategy, DecoderConfigRecord, HevcConfig, HevcNalArray, JpegConfig,
};
pub use crate::heif::Heif;
pub use crate::item::{
    AuxiliaryType, ConfigSource, ImageItem, ImageItemBuilder, ImageSize, ItemProperty, MirrorAxis, OpaqueItem,
};
pub use crate::store::{ConfigId, ConfigOwner, ItemId, ItemReference, ItemStore};

/// Lossless widening to `u64`. Unsigned sources only.
pub(crate) trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Compile-time check that `usize` is no wider than `u64` on this target.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap_or(u64::MAX)
    }
}

/// Lossless widening to `usize` for field widths that fit on every supported target.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap_or(usize::MAX)
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
pub(crate) type TryString = fallible_collections::TryVec<u8>;

// Shadow the infallible std collections; use `TryVec` or spell out the std path.
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes failures of every operation in this crate.
///
/// Store and container errors sit next to the I/O and allocation failures
/// raised while reading boxes.
#[derive(Debug)]
pub enum Error {
    /// An image size with a zero width or height.
    InvalidSize { width: u32, height: u32 },
    /// A decoder configuration rejected by the item codec's compatibility check.
    ConfigTypeMismatch {
        item: Option<ItemId>,
        codec: Codec,
        config: Codec,
    },
    /// A codec tag that names no registered codec.
    UnsupportedCodec(FourCC),
    /// A decoder configuration record that does not follow its layout.
    MalformedConfig(&'static str),
    /// A box whose header or payload is corrupt.
    MalformedBox {
        box_type: Option<FourCC>,
        reason: &'static str,
    },
    /// A well-formed box stream that breaks the item structure rules.
    MalformedContainer(&'static str),
    /// The configuration is still attached to items.
    ConfigInUse { config: ConfigId, references: u32 },
    /// An item cannot be written because a part of it was never set.
    IncompleteItem { item: ItemId, missing: &'static str },
    UnknownItem(ItemId),
    UnknownConfig(ConfigId),
    /// Adding the reference would close a loop in the reference graph.
    CyclicReference { from: ItemId, to: ItemId },
    /// Limited support rather than invalid input.
    Unsupported(&'static str),
    /// Input ended inside a box or field.
    UnexpectedEOF,
    /// Reader or writer failure other than a short read.
    Io(std::io::Error),
    /// A fallible allocation failed.
    OutOfMemory,
    /// An [`OpenConfig`] limit was hit.
    ResourceLimitExceeded(&'static str),
}

impl Error {
    /// Attribute a short read or an anonymous box error to `box_type`.
    pub(crate) fn in_box(self, box_type: FourCC) -> Self {
        match self {
            Self::UnexpectedEOF => Self::MalformedBox {
                box_type: Some(box_type),
                reason: "truncated box payload",
            },
            Self::MalformedBox { box_type: None, reason } => Self::MalformedBox {
                box_type: Some(box_type),
                reason,
            },
            e => e,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidSize { width, height } => return write!(f, "invalid image size {width}x{height}"),
            Self::ConfigTypeMismatch { item: Some(item), codec, config } => {
                return write!(f, "{codec:?} item {item} cannot use a {config:?} decoder configuration")
            },
            Self::ConfigTypeMismatch { item: None, codec, config } => {
                return write!(f, "{codec:?} item cannot use a {config:?} decoder configuration")
            },
            Self::UnsupportedCodec(tag) => return write!(f, "unsupported codec {tag}"),
            Self::MalformedBox { box_type: Some(t), reason } => return write!(f, "malformed '{t}' box: {reason}"),
            Self::ConfigInUse { config, references } => {
                return write!(f, "decoder configuration {config} is used by {references} item(s)")
            },
            Self::IncompleteItem { item, missing } => return write!(f, "item {item} has no {missing}"),
            Self::UnknownItem(item) => return write!(f, "no item {item}"),
            Self::UnknownConfig(config) => return write!(f, "no decoder configuration {config}"),
            Self::CyclicReference { from, to } => {
                return write!(f, "reference from item {from} to item {to} would create a cycle")
            },
            Self::MalformedConfig(s)
            | Self::MalformedBox { box_type: None, reason: s }
            | Self::MalformedContainer(s)
            | Self::Unsupported(s)
            | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::MalformedBox {
            box_type: None,
            reason: "truncated bits",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            std::io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Io(err),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::MalformedBox {
            box_type: None,
            reason: "invalid utf8",
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::MalformedBox { .. } | Error::MalformedConfig(_) | Error::MalformedContainer(_) => {
                std::io::ErrorKind::InvalidData
            },
            Error::InvalidSize { .. } | Error::ConfigTypeMismatch { .. } | Error::UnsupportedCodec(_) => {
                std::io::ErrorKind::InvalidInput
            },
            Error::UnknownItem(_) | Error::UnknownConfig(_) => std::io::ErrorKind::NotFound,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::OutOfMemory => std::io::ErrorKind::OutOfMemory,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<fallible_collections::TryReserveError> for Error {
    fn from(_: fallible_collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for the box-level readers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParseOptions {
    /// Ignore non-zero flags in boxes that expect zero flags, and trailing
    /// bytes in properties whose layout is otherwise complete.
    pub(crate) lenient: bool,
}

/// Limits and validation options for [`Heif::open_with_config`].
///
/// Limits are checked before the corresponding allocation, so a file that
/// claims an unrealistic item count or payload size fails early.
///
/// # Examples
///
/// ```rust
/// use heif_store::OpenConfig;
///
/// // Default limits
/// let config = OpenConfig::default();
///
/// // Tighter limits for files from the network
/// let config = OpenConfig::default()
///     .with_peak_memory_limit(100_000_000)
///     .with_total_megapixels_limit(64)
///     .with_max_items(100);
///
/// // No limits
/// let config = OpenConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct OpenConfig {
    /// Maximum number of coded payload bytes copied out of the file.
    /// Defaults to 10^9 bytes.
    pub peak_memory_limit: Option<u64>,

    /// Maximum size of a single item in megapixels.
    /// Defaults to 512.
    pub total_megapixels_limit: Option<u32>,

    /// Maximum number of coded image items.
    /// Defaults to 10 000.
    pub max_items: Option<u32>,

    /// Accept non-zero flags where zero is required, trailing bytes in
    /// `pixi`, and unknown essential properties (kept opaque).
    /// Off by default.
    pub lenient: bool,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            total_megapixels_limit: Some(512),
            max_items: Some(10_000),
            lenient: false,
        }
    }
}

impl OpenConfig {
    /// Strict parsing without any resource limit.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            total_megapixels_limit: None,
            max_items: None,
            lenient: false,
        }
    }

    /// Cap the copied payload bytes.
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Cap the pixel count of each item, in megapixels.
    pub fn with_total_megapixels_limit(mut self, megapixels: u32) -> Self {
        self.total_megapixels_limit = Some(megapixels);
        self
    }

    /// Cap the number of coded items.
    pub fn with_max_items(mut self, items: u32) -> Self {
        self.max_items = Some(items);
        self
    }

    /// Toggle tolerant parsing.
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions { lenient: self.lenient }
    }
}

pub(crate) struct ResourceTracker<'a> {
    config: &'a OpenConfig,
    current_memory: u64,
    peak_memory: u64,
}

impl<'a> ResourceTracker<'a> {
    pub(crate) fn new(config: &'a OpenConfig) -> Self {
        Self {
            config,
            current_memory: 0,
            peak_memory: 0,
        }
    }

    pub(crate) fn reserve(&mut self, bytes: u64) -> Result<()> {
        self.current_memory = self.current_memory.saturating_add(bytes);
        self.peak_memory = self.peak_memory.max(self.current_memory);

        if let Some(limit) = self.config.peak_memory_limit {
            if self.peak_memory > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_megapixels(&self, size: ImageSize) -> Result<()> {
        if let Some(limit) = self.config.total_megapixels_limit {
            let megapixels = u64::from(size.width) * u64::from(size.height) / 1_000_000;

            if megapixels > u64::from(limit) {
                return Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_item_count(&self, count: usize) -> Result<()> {
        if let Some(limit) = self.config.max_items {
            if count > limit.to_usize() {
                return Err(Error::ResourceLimitExceeded("item count limit exceeded"));
            }
        }

        Ok(())
    }
}
