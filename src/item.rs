// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::boxes::FourCC;
use crate::config::{Codec, DecoderConfigRecord};
use crate::store::ConfigId;
use crate::{Error, Result, TryString, TryVec};
use arrayvec::ArrayVec;
use fallible_collections::{TryClone, TryReserveError};

/// Image width and height in pixels, as carried by `ispe`.
/// See ISO/IEC 23008-12:2017 § 6.5.3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self { width, height }.validated()
    }

    pub(crate) fn validated(self) -> Result<Self> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(self)
    }
}

/// Axis of an `imir` mirroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAxis {
    /// Mirror about a vertical axis (left and right swap).
    Vertical,
    /// Mirror about a horizontal axis (top and bottom swap).
    Horizontal,
}

/// Auxiliary image type, `auxC`: a null-terminated URN followed by
/// optional subtype bytes.
#[derive(Debug, PartialEq)]
pub struct AuxiliaryType {
    aux_data: TryString,
}

impl AuxiliaryType {
    /// Alpha plane of the image it references through `auxl`.
    pub const ALPHA: &'static str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";

    pub fn new(aux_type: &str) -> Result<Self> {
        let mut aux_data = TryVec::with_capacity(aux_type.len() + 1)?;
        aux_data.extend_from_slice(aux_type.as_bytes())?;
        aux_data.push(b'\0')?;
        Ok(Self { aux_data })
    }

    pub(crate) fn from_payload(aux_data: TryString) -> Self {
        Self { aux_data }
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.aux_data
    }

    #[must_use]
    pub fn type_subtype(&self) -> (&[u8], &[u8]) {
        let split = self
            .aux_data
            .iter()
            .position(|&b| b == b'\0')
            .map(|pos| self.aux_data.split_at(pos));
        if let Some((aux_type, rest)) = split {
            (aux_type, &rest[1..])
        } else {
            (&self.aux_data, &[])
        }
    }

    pub fn is_alpha(&self) -> bool {
        self.type_subtype().0 == Self::ALPHA.as_bytes()
    }
}

impl TryClone for AuxiliaryType {
    fn try_clone(&self) -> Result<Self, TryReserveError> {
        Ok(Self {
            aux_data: self.aux_data.try_clone()?,
        })
    }
}

/// A descriptive or transformative property associated with an item.
///
/// Size (`ispe`) and decoder configuration are modeled on [`ImageItem`]
/// directly rather than as properties.
#[derive(Debug, PartialEq)]
pub enum ItemProperty {
    /// `pixi`: bits per channel.
    PixelInformation(ArrayVec<u8, 16>),
    /// `irot`: anti-clockwise rotation in units of 90 degrees, 0 to 3.
    Rotation(u8),
    /// `imir`
    Mirror(MirrorAxis),
    /// `auxC`
    AuxiliaryType(AuxiliaryType),
    /// A property box this crate does not interpret, kept so it survives
    /// open and save.
    Opaque {
        box_type: FourCC,
        payload: TryVec<u8>,
        essential: bool,
    },
}

impl ItemProperty {
    pub fn box_type(&self) -> FourCC {
        match self {
            Self::PixelInformation(_) => FourCC::new(*b"pixi"),
            Self::Rotation(_) => FourCC::new(*b"irot"),
            Self::Mirror(_) => FourCC::new(*b"imir"),
            Self::AuxiliaryType(_) => FourCC::new(*b"auxC"),
            Self::Opaque { box_type, .. } => *box_type,
        }
    }

    /// Whether readers must understand the property to process the item.
    pub fn is_essential(&self) -> bool {
        match self {
            Self::Rotation(_) | Self::Mirror(_) | Self::AuxiliaryType(_) => true,
            Self::PixelInformation(_) => false,
            Self::Opaque { essential, .. } => *essential,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Self::Rotation(r) if *r > 3 => Err(Error::Unsupported("irot angle must be below 4")),
            _ => Ok(()),
        }
    }
}

impl TryClone for ItemProperty {
    fn try_clone(&self) -> Result<Self, TryReserveError> {
        Ok(match self {
            Self::PixelInformation(val) => Self::PixelInformation(val.clone()),
            Self::Rotation(val) => Self::Rotation(*val),
            Self::Mirror(val) => Self::Mirror(*val),
            Self::AuxiliaryType(val) => Self::AuxiliaryType(val.try_clone()?),
            Self::Opaque { box_type, payload, essential } => Self::Opaque {
                box_type: *box_type,
                payload: payload.try_clone()?,
                essential: *essential,
            },
        })
    }
}

/// One coded image.
#[derive(Debug)]
pub struct ImageItem {
    pub(crate) codec: Codec,
    pub(crate) size: ImageSize,
    pub(crate) config: Option<ConfigId>,
    pub(crate) data: TryVec<u8>,
    pub(crate) properties: TryVec<ItemProperty>,
    pub(crate) name: TryString,
    pub(crate) hidden: bool,
}

impl ImageItem {
    pub(crate) fn new(codec: Codec, size: ImageSize) -> Self {
        Self {
            codec,
            size,
            config: None,
            data: TryVec::new(),
            properties: TryVec::new(),
            name: TryVec::new(),
            hidden: false,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn item_type(&self) -> FourCC {
        self.codec.item_type()
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// The attached decoder configuration, if any.
    pub fn config_id(&self) -> Option<ConfigId> {
        self.config
    }

    /// The coded payload; empty until set.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn properties(&self) -> &[ItemProperty] {
        &self.properties
    }

    /// `infe` item name.
    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or_default()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// What is still missing before the item can be written.
    pub(crate) fn missing(&self) -> Option<&'static str> {
        if self.config.is_none() {
            Some("decoder configuration")
        } else if self.data.is_empty() {
            Some("image data")
        } else {
            None
        }
    }
}

/// An item of a type this crate does not decode, such as `grid`, `Exif` or
/// `mime`. Its payload, size and properties are carried unchanged so that
/// it survives open and save.
///
/// ```rust
/// use heif_store::{Heif, OpaqueItem};
///
/// # fn main() -> heif_store::Result<()> {
/// let mut heif = Heif::new();
/// let exif = heif.add_opaque_item(OpaqueItem::new(*b"Exif", &[0, 0, 0, 0])?)?;
/// let saved = heif.save()?;
/// let reopened = Heif::open(&saved)?;
/// assert_eq!(reopened.item_ids_by_type(*b"Exif")?[..], [exif]);
/// assert_eq!(reopened.item_data(exif), Some(&[0u8, 0, 0, 0][..]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct OpaqueItem {
    pub(crate) item_type: FourCC,
    pub(crate) size: Option<ImageSize>,
    pub(crate) data: TryVec<u8>,
    pub(crate) properties: TryVec<ItemProperty>,
    pub(crate) name: TryString,
    pub(crate) hidden: bool,
}

impl OpaqueItem {
    /// Fails with `Unsupported` for the item types of the supported
    /// codecs; those are built with [`ImageItemBuilder`].
    pub fn new(item_type: impl Into<FourCC>, data: &[u8]) -> Result<Self> {
        let item_type = item_type.into();
        if Codec::from_item_type(item_type).is_some() {
            return Err(Error::Unsupported("coded items are built with ImageItemBuilder"));
        }
        Ok(Self::empty(item_type, copy_bytes(data)?))
    }

    pub(crate) fn empty(item_type: FourCC, data: TryVec<u8>) -> Self {
        Self {
            item_type,
            size: None,
            data,
            properties: TryVec::new(),
            name: TryVec::new(),
            hidden: false,
        }
    }

    pub fn with_size(mut self, size: ImageSize) -> Result<Self> {
        self.size = Some(size.validated()?);
        Ok(self)
    }

    pub fn with_name(mut self, name: &str) -> Result<Self> {
        check_name(name)?;
        self.name = copy_bytes(name.as_bytes())?;
        Ok(self)
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_property(mut self, property: ItemProperty) -> Result<Self> {
        property.validate()?;
        self.properties.push(property)?;
        Ok(self)
    }

    pub fn item_type(&self) -> FourCC {
        self.item_type
    }

    /// `ispe`, when the file associated one.
    pub fn size(&self) -> Option<ImageSize> {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn properties(&self) -> &[ItemProperty] {
        &self.properties
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or_default()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }
}

/// `infe` names are null-terminated.
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.as_bytes().contains(&0) {
        return Err(Error::Unsupported("item names cannot contain NUL"));
    }
    Ok(())
}

/// Where an item's decoder configuration comes from.
#[derive(Debug)]
pub enum ConfigSource<'a> {
    /// A configuration already in the store, shared with other items.
    Shared(ConfigId),
    /// A serialized record, parsed into a configuration owned by the item.
    Bytes(&'a [u8]),
    /// A record owned by the item.
    Record(DecoderConfigRecord),
}

impl From<ConfigId> for ConfigSource<'_> {
    fn from(id: ConfigId) -> Self {
        Self::Shared(id)
    }
}

impl<'a> From<&'a [u8]> for ConfigSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<DecoderConfigRecord> for ConfigSource<'_> {
    fn from(record: DecoderConfigRecord) -> Self {
        Self::Record(record)
    }
}

/// Collects the parts of a new item. Nothing reaches the store until
/// [`ItemStore::register`](crate::ItemStore::register) validated all of them.
///
/// ```rust
/// use heif_store::{Codec, Heif, ImageItemBuilder, ImageSize};
///
/// # fn main() -> heif_store::Result<()> {
/// let mut heif = Heif::new();
/// let builder = ImageItemBuilder::new(Codec::Jpeg)
///     .size(ImageSize::new(64, 64)?)
///     .decoder_config(&[0xFF, 0xD8][..])
///     .name("thumbnail")
///     .hidden(true);
/// let id = heif.add_item(builder)?;
/// assert!(heif.item(id).is_some_and(|item| !item.has_data()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ImageItemBuilder<'a> {
    pub(crate) codec: Codec,
    pub(crate) size: Option<ImageSize>,
    pub(crate) config: Option<ConfigSource<'a>>,
    pub(crate) data: &'a [u8],
    pub(crate) name: &'a str,
    pub(crate) hidden: bool,
}

impl<'a> ImageItemBuilder<'a> {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            size: None,
            config: None,
            data: &[],
            name: "",
            hidden: false,
        }
    }

    pub fn size(mut self, size: ImageSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn decoder_config(mut self, config: impl Into<ConfigSource<'a>>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Coded payload, copied when the item is registered.
    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    pub fn name(mut self, name: &'a str) -> Self {
        self.name = name;
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    /// Validate the size and copy the owned parts; the configuration is
    /// resolved by the store.
    pub(crate) fn stage(&self) -> Result<ImageItem> {
        let size = self.size.ok_or(Error::InvalidSize { width: 0, height: 0 })?.validated()?;
        check_name(self.name)?;
        let mut item = ImageItem::new(self.codec, size);
        item.data = copy_bytes(self.data)?;
        item.name = copy_bytes(self.name.as_bytes())?;
        item.hidden = self.hidden;
        Ok(item)
    }
}

pub(crate) fn copy_bytes(bytes: &[u8]) -> Result<TryVec<u8>> {
    let mut copy = TryVec::with_capacity(bytes.len())?;
    copy.extend_from_slice(bytes)?;
    Ok(copy)
}
