// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readers and writers for the payloads of the boxes inside `meta`.

use crate::bmff::{
    self, be_u16, be_u32, check_consumed, put_u16, put_u32, put_u64, read_c_string, read_fullbox_extra,
    read_fullbox_version_no_flags, write_fullbox_extra, BmffBox,
};
use crate::boxes::{BoxType, FourCC};
use crate::config::DecoderConfigRecord;
use crate::item::{AuxiliaryType, ImageSize, ItemProperty, MirrorAxis};
use crate::{Error, ParseOptions, Result, ToUsize, TryString, TryVec};
use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::{debug, warn};
use std::convert::{TryFrom, TryInto as _};
use std::ops::{Range, RangeFrom};

/// Run `f` over the payload of a leaf box, attributing its errors to the box.
pub(crate) fn read_leaf<T>(b: &BmffBox, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
    let payload = b.data().ok_or(Error::MalformedBox {
        box_type: Some(b.box_type),
        reason: "expected a leaf box",
    })?;
    f(payload).map_err(|e| e.in_box(b.box_type))
}

/// Build a full box from its version, flags and body.
fn full_box(
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut std::vec::Vec<u8>) -> Result<()>,
) -> Result<BmffBox> {
    let mut payload = std::vec::Vec::new();
    write_fullbox_extra(&mut payload, version, flags)?;
    body(&mut payload)?;
    Ok(BmffBox::with_data(box_type, payload.into()))
}

/// File type box 'ftyp'.
#[derive(Debug)]
pub(crate) struct FileTypeBox {
    pub(crate) major_brand: FourCC,
    pub(crate) minor_version: u32,
    pub(crate) compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    pub(crate) fn has_brand(&self, brand: FourCC) -> bool {
        self.major_brand == brand || self.compatible_brands.contains(&brand)
    }
}

/// Parse an ftyp box.
/// See ISO 14496-12:2015 § 4.3
pub(crate) fn read_ftyp(mut src: &[u8]) -> Result<FileTypeBox> {
    let major = be_u32(&mut src)?;
    let minor = be_u32(&mut src)?;
    if src.len() % 4 != 0 {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "invalid ftyp size",
        });
    }
    let brand_count = src.len() / 4;
    let mut brands = TryVec::with_capacity(brand_count)?;
    for _ in 0..brand_count {
        brands.push(be_u32(&mut src)?.into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

pub(crate) fn write_ftyp(ftyp: &FileTypeBox) -> Result<BmffBox> {
    let mut payload = std::vec::Vec::new();
    payload.try_reserve(8 + 4 * ftyp.compatible_brands.len())?;
    put_u32(&mut payload, ftyp.major_brand.to_u32())?;
    put_u32(&mut payload, ftyp.minor_version)?;
    for brand in ftyp.compatible_brands.iter() {
        put_u32(&mut payload, brand.to_u32())?;
    }
    Ok(BmffBox::with_data(b"ftyp", payload.into()))
}

/// Parse a handler box and return its handler type.
/// See ISO 14496-12:2015 § 8.4.3
pub(crate) fn read_hdlr(mut src: &[u8], options: &ParseOptions) -> Result<FourCC> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("hdlr version"));
    }
    let _pre_defined = be_u32(&mut src)?;
    let handler_type = FourCC::from(be_u32(&mut src)?);
    for _ in 0..3 {
        let _reserved = be_u32(&mut src)?;
    }
    // The name is informative only; some writers omit its terminator.
    debug!("hdlr {handler_type} name {} bytes", src.len());
    Ok(handler_type)
}

pub(crate) fn write_hdlr(handler_type: FourCC) -> Result<BmffBox> {
    full_box(b"hdlr", 0, 0, |dst| {
        put_u32(dst, 0)?;
        put_u32(dst, handler_type.to_u32())?;
        for _ in 0..3 {
            put_u32(dst, 0)?;
        }
        dst.push(b'\0');
        Ok(())
    })
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
pub(crate) fn read_pitm(mut src: &[u8], options: &ParseOptions) -> Result<u32> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;

    let item_id = match version {
        0 => be_u16(&mut src)?.into(),
        1 => be_u32(&mut src)?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };

    check_consumed(BoxType::PrimaryItemBox, src)?;
    Ok(item_id)
}

pub(crate) fn write_pitm(item_id: u32) -> Result<BmffBox> {
    match u16::try_from(item_id) {
        Ok(id) => full_box(b"pitm", 0, 0, |dst| put_u16(dst, id)),
        Err(_) => full_box(b"pitm", 1, 0, |dst| put_u32(dst, item_id)),
    }
}

/// Used for 'infe' boxes within 'iinf' boxes
/// See ISO 14496-12:2015 § 8.11.6
/// Only versions {2, 3} are supported
#[derive(Debug)]
pub(crate) struct ItemInfoEntry {
    pub(crate) item_id: u32,
    pub(crate) item_type: FourCC,
    pub(crate) protection_index: u16,
    pub(crate) name: TryString,
    pub(crate) hidden: bool,
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
pub(crate) fn read_iinf(mut src: &[u8], options: &ParseOptions) -> Result<TryVec<ItemInfoEntry>> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;

    let entry_count = match version {
        0 => be_u16(&mut src)?.to_usize(),
        1 => be_u32(&mut src)?.to_usize(),
        _ => return Err(Error::Unsupported("unsupported iinf version")),
    };
    let mut item_infos = TryVec::with_capacity(entry_count.min(src.len() / 8))?;

    for b in bmff::decode_children(src)?.iter() {
        if b.name() != BoxType::ItemInfoEntry {
            return Err(Error::MalformedBox {
                box_type: None,
                reason: "iinf box should contain only infe boxes",
            });
        }
        item_infos.push(read_leaf(b, |payload| read_infe(payload, options))?)?;
    }

    if item_infos.len() != entry_count {
        warn!("iinf declares {entry_count} entries, found {}", item_infos.len());
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe(mut src: &[u8], options: &ParseOptions) -> Result<ItemInfoEntry> {
    let (version, flags) = read_fullbox_extra(&mut src)?;

    // mif1 brand (see ISO 23008-12:2017 § 10.2.1) only requires v2 and 3
    let item_id = match version {
        2 => be_u16(&mut src)?.into(),
        3 => be_u32(&mut src)?,
        _ => return Err(Error::Unsupported("unsupported version in 'infe' box")),
    };

    let protection_index = be_u16(&mut src)?;
    let item_type = FourCC::from(be_u32(&mut src)?);
    debug!("infe item_id {item_id} item_type: {item_type}");

    // Some writers end the box right after the item type.
    let name: &[u8] = if src.is_empty() { &[] } else { read_c_string(&mut src)? };
    let name: &[u8] = match std::str::from_utf8(name) {
        Ok(_) => name,
        Err(_) if options.lenient => &[],
        Err(_) => {
            return Err(Error::MalformedBox {
                box_type: None,
                reason: "item name is not utf8",
            })
        },
    };
    // content_type and the like for mime and uri items are not needed

    let mut name_copy = TryVec::with_capacity(name.len())?;
    name_copy.extend_from_slice(name)?;
    Ok(ItemInfoEntry {
        item_id,
        item_type,
        protection_index,
        name: name_copy,
        hidden: flags & 1 != 0,
    })
}

pub(crate) fn write_iinf(entries: &[ItemInfoEntry]) -> Result<BmffBox> {
    let (version, count) = match u16::try_from(entries.len()) {
        Ok(_) => (0, None),
        Err(_) => (1, Some(u32::try_from(entries.len())?)),
    };
    full_box(b"iinf", version, 0, |dst| {
        match count {
            None => put_u16(dst, u16::try_from(entries.len())?)?,
            Some(count) => put_u32(dst, count)?,
        }
        for entry in entries {
            bmff::encode_into(&write_infe(entry)?, dst)?;
        }
        Ok(())
    })
}

fn write_infe(entry: &ItemInfoEntry) -> Result<BmffBox> {
    let flags = u32::from(entry.hidden);
    let body = |dst: &mut std::vec::Vec<u8>| {
        put_u16(dst, entry.protection_index)?;
        put_u32(dst, entry.item_type.to_u32())?;
        dst.extend_from_slice(&entry.name);
        dst.push(b'\0');
        Ok(())
    };
    match u16::try_from(entry.item_id) {
        Ok(id) => full_box(b"infe", 2, flags, |dst| {
            put_u16(dst, id)?;
            body(dst)
        }),
        Err(_) => full_box(b"infe", 3, flags, |dst| {
            put_u32(dst, entry.item_id)?;
            body(dst)
        }),
    }
}

/// One `SingleItemTypeReferenceBox`.
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug)]
pub(crate) struct SingleItemTypeReference {
    pub(crate) reference_type: FourCC,
    pub(crate) from_item_id: u32,
    pub(crate) to_item_ids: TryVec<u32>,
}

pub(crate) fn read_iref(mut src: &[u8], options: &ParseOptions) -> Result<TryVec<SingleItemTypeReference>> {
    let mut item_references = TryVec::new();
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version > 1 {
        return Err(Error::Unsupported("iref version"));
    }

    for b in bmff::decode_children(src)?.iter() {
        let reference = read_leaf(b, |mut src| {
            let from_item_id = if version == 0 {
                be_u16(&mut src)?.into()
            } else {
                be_u32(&mut src)?
            };
            let reference_count = be_u16(&mut src)?;
            let mut to_item_ids = TryVec::with_capacity(reference_count.to_usize())?;
            for _ in 0..reference_count {
                let to_item_id = if version == 0 {
                    be_u16(&mut src)?.into()
                } else {
                    be_u32(&mut src)?
                };
                to_item_ids.push(to_item_id)?;
            }
            check_consumed(b.name(), src)?;
            Ok(SingleItemTypeReference {
                reference_type: b.box_type,
                from_item_id,
                to_item_ids,
            })
        })?;
        item_references.push(reference)?;
    }
    Ok(item_references)
}

pub(crate) fn write_iref(references: &[SingleItemTypeReference]) -> Result<BmffBox> {
    let wide = references
        .iter()
        .any(|r| r.from_item_id > 0xFFFF || r.to_item_ids.iter().any(|&id| id > 0xFFFF));
    let put_id = |dst: &mut std::vec::Vec<u8>, id: u32| -> Result<()> {
        if wide {
            put_u32(dst, id)
        } else {
            put_u16(dst, u16::try_from(id)?)
        }
    };
    full_box(b"iref", u8::from(wide), 0, |dst| {
        for r in references {
            let mut payload = std::vec::Vec::new();
            put_id(&mut payload, r.from_item_id)?;
            let count = u16::try_from(r.to_item_ids.len())
                .map_err(|_| Error::Unsupported("more than 65535 references of one type from one item"))?;
            put_u16(&mut payload, count)?;
            for &to in r.to_item_ids.iter() {
                put_id(&mut payload, to)?;
            }
            bmff::encode_into(&BmffBox::with_data(r.reference_type, payload.into()), dst)?;
        }
        Ok(())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    fn to_bits(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }

    fn nibble(self) -> u8 {
        self.to_bits() / 8
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::MalformedBox {
                box_type: None,
                reason: "value must be in the set {0, 4, 8}",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

/// Where an item's extents are relative to.
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstructionMethod {
    File,
    Idat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExtentRange {
    WithLength(Range<u64>),
    ToEnd(RangeFrom<u64>),
}

impl ExtentRange {
    pub(crate) fn start(&self) -> u64 {
        match self {
            Self::WithLength(r) => r.start,
            Self::ToEnd(r) => r.start,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ItemLocation {
    pub(crate) item_id: u32,
    pub(crate) construction_method: ConstructionMethod,
    pub(crate) extents: TryVec<ExtentRange>,
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
pub(crate) fn read_iloc(mut src: &[u8], options: &ParseOptions) -> Result<TryVec<ItemLocation>> {
    let version: IlocVersion = read_fullbox_version_no_flags(&mut src, options)?.try_into()?;

    let mut iloc = BitReader::new(src);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        },
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    let mut items = TryVec::with_capacity(item_count.to_usize().min(src.len() / 4))?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // Version 0 has no construction_method field; its offsets are file offsets.
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => return Err(Error::Unsupported("construction_method 'item_offset' is not supported")),
                    _ => {
                        return Err(Error::MalformedBox {
                            box_type: None,
                            reason: "construction_method is taken from the set 0, 1 or 2",
                        })
                    },
                }
            },
        };

        let data_reference_index = iloc.read_u16(16)?;

        if data_reference_index != 0 {
            return Err(Error::Unsupported("external file references (iloc.data_reference_index != 0) are not supported"));
        }

        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::MalformedBox {
                box_type: None,
                reason: "extent_count must have a value 1 or greater",
            });
        }

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            // Only meaningful for construction_method 2
            if let Some(index_size) = index_size {
                let _extent_index = iloc.read_u64(index_size.to_bits())?;
            }

            // An offset field of length zero implies offset 0, which follows
            // from BitReader::read_u64(0) -> 0.
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let extent_length = iloc.read_u64(length_size.to_bits())?;

            // A zero length means the rest of the source.
            let start = base_offset.checked_add(extent_offset).ok_or(Error::MalformedBox {
                box_type: None,
                reason: "offset calculation overflow",
            })?;
            let extent_range = if extent_length == 0 {
                ExtentRange::ToEnd(RangeFrom { start })
            } else {
                let end = start.checked_add(extent_length).ok_or(Error::MalformedBox {
                    box_type: None,
                    reason: "end calculation overflow",
                })?;
                ExtentRange::WithLength(Range { start, end })
            };

            extents.push(extent_range)?;
        }

        items.push(ItemLocation {
            item_id,
            construction_method,
            extents,
        })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else {
        Err(Error::MalformedBox {
            box_type: None,
            reason: "invalid iloc size",
        })
    }
}

/// One file-relative extent per item, as written by `save`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WrittenLocation {
    pub(crate) item_id: u32,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

/// Write an `iloc` with version 0, or 2 when item ids need 32 bits.
pub(crate) fn write_iloc(locations: &[WrittenLocation], wide_offsets: bool) -> Result<BmffBox> {
    let wide_ids = locations.iter().any(|l| l.item_id > 0xFFFF);
    let field = if wide_offsets { IlocFieldSize::Eight } else { IlocFieldSize::Four };
    let put_field = |dst: &mut std::vec::Vec<u8>, value: u64| -> Result<()> {
        match field {
            IlocFieldSize::Eight => put_u64(dst, value),
            _ => put_u32(dst, u32::try_from(value)?),
        }
    };
    let version = if wide_ids { 2 } else { 0 };
    full_box(b"iloc", version, 0, |dst| {
        // offset_size, length_size, base_offset_size = 0, index_size/reserved = 0
        dst.push(field.nibble() << 4 | field.nibble());
        dst.push(0);
        if wide_ids {
            put_u32(dst, u32::try_from(locations.len())?)?;
        } else {
            put_u16(dst, u16::try_from(locations.len())?)?;
        }
        for l in locations {
            if wide_ids {
                put_u32(dst, l.item_id)?;
                // reserved and construction_method 0
                put_u16(dst, 0)?;
            } else {
                put_u16(dst, u16::try_from(l.item_id)?)?;
            }
            // data_reference_index
            put_u16(dst, 0)?;
            // extent_count
            put_u16(dst, 1)?;
            put_field(dst, l.offset)?;
            put_field(dst, l.length)?;
        }
        Ok(())
    })
}

/// A property from `ipco`, in its parsed form.
#[derive(Debug)]
pub(crate) enum Property {
    Size(ImageSize),
    Config(DecoderConfigRecord),
    Item(ItemProperty),
    Unknown { box_type: FourCC, payload: TryVec<u8> },
}

/// An `ipma` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Association {
    pub(crate) item_id: u32,
    pub(crate) essential: bool,
    /// 1-based index into `ipco`; 0 means no property.
    pub(crate) property_index: u16,
}

/// Parse the children of an `iprp` box.
pub(crate) fn read_iprp(iprp: &BmffBox, options: &ParseOptions) -> Result<(TryVec<Property>, TryVec<Association>)> {
    let mut properties = None;
    let mut associations = TryVec::new();

    for b in iprp.children() {
        match b.name() {
            BoxType::ItemPropertyContainerBox => {
                if properties.is_some() {
                    return Err(Error::MalformedContainer("There should be exactly one ipco box per iprp"));
                }
                properties = Some(read_ipco(b, options)?);
            },
            BoxType::ItemPropertyAssociationBox => {
                for association in read_leaf(b, read_ipma)?.iter() {
                    associations.push(*association)?;
                }
            },
            _ => return Err(Error::MalformedContainer("unexpected iprp child")),
        }
    }

    let properties = properties.ok_or(Error::MalformedContainer("iprp without ipco"))?;
    Ok((properties, associations))
}

fn read_ipco(ipco: &BmffBox, options: &ParseOptions) -> Result<TryVec<Property>> {
    let mut properties = TryVec::with_capacity(ipco.children().len())?;
    // Must push for every property to have correct index for them
    for b in ipco.children() {
        let prop = match b.name() {
            BoxType::ImageSpatialExtentsBox => Property::Size(read_leaf(b, |p| read_ispe(p, options))?),
            BoxType::AVCConfigurationBox | BoxType::HEVCConfigurationBox | BoxType::JPEGConfigurationBox => {
                let payload = b.data().ok_or(Error::MalformedContainer("configuration box is not a leaf"))?;
                Property::Config(DecoderConfigRecord::parse(b.box_type, payload)?)
            },
            BoxType::PixelInformationBox => {
                Property::Item(ItemProperty::PixelInformation(read_leaf(b, |p| read_pixi(p, options))?))
            },
            BoxType::ImageRotationBox => Property::Item(read_leaf(b, read_irot)?),
            BoxType::ImageMirrorBox => Property::Item(read_leaf(b, read_imir)?),
            BoxType::AuxiliaryTypeProperty => {
                Property::Item(ItemProperty::AuxiliaryType(read_leaf(b, |p| read_auxc(p, options))?))
            },
            _ => {
                let payload = b.data().ok_or(Error::MalformedContainer("container box in ipco"))?;
                debug!("keeping {} property as opaque", b.box_type);
                let mut copy = TryVec::with_capacity(payload.len())?;
                copy.extend_from_slice(payload)?;
                Property::Unknown {
                    box_type: b.box_type,
                    payload: copy,
                }
            },
        };
        properties.push(prop)?;
    }
    Ok(properties)
}

fn read_ipma(mut src: &[u8]) -> Result<TryVec<Association>> {
    let (version, flags) = read_fullbox_extra(&mut src)?;

    let mut associations = TryVec::new();

    let entry_count = be_u32(&mut src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            be_u16(&mut src)?.into()
        } else {
            be_u32(&mut src)?
        };
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = bmff::take(&mut src, num_association_bytes)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(Association {
                item_id,
                essential,
                property_index,
            })?;
        }
    }
    check_consumed(BoxType::ItemPropertyAssociationBox, src)?;
    Ok(associations)
}

/// Associations of one item, in `ipco` order of writing.
#[derive(Debug)]
pub(crate) struct ItemAssociations {
    pub(crate) item_id: u32,
    pub(crate) entries: TryVec<(bool, u16)>,
}

/// Write an `ipma`, choosing 32-bit item ids and 15-bit indices only
/// when needed.
pub(crate) fn write_ipma(items: &[ItemAssociations], property_count: usize) -> Result<BmffBox> {
    if property_count > 0x7FFF {
        return Err(Error::Unsupported("more than 32767 item properties"));
    }
    let wide_indices = property_count > 0x7F;
    let wide_ids = items.iter().any(|i| i.item_id > 0xFFFF);
    full_box(b"ipma", u8::from(wide_ids), u32::from(wide_indices), |dst| {
        put_u32(dst, u32::try_from(items.len())?)?;
        for item in items {
            if wide_ids {
                put_u32(dst, item.item_id)?;
            } else {
                put_u16(dst, u16::try_from(item.item_id)?)?;
            }
            let count = u8::try_from(item.entries.len())
                .map_err(|_| Error::Unsupported("more than 255 properties on one item"))?;
            dst.push(count);
            for &(essential, index) in item.entries.iter() {
                if wide_indices {
                    put_u16(dst, u16::from(essential) << 15 | index)?;
                } else {
                    dst.push(u8::from(essential) << 7 | u8::try_from(index)?);
                }
            }
        }
        Ok(())
    })
}

fn read_pixi(mut src: &[u8], options: &ParseOptions) -> Result<ArrayVec<u8, 16>> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    let mut channels = ArrayVec::<u8, 16>::new();
    if num_channels > channels.capacity() {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "invalid num_channels",
        });
    }
    channels
        .try_extend_from_slice(bmff::take(&mut src, num_channels)?)
        .map_err(|_| Error::MalformedBox {
            box_type: None,
            reason: "invalid num_channels",
        })?;

    // In lenient mode, skip any extra bytes
    if !options.lenient {
        check_consumed(BoxType::PixelInformationBox, src)?;
    }
    Ok(channels)
}

fn read_auxc(mut src: &[u8], options: &ParseOptions) -> Result<AuxiliaryType> {
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("auxC version"));
    }

    let mut aux_data = TryVec::with_capacity(src.len())?;
    aux_data.extend_from_slice(src)?;
    Ok(AuxiliaryType::from_payload(aux_data))
}

/// Parse an Image Spatial Extents property box
/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe(mut src: &[u8], options: &ParseOptions) -> Result<ImageSize> {
    let _version = read_fullbox_version_no_flags(&mut src, options)?;
    // Version is always 0 for ispe

    let width = be_u32(&mut src)?;
    let height = be_u32(&mut src)?;
    check_consumed(BoxType::ImageSpatialExtentsBox, src)?;

    if width == 0 || height == 0 {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "ispe dimensions cannot be zero",
        });
    }

    Ok(ImageSize { width, height })
}

/// See ISO/IEC 23008-12:2017 § 6.5.10
fn read_irot(src: &[u8]) -> Result<ItemProperty> {
    let mut bits = BitReader::new(src);
    // unsigned int (6) reserved = 0;
    if bits.read_u8(6)? != 0 {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "invalid reserved bits in irot",
        });
    }
    let angle = bits.read_u8(2)?;
    if bits.remaining() != 0 {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "unread box content or bad parser sync",
        });
    }
    Ok(ItemProperty::Rotation(angle))
}

/// See ISO/IEC 23008-12:2017 § 6.5.12
fn read_imir(src: &[u8]) -> Result<ItemProperty> {
    let mut bits = BitReader::new(src);
    // unsigned int(7) reserved = 0;
    if bits.read_u8(7)? != 0 {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "invalid reserved bits in imir",
        });
    }
    let axis = if bits.read_bool()? { MirrorAxis::Horizontal } else { MirrorAxis::Vertical };
    if bits.remaining() != 0 {
        return Err(Error::MalformedBox {
            box_type: None,
            reason: "unread box content or bad parser sync",
        });
    }
    Ok(ItemProperty::Mirror(axis))
}

pub(crate) fn write_ispe(size: ImageSize) -> Result<BmffBox> {
    full_box(b"ispe", 0, 0, |dst| {
        put_u32(dst, size.width)?;
        put_u32(dst, size.height)
    })
}

pub(crate) fn write_config(record: &DecoderConfigRecord) -> Result<BmffBox> {
    Ok(BmffBox::with_data(record.codec().config_box(), record.serialize()?))
}

pub(crate) fn write_property(property: &ItemProperty) -> Result<BmffBox> {
    match property {
        ItemProperty::PixelInformation(channels) => full_box(b"pixi", 0, 0, |dst| {
            dst.push(u8::try_from(channels.len())?);
            dst.extend_from_slice(channels);
            Ok(())
        }),
        ItemProperty::Rotation(angle) => {
            property.validate()?;
            BmffBox::leaf(b"irot", &[*angle])
        },
        ItemProperty::Mirror(axis) => BmffBox::leaf(b"imir", &[u8::from(*axis == MirrorAxis::Horizontal)]),
        ItemProperty::AuxiliaryType(aux) => full_box(b"auxC", 0, 0, |dst| {
            dst.extend_from_slice(aux.payload());
            Ok(())
        }),
        ItemProperty::Opaque { box_type, payload, .. } => BmffBox::leaf(*box_type, payload),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> ParseOptions {
        ParseOptions::default()
    }

    #[test]
    fn iloc_written_is_read_back() {
        let locations = [
            WrittenLocation { item_id: 1, offset: 100, length: 20 },
            WrittenLocation { item_id: 2, offset: 120, length: 7 },
        ];
        for wide in [false, true] {
            let b = write_iloc(&locations, wide).unwrap();
            let read = read_leaf(&b, |p| read_iloc(p, &strict())).unwrap();
            assert_eq!(read.len(), 2);
            assert_eq!(read[1].item_id, 2);
            assert_eq!(read[1].construction_method, ConstructionMethod::File);
            assert_eq!(read[1].extents[0], ExtentRange::WithLength(120..127));
        }
    }

    #[test]
    fn iloc_wide_item_ids_use_version_2() {
        let locations = [WrittenLocation { item_id: 0x1_0000, offset: 8, length: 1 }];
        let b = write_iloc(&locations, false).unwrap();
        assert_eq!(b.data().unwrap()[0], 2);
        let read = read_leaf(&b, |p| read_iloc(p, &strict())).unwrap();
        assert_eq!(read[0].item_id, 0x1_0000);
    }

    #[test]
    fn iloc_idat_and_to_end_extents() {
        // version 1, offset_size 4, length_size 4, base_offset_size 0, index_size 0
        let payload = [
            1, 0, 0, 0, 0x44, 0x00, 0, 1, // one item
            0, 7, 0, 1, 0, 0, 0, 1, // item 7, construction_method 1, dref 0, one extent
            0, 0, 0, 3, 0, 0, 0, 0, // offset 3, length 0
        ];
        let read = read_iloc(&payload, &strict()).unwrap();
        assert_eq!(read[0].construction_method, ConstructionMethod::Idat);
        assert_eq!(read[0].extents[0], ExtentRange::ToEnd(3..));
    }

    #[test]
    fn iloc_trailing_bytes() {
        let mut payload = write_iloc(&[WrittenLocation { item_id: 1, offset: 0, length: 1 }], false)
            .unwrap()
            .data()
            .unwrap()
            .to_vec();
        payload.push(0);
        assert!(matches!(
            read_iloc(&payload, &strict()),
            Err(Error::MalformedBox { reason: "invalid iloc size", .. })
        ));
    }

    #[test]
    fn infe_fields() {
        let entries = [ItemInfoEntry {
            item_id: 3,
            item_type: FourCC::new(*b"hvc1"),
            protection_index: 0,
            name: TryVec::from(b"thumb".to_vec()),
            hidden: true,
        }];
        let iinf = write_iinf(&entries).unwrap();
        let read = read_leaf(&iinf, |p| read_iinf(p, &strict())).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].item_id, 3);
        assert_eq!(read[0].item_type, b"hvc1");
        assert_eq!(&read[0].name[..], b"thumb");
        assert!(read[0].hidden);
    }

    #[test]
    fn ipma_index_width_follows_property_count() {
        let items = [ItemAssociations {
            item_id: 1,
            entries: TryVec::from(vec![(true, 1), (false, 2)]),
        }];
        let narrow = write_ipma(&items, 2).unwrap();
        assert_eq!(narrow.data().unwrap()[3], 0);
        let wide = write_ipma(&items, 200).unwrap();
        assert_eq!(wide.data().unwrap()[3], 1);
        for b in [narrow, wide] {
            let read = read_leaf(&b, read_ipma).unwrap();
            assert_eq!(
                read[..],
                [
                    Association { item_id: 1, essential: true, property_index: 1 },
                    Association { item_id: 1, essential: false, property_index: 2 },
                ]
            );
        }
        assert!(matches!(write_ipma(&items, 0x8000), Err(Error::Unsupported(_))));
    }

    #[test]
    fn iref_wide_ids() {
        let refs = [SingleItemTypeReference {
            reference_type: FourCC::new(*b"thmb"),
            from_item_id: 0x2_0000,
            to_item_ids: TryVec::from(vec![1]),
        }];
        let b = write_iref(&refs).unwrap();
        assert_eq!(b.data().unwrap()[0], 1);
        let read = read_leaf(&b, |p| read_iref(p, &strict())).unwrap();
        assert_eq!(read[0].from_item_id, 0x2_0000);
        assert_eq!(read[0].to_item_ids[..], [1]);
        assert_eq!(read[0].reference_type, b"thmb");
    }

    #[test]
    fn transform_properties() {
        assert_eq!(read_irot(&[3]).unwrap(), ItemProperty::Rotation(3));
        assert!(read_irot(&[0x80]).is_err());
        assert_eq!(read_imir(&[1]).unwrap(), ItemProperty::Mirror(MirrorAxis::Horizontal));
        assert!(read_imir(&[1, 0]).is_err());
        let b = write_property(&ItemProperty::Mirror(MirrorAxis::Vertical)).unwrap();
        assert_eq!(b.data(), Some(&[0u8][..]));
    }

    #[test]
    fn pixi_trailing_bytes_need_lenient() {
        let payload = [0, 0, 0, 0, 3, 8, 8, 8, 0xAA];
        assert!(read_pixi(&payload, &strict()).is_err());
        let channels = read_pixi(&payload, &ParseOptions { lenient: true }).unwrap();
        assert_eq!(&channels[..], &[8, 8, 8]);
        assert!(read_pixi(&[0, 0, 0, 0, 17], &strict()).is_err());
    }

    #[test]
    fn ispe_rejects_zero() {
        assert!(read_ispe(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], &strict()).is_err());
        let size = read_ispe(&[0, 0, 0, 0, 0, 0, 7, 128, 0, 0, 4, 56], &strict()).unwrap();
        assert_eq!(size, ImageSize { width: 1920, height: 1080 });
    }

    #[test]
    fn hdlr_round_trip() {
        let b = write_hdlr(FourCC::new(*b"pict")).unwrap();
        assert_eq!(read_leaf(&b, |p| read_hdlr(p, &strict())).unwrap(), b"pict");
    }
}
