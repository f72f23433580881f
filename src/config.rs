// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoder configuration records and the per-codec strategy table.
//!
//! Serialization writes reserved bits with their specified values (all
//! ones, except the single zero bit ahead of each `hvcC` NAL unit type), so
//! records parsed from canonical input serialize back byte for byte and any
//! other input serializes to the equivalent canonical form.

use crate::bmff::{be_u16, put_u16, put_u32, take};
use crate::boxes::FourCC;
use crate::store::ItemId;
use crate::{Error, Result, ToUsize, TryVec};
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::debug;
use std::convert::TryFrom;

/// Coding format of an image item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Avc,
    Hevc,
    Jpeg,
}

/// What the container needs to know about one codec.
#[derive(Debug)]
pub struct CodecStrategy {
    pub codec: Codec,
    /// `infe` item type of coded items.
    pub item_type: FourCC,
    /// `ipco` property box holding the decoder configuration.
    pub config_box: FourCC,
    /// `ftyp` brand advertising items of this codec.
    pub brand: FourCC,
    accepts: fn(&DecoderConfigRecord) -> bool,
}

impl CodecStrategy {
    /// Whether items of this codec can be decoded with `record`.
    pub fn accepts(&self, record: &DecoderConfigRecord) -> bool {
        (self.accepts)(record)
    }

    pub(crate) fn check(&self, item: Option<ItemId>, record: &DecoderConfigRecord) -> Result<()> {
        if self.accepts(record) {
            Ok(())
        } else {
            Err(Error::ConfigTypeMismatch {
                item,
                codec: self.codec,
                config: record.codec(),
            })
        }
    }
}

fn accepts_avc(record: &DecoderConfigRecord) -> bool {
    matches!(record, DecoderConfigRecord::Avc(c) if c.length_size_minus_one != 2)
}

fn accepts_hevc(record: &DecoderConfigRecord) -> bool {
    matches!(record, DecoderConfigRecord::Hevc(c) if c.length_size_minus_one != 2)
}

fn accepts_jpeg(record: &DecoderConfigRecord) -> bool {
    matches!(record, DecoderConfigRecord::Jpeg(_))
}

static STRATEGIES: [CodecStrategy; 3] = [
    CodecStrategy {
        codec: Codec::Avc,
        item_type: FourCC::new(*b"avc1"),
        config_box: FourCC::new(*b"avcC"),
        brand: FourCC::new(*b"avci"),
        accepts: accepts_avc,
    },
    CodecStrategy {
        codec: Codec::Hevc,
        item_type: FourCC::new(*b"hvc1"),
        config_box: FourCC::new(*b"hvcC"),
        brand: FourCC::new(*b"heic"),
        accepts: accepts_hevc,
    },
    CodecStrategy {
        codec: Codec::Jpeg,
        item_type: FourCC::new(*b"jpeg"),
        config_box: FourCC::new(*b"jpgC"),
        brand: FourCC::new(*b"jpeg"),
        accepts: accepts_jpeg,
    },
];

impl Codec {
    pub const ALL: [Self; 3] = [Self::Avc, Self::Hevc, Self::Jpeg];

    pub fn strategy(self) -> &'static CodecStrategy {
        match self {
            Self::Avc => &STRATEGIES[0],
            Self::Hevc => &STRATEGIES[1],
            Self::Jpeg => &STRATEGIES[2],
        }
    }

    pub fn item_type(self) -> FourCC {
        self.strategy().item_type
    }

    pub fn config_box(self) -> FourCC {
        self.strategy().config_box
    }

    pub fn brand(self) -> FourCC {
        self.strategy().brand
    }

    /// Codec whose item type is `item_type`.
    pub fn from_item_type(item_type: FourCC) -> Option<Self> {
        STRATEGIES.iter().find(|s| s.item_type == item_type).map(|s| s.codec)
    }

    /// Codec named by an item type or a configuration box type.
    pub fn from_tag(tag: FourCC) -> Option<Self> {
        STRATEGIES
            .iter()
            .find(|s| s.item_type == tag || s.config_box == tag)
            .map(|s| s.codec)
    }
}

/// AVC decoder configuration record, `avcC`.
/// See ISO/IEC 14496-15:2014 § 5.3.3.1
#[derive(Debug, PartialEq)]
pub struct AvcConfig {
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub length_size_minus_one: u8,
    pub sequence_parameter_sets: TryVec<TryVec<u8>>,
    pub picture_parameter_sets: TryVec<TryVec<u8>>,
    /// Only present for the High profiles, and only when the record carries it.
    pub high_profile: Option<AvcHighProfileExt>,
}

#[derive(Debug, PartialEq)]
pub struct AvcHighProfileExt {
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub sequence_parameter_set_exts: TryVec<TryVec<u8>>,
}

impl AvcConfig {
    /// A record with one SPS and one PPS, taking profile and level from the SPS.
    pub fn from_parameter_sets(sps: &[u8], pps: &[u8]) -> Result<Self> {
        let header = sps.get(1..4).ok_or(Error::MalformedConfig("sequence parameter set too short"))?;
        let mut sequence_parameter_sets = TryVec::new();
        sequence_parameter_sets.push(copy_nal(sps)?)?;
        let mut picture_parameter_sets = TryVec::new();
        picture_parameter_sets.push(copy_nal(pps)?)?;
        Ok(Self {
            profile_indication: header[0],
            profile_compatibility: header[1],
            level_indication: header[2],
            length_size_minus_one: 3,
            sequence_parameter_sets,
            picture_parameter_sets,
            high_profile: None,
        })
    }

    fn has_high_profile_ext(profile: u8) -> bool {
        matches!(profile, 100 | 110 | 122 | 144)
    }

    fn read(src: &mut &[u8]) -> Result<Self> {
        let version = src.read_u8()?;
        if version != 1 {
            return Err(Error::MalformedConfig("avcC version must be 1"));
        }
        let profile_indication = src.read_u8()?;
        let profile_compatibility = src.read_u8()?;
        let level_indication = src.read_u8()?;

        let mut bits = BitReader::new(take(src, 2)?);
        let _reserved = bits.read_u8(6)?;
        let length_size_minus_one = bits.read_u8(2)?;
        let _reserved = bits.read_u8(3)?;
        let sps_count = bits.read_u8(5)?;

        let sequence_parameter_sets = read_nal_list(src, sps_count.into())?;
        let pps_count = src.read_u8()?;
        let picture_parameter_sets = read_nal_list(src, pps_count.into())?;

        let high_profile = if Self::has_high_profile_ext(profile_indication) && !src.is_empty() {
            let mut bits = BitReader::new(take(src, 3)?);
            let _reserved = bits.read_u8(6)?;
            let chroma_format = bits.read_u8(2)?;
            let _reserved = bits.read_u8(5)?;
            let bit_depth_luma_minus8 = bits.read_u8(3)?;
            let _reserved = bits.read_u8(5)?;
            let bit_depth_chroma_minus8 = bits.read_u8(3)?;
            let ext_count = src.read_u8()?;
            Some(AvcHighProfileExt {
                chroma_format,
                bit_depth_luma_minus8,
                bit_depth_chroma_minus8,
                sequence_parameter_set_exts: read_nal_list(src, ext_count.into())?,
            })
        } else {
            None
        };

        if !src.is_empty() {
            return Err(Error::MalformedConfig("trailing bytes after avcC parameter sets"));
        }

        debug!(
            "avcC: profile={profile_indication}, level={level_indication}, length_size={}, {} SPS, {} PPS",
            length_size_minus_one + 1,
            sequence_parameter_sets.len(),
            picture_parameter_sets.len()
        );

        Ok(Self {
            profile_indication,
            profile_compatibility,
            level_indication,
            length_size_minus_one,
            sequence_parameter_sets,
            picture_parameter_sets,
            high_profile,
        })
    }

    fn write(&self, dst: &mut std::vec::Vec<u8>) -> Result<()> {
        check_width(self.length_size_minus_one.into(), 2, "lengthSizeMinusOne exceeds 2 bits")?;
        let sps_count = u8::try_from(self.sequence_parameter_sets.len())
            .ok()
            .filter(|&n| n < 32)
            .ok_or(Error::MalformedConfig("more than 31 sequence parameter sets"))?;
        let pps_count = u8::try_from(self.picture_parameter_sets.len())
            .map_err(|_| Error::MalformedConfig("more than 255 picture parameter sets"))?;

        dst.extend_from_slice(&[
            1,
            self.profile_indication,
            self.profile_compatibility,
            self.level_indication,
            0xFC | self.length_size_minus_one,
            0xE0 | sps_count,
        ]);
        write_nal_list(dst, &self.sequence_parameter_sets)?;
        dst.push(pps_count);
        write_nal_list(dst, &self.picture_parameter_sets)?;

        if let Some(ext) = &self.high_profile {
            if !Self::has_high_profile_ext(self.profile_indication) {
                return Err(Error::MalformedConfig("avcC extension requires a High profile"));
            }
            check_width(ext.chroma_format.into(), 2, "chroma_format exceeds 2 bits")?;
            check_width(ext.bit_depth_luma_minus8.into(), 3, "bit_depth_luma_minus8 exceeds 3 bits")?;
            check_width(ext.bit_depth_chroma_minus8.into(), 3, "bit_depth_chroma_minus8 exceeds 3 bits")?;
            let ext_count = u8::try_from(ext.sequence_parameter_set_exts.len())
                .map_err(|_| Error::MalformedConfig("more than 255 sequence parameter set extensions"))?;
            dst.extend_from_slice(&[
                0xFC | ext.chroma_format,
                0xF8 | ext.bit_depth_luma_minus8,
                0xF8 | ext.bit_depth_chroma_minus8,
                ext_count,
            ]);
            write_nal_list(dst, &ext.sequence_parameter_set_exts)?;
        }
        Ok(())
    }
}

/// HEVC decoder configuration record, `hvcC`.
/// See ISO/IEC 14496-15:2014 § 8.3.3.1
#[derive(Debug, PartialEq)]
pub struct HevcConfig {
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    /// 48 bits
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size_minus_one: u8,
    pub arrays: TryVec<HevcNalArray>,
}

#[derive(Debug, PartialEq)]
pub struct HevcNalArray {
    pub array_completeness: bool,
    pub nal_unit_type: u8,
    pub nal_units: TryVec<TryVec<u8>>,
}

impl HevcConfig {
    const FIXED_LEN: usize = 23;

    fn read(src: &mut &[u8]) -> Result<Self> {
        let mut bits = BitReader::new(take(src, Self::FIXED_LEN)?);
        let version = bits.read_u8(8)?;
        if version != 1 {
            return Err(Error::MalformedConfig("hvcC version must be 1"));
        }
        let general_profile_space = bits.read_u8(2)?;
        let general_tier_flag = bits.read_bool()?;
        let general_profile_idc = bits.read_u8(5)?;
        let general_profile_compatibility_flags = bits.read_u32(32)?;
        let general_constraint_indicator_flags = bits.read_u64(48)?;
        let general_level_idc = bits.read_u8(8)?;
        let _reserved = bits.read_u8(4)?;
        let min_spatial_segmentation_idc = bits.read_u16(12)?;
        let _reserved = bits.read_u8(6)?;
        let parallelism_type = bits.read_u8(2)?;
        let _reserved = bits.read_u8(6)?;
        let chroma_format_idc = bits.read_u8(2)?;
        let _reserved = bits.read_u8(5)?;
        let bit_depth_luma_minus8 = bits.read_u8(3)?;
        let _reserved = bits.read_u8(5)?;
        let bit_depth_chroma_minus8 = bits.read_u8(3)?;
        let avg_frame_rate = bits.read_u16(16)?;
        let constant_frame_rate = bits.read_u8(2)?;
        let num_temporal_layers = bits.read_u8(3)?;
        let temporal_id_nested = bits.read_bool()?;
        let length_size_minus_one = bits.read_u8(2)?;
        let num_of_arrays = bits.read_u8(8)?;
        debug_assert_eq!(bits.remaining(), 0);

        let mut arrays = TryVec::with_capacity(num_of_arrays.into())?;
        for _ in 0..num_of_arrays {
            let mut bits = BitReader::new(take(src, 1)?);
            let array_completeness = bits.read_bool()?;
            let _reserved = bits.read_bool()?;
            let nal_unit_type = bits.read_u8(6)?;
            let count = be_u16(src)?;
            arrays.push(HevcNalArray {
                array_completeness,
                nal_unit_type,
                nal_units: read_nal_list(src, count.to_usize())?,
            })?;
        }

        if !src.is_empty() {
            return Err(Error::MalformedConfig("trailing bytes after hvcC arrays"));
        }

        debug!(
            "hvcC: profile={general_profile_idc}, level={general_level_idc}, length_size={}, {} arrays",
            length_size_minus_one + 1,
            arrays.len()
        );

        Ok(Self {
            general_profile_space,
            general_tier_flag,
            general_profile_idc,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format_idc,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            avg_frame_rate,
            constant_frame_rate,
            num_temporal_layers,
            temporal_id_nested,
            length_size_minus_one,
            arrays,
        })
    }

    fn write(&self, dst: &mut std::vec::Vec<u8>) -> Result<()> {
        check_width(self.general_profile_space.into(), 2, "general_profile_space exceeds 2 bits")?;
        check_width(self.general_profile_idc.into(), 5, "general_profile_idc exceeds 5 bits")?;
        check_width(self.general_constraint_indicator_flags, 48, "constraint flags exceed 48 bits")?;
        check_width(self.min_spatial_segmentation_idc.into(), 12, "min_spatial_segmentation_idc exceeds 12 bits")?;
        check_width(self.parallelism_type.into(), 2, "parallelismType exceeds 2 bits")?;
        check_width(self.chroma_format_idc.into(), 2, "chroma_format_idc exceeds 2 bits")?;
        check_width(self.bit_depth_luma_minus8.into(), 3, "bit_depth_luma_minus8 exceeds 3 bits")?;
        check_width(self.bit_depth_chroma_minus8.into(), 3, "bit_depth_chroma_minus8 exceeds 3 bits")?;
        check_width(self.constant_frame_rate.into(), 2, "constantFrameRate exceeds 2 bits")?;
        check_width(self.num_temporal_layers.into(), 3, "numTemporalLayers exceeds 3 bits")?;
        check_width(self.length_size_minus_one.into(), 2, "lengthSizeMinusOne exceeds 2 bits")?;
        let num_of_arrays =
            u8::try_from(self.arrays.len()).map_err(|_| Error::MalformedConfig("more than 255 hvcC arrays"))?;

        dst.push(1);
        dst.push(self.general_profile_space << 6 | u8::from(self.general_tier_flag) << 5 | self.general_profile_idc);
        put_u32(dst, self.general_profile_compatibility_flags)?;
        dst.extend_from_slice(&self.general_constraint_indicator_flags.to_be_bytes()[2..]);
        dst.push(self.general_level_idc);
        put_u16(dst, 0xF000 | self.min_spatial_segmentation_idc)?;
        dst.extend_from_slice(&[
            0xFC | self.parallelism_type,
            0xFC | self.chroma_format_idc,
            0xF8 | self.bit_depth_luma_minus8,
            0xF8 | self.bit_depth_chroma_minus8,
        ]);
        put_u16(dst, self.avg_frame_rate)?;
        dst.push(
            self.constant_frame_rate << 6
                | self.num_temporal_layers << 3
                | u8::from(self.temporal_id_nested) << 2
                | self.length_size_minus_one,
        );
        dst.push(num_of_arrays);

        for array in self.arrays.iter() {
            check_width(array.nal_unit_type.into(), 6, "NAL_unit_type exceeds 6 bits")?;
            let count = u16::try_from(array.nal_units.len())
                .map_err(|_| Error::MalformedConfig("more than 65535 NAL units in an hvcC array"))?;
            dst.push(u8::from(array.array_completeness) << 7 | array.nal_unit_type);
            put_u16(dst, count)?;
            write_nal_list(dst, &array.nal_units)?;
        }
        Ok(())
    }
}

/// JPEG decoder configuration, `jpgC`: a JPEG prefix (tables, frame header)
/// shared by the item payloads, kept verbatim.
#[derive(Debug, PartialEq)]
pub struct JpegConfig {
    pub prefix: TryVec<u8>,
}

/// Codec-specific configuration needed to decode an item's payload.
#[derive(Debug, PartialEq)]
pub enum DecoderConfigRecord {
    Avc(AvcConfig),
    Hevc(HevcConfig),
    Jpeg(JpegConfig),
}

impl DecoderConfigRecord {
    /// Parse a record. `codec_tag` is either the item type (`avc1`, `hvc1`,
    /// `jpeg`) or the configuration box type (`avcC`, `hvcC`, `jpgC`).
    pub fn parse(codec_tag: FourCC, bytes: &[u8]) -> Result<Self> {
        let codec = Codec::from_tag(codec_tag).ok_or(Error::UnsupportedCodec(codec_tag))?;
        Self::parse_for(codec, bytes)
    }

    pub(crate) fn parse_for(codec: Codec, bytes: &[u8]) -> Result<Self> {
        let mut src = bytes;
        let record = match codec {
            Codec::Avc => AvcConfig::read(&mut src).map(Self::Avc),
            Codec::Hevc => HevcConfig::read(&mut src).map(Self::Hevc),
            Codec::Jpeg => {
                let mut prefix = TryVec::with_capacity(bytes.len())?;
                prefix.extend_from_slice(bytes)?;
                Ok(Self::Jpeg(JpegConfig { prefix }))
            },
        };
        record.map_err(|e| match e {
            Error::UnexpectedEOF => Error::MalformedConfig("length prefix overruns the record"),
            Error::MalformedBox { .. } => Error::MalformedConfig("truncated record"),
            e => e,
        })
    }

    /// Canonical byte layout, the payload of the configuration box.
    pub fn serialize(&self) -> Result<TryVec<u8>> {
        let mut dst = std::vec::Vec::new();
        dst.try_reserve(self.serialized_len_hint())?;
        match self {
            Self::Avc(c) => c.write(&mut dst)?,
            Self::Hevc(c) => c.write(&mut dst)?,
            Self::Jpeg(c) => dst.extend_from_slice(&c.prefix),
        }
        Ok(dst.into())
    }

    fn serialized_len_hint(&self) -> usize {
        let nal_bytes: usize = match self.nal_units() {
            Ok(units) => units.iter().map(|n| n.len() + 2).sum(),
            Err(_) => 0,
        };
        match self {
            Self::Avc(_) => 11 + nal_bytes,
            Self::Hevc(c) => HevcConfig::FIXED_LEN + 3 * c.arrays.len() + nal_bytes,
            Self::Jpeg(c) => c.prefix.len(),
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            Self::Avc(_) => Codec::Avc,
            Self::Hevc(_) => Codec::Hevc,
            Self::Jpeg(_) => Codec::Jpeg,
        }
    }

    /// Size in bytes of the NAL unit length prefix in item payloads.
    pub fn length_size(&self) -> Option<u8> {
        match self {
            Self::Avc(c) => Some(c.length_size_minus_one + 1),
            Self::Hevc(c) => Some(c.length_size_minus_one + 1),
            Self::Jpeg(_) => None,
        }
    }

    /// Every parameter set NAL unit, in record order.
    pub fn nal_units(&self) -> Result<TryVec<&[u8]>> {
        let mut units = TryVec::new();
        match self {
            Self::Avc(c) => {
                for nal in c.sequence_parameter_sets.iter().chain(c.picture_parameter_sets.iter()) {
                    units.push(&nal[..])?;
                }
                if let Some(ext) = &c.high_profile {
                    for nal in ext.sequence_parameter_set_exts.iter() {
                        units.push(&nal[..])?;
                    }
                }
            },
            Self::Hevc(c) => {
                for nal in c.arrays.iter().flat_map(|a| a.nal_units.iter()) {
                    units.push(&nal[..])?;
                }
            },
            Self::Jpeg(_) => {},
        }
        Ok(units)
    }

    /// Sequence parameter sets of AVC and HEVC (`nal_unit_type` 33) records.
    pub fn sequence_parameter_sets(&self) -> Result<TryVec<&[u8]>> {
        self.nal_units_of(|c| &c.sequence_parameter_sets, 33)
    }

    /// Picture parameter sets of AVC and HEVC (`nal_unit_type` 34) records.
    pub fn picture_parameter_sets(&self) -> Result<TryVec<&[u8]>> {
        self.nal_units_of(|c| &c.picture_parameter_sets, 34)
    }

    fn nal_units_of(&self, avc: fn(&AvcConfig) -> &TryVec<TryVec<u8>>, hevc_type: u8) -> Result<TryVec<&[u8]>> {
        let mut units = TryVec::new();
        match self {
            Self::Avc(c) => {
                for nal in avc(c).iter() {
                    units.push(&nal[..])?;
                }
            },
            Self::Hevc(c) => {
                let arrays = c.arrays.iter().filter(|a| a.nal_unit_type == hevc_type);
                for nal in arrays.flat_map(|a| a.nal_units.iter()) {
                    units.push(&nal[..])?;
                }
            },
            Self::Jpeg(_) => {},
        }
        Ok(units)
    }
}

fn copy_nal(nal: &[u8]) -> Result<TryVec<u8>> {
    let mut copy = TryVec::with_capacity(nal.len())?;
    copy.extend_from_slice(nal)?;
    Ok(copy)
}

fn read_nal_list(src: &mut &[u8], count: usize) -> Result<TryVec<TryVec<u8>>> {
    let mut list = TryVec::with_capacity(count.min(src.len() / 2))?;
    for _ in 0..count {
        let len = be_u16(src)?.to_usize();
        list.push(copy_nal(take(src, len)?)?)?;
    }
    Ok(list)
}

fn write_nal_list(dst: &mut std::vec::Vec<u8>, list: &[TryVec<u8>]) -> Result<()> {
    for nal in list {
        let len = u16::try_from(nal.len()).map_err(|_| Error::MalformedConfig("NAL unit longer than 65535 bytes"))?;
        put_u16(dst, len)?;
        dst.extend_from_slice(nal);
    }
    Ok(())
}

fn check_width(value: u64, bits: u32, reason: &'static str) -> Result<()> {
    if value >> bits == 0 {
        Ok(())
    } else {
        Err(Error::MalformedConfig(reason))
    }
}
