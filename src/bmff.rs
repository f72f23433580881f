// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic box tree codec.
//!
//! ISO BMFF files are a sequence of possibly-nested boxes. Each box begins
//! with a header holding the length of the box and a four-byte type. This
//! module turns bytes into [`BmffBox`] trees and back without knowing what
//! any particular leaf payload means.
//!
//! See ISO 14496-12:2015 § 4.2

use crate::boxes::{BoxLayout, BoxType, FourCC};
use crate::{Error, ParseOptions, Result, ToU64, TryVec};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::convert::TryFrom;

/// Basic ISO box header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub(crate) name: BoxType,
    /// Size of the box in bytes, header included. `u64::MAX` when the box
    /// extends to the end of the enclosing buffer.
    pub(crate) size: u64,
    /// Offset to the start of the contained data (or header size).
    pub(crate) offset: u64,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub(crate) const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub(crate) const MIN_LARGE_SIZE: u64 = 16;
}

/// Read and parse a box header.
///
/// The `uuid` extended type, when present, is left in the payload so that
/// it survives a decode/encode cycle untouched.
pub(crate) fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // Only valid for a top-level box: the box extends to the end of the file.
        0 => u64::MAX,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::MalformedBox {
                    box_type: Some(name.into()),
                    reason: "malformed wide size",
                });
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::MalformedBox {
                    box_type: Some(name.into()),
                    reason: "malformed size",
                });
            }
            u64::from(size32)
        },
    };
    let offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    Ok(BoxHeader { name, size, offset })
}

/// A decoded box.
#[derive(Debug, PartialEq)]
pub struct BmffBox {
    pub box_type: FourCC,
    pub content: BoxContent,
}

/// Payload of a [`BmffBox`].
#[derive(Debug, PartialEq)]
pub enum BoxContent {
    Data(TryVec<u8>),
    Children(TryVec<BmffBox>),
    FullChildren {
        version: u8,
        flags: u32,
        children: TryVec<BmffBox>,
    },
}

impl BmffBox {
    /// A leaf box holding a copy of `payload`.
    pub fn leaf(box_type: impl Into<FourCC>, payload: &[u8]) -> Result<Self> {
        let mut data = TryVec::with_capacity(payload.len())?;
        data.extend_from_slice(payload)?;
        Ok(Self { box_type: box_type.into(), content: BoxContent::Data(data) })
    }

    pub fn with_data(box_type: impl Into<FourCC>, data: TryVec<u8>) -> Self {
        Self { box_type: box_type.into(), content: BoxContent::Data(data) }
    }

    pub fn container(box_type: impl Into<FourCC>, children: TryVec<Self>) -> Self {
        Self { box_type: box_type.into(), content: BoxContent::Children(children) }
    }

    pub fn full_container(box_type: impl Into<FourCC>, version: u8, flags: u32, children: TryVec<Self>) -> Self {
        Self {
            box_type: box_type.into(),
            content: BoxContent::FullChildren { version, flags, children },
        }
    }

    pub fn name(&self) -> BoxType {
        BoxType::from(self.box_type)
    }

    /// Leaf payload, or `None` for container boxes.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.content {
            BoxContent::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Nested boxes, empty for leaf boxes.
    pub fn children(&self) -> &[Self] {
        match &self.content {
            BoxContent::Data(_) => &[],
            BoxContent::Children(children) | BoxContent::FullChildren { children, .. } => children,
        }
    }

    /// Number of payload bytes this box encodes to, excluding its own header.
    pub fn payload_len(&self) -> u64 {
        match &self.content {
            BoxContent::Data(data) => data.len().to_u64(),
            BoxContent::Children(children) => children.iter().map(Self::encoded_len).sum(),
            BoxContent::FullChildren { children, .. } => {
                4 + children.iter().map(Self::encoded_len).sum::<u64>()
            },
        }
    }

    /// Number of bytes this box encodes to, header included.
    pub fn encoded_len(&self) -> u64 {
        let payload = self.payload_len();
        header_len(payload) + payload
    }
}

/// Header length the encoder picks for a payload of `payload_len` bytes.
pub fn header_len(payload_len: u64) -> u64 {
    if payload_len + BoxHeader::MIN_SIZE > u64::from(u32::MAX) {
        BoxHeader::MIN_LARGE_SIZE
    } else {
        BoxHeader::MIN_SIZE
    }
}

/// Write a box header for a payload of `payload_len` bytes, choosing the
/// 64-bit size form only when the box does not fit the 32-bit field.
pub(crate) fn write_box_header<W: WriteBytesExt>(dst: &mut W, box_type: FourCC, payload_len: u64) -> Result<()> {
    let total = header_len(payload_len)
        .checked_add(payload_len)
        .ok_or(Error::Unsupported("box too large"))?;
    if total > u64::from(u32::MAX) {
        put_u32(dst, 1)?;
        put_u32(dst, box_type.to_u32())?;
        put_u64(dst, total)
    } else {
        put_u32(dst, u32::try_from(total)?)?;
        put_u32(dst, box_type.to_u32())
    }
}

/// Serialize a box tree. Sizes are always recomputed from the content.
pub fn encode(b: &BmffBox) -> Result<std::vec::Vec<u8>> {
    let mut out = std::vec::Vec::new();
    encode_into(b, &mut out)?;
    Ok(out)
}

/// Append the serialization of `b` to `dst`.
pub fn encode_into(b: &BmffBox, dst: &mut std::vec::Vec<u8>) -> Result<()> {
    check_layout(b)?;
    dst.try_reserve(usize::try_from(b.encoded_len())?)?;
    write_box(b, dst)
}

/// Reject content shapes that would decode differently, so that nothing
/// is written for a tree that cannot round-trip.
fn check_layout(b: &BmffBox) -> Result<()> {
    let layout_matches = matches!(
        (&b.content, b.name().layout()),
        (BoxContent::Data(_), BoxLayout::Leaf)
            | (BoxContent::Children(_), BoxLayout::Container)
            | (BoxContent::FullChildren { .. }, BoxLayout::FullContainer)
    );
    if !layout_matches {
        return Err(Error::MalformedBox {
            box_type: Some(b.box_type),
            reason: "content does not match the box layout",
        });
    }
    b.children().iter().try_for_each(check_layout)
}

fn write_box(b: &BmffBox, dst: &mut std::vec::Vec<u8>) -> Result<()> {
    write_box_header(dst, b.box_type, b.payload_len())?;
    match &b.content {
        BoxContent::Data(data) => dst.extend_from_slice(data),
        BoxContent::Children(children) => {
            for child in children.iter() {
                write_box(child, dst)?;
            }
        },
        BoxContent::FullChildren { version, flags, children } => {
            write_fullbox_extra(dst, *version, *flags)?;
            for child in children.iter() {
                write_box(child, dst)?;
            }
        },
    }
    Ok(())
}

/// Decode a buffer holding a sequence of top-level boxes.
pub fn decode(bytes: &[u8]) -> BoxReader<'_> {
    BoxReader::new(bytes)
}

/// Decode every box of `bytes` into a list.
pub fn decode_all(bytes: &[u8]) -> Result<TryVec<BmffBox>> {
    let mut boxes = TryVec::new();
    for b in decode(bytes) {
        boxes.push(b?)?;
    }
    Ok(boxes)
}

/// A decoded box along with where its payload sits in the buffer.
#[derive(Debug)]
pub struct LocatedBox {
    /// Offset of the first header byte.
    pub offset: u64,
    /// Offset of the first payload byte.
    pub payload_offset: u64,
    /// Number of payload bytes.
    pub payload_len: u64,
    pub bmff: BmffBox,
}

/// Lazy iterator over the boxes of a buffer.
///
/// Yields each box once; stops for good after the first error. A new
/// reader can be started at any box boundary with [`BoxReader::at`].
pub struct BoxReader<'a> {
    data: &'a [u8],
    offset: usize,
    top_level: bool,
    failed: bool,
}

impl<'a> BoxReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0)
    }

    /// Resume decoding at `offset`, which must be the start of a top-level box.
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset: offset.min(data.len()), top_level: true, failed: false }
    }

    fn nested(data: &'a [u8]) -> Self {
        Self { data, offset: 0, top_level: false, failed: false }
    }

    /// Offset of the next box to be read.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Read the next box along with its position.
    pub fn next_located(&mut self) -> Result<Option<LocatedBox>> {
        let Some(raw) = self.next_raw()? else {
            return Ok(None);
        };
        match decode_content(raw.name, raw.payload) {
            Ok(content) => Ok(Some(LocatedBox {
                offset: raw.offset,
                payload_offset: raw.payload_offset,
                payload_len: raw.payload.len().to_u64(),
                bmff: BmffBox { box_type: raw.name.into(), content },
            })),
            Err(e) => {
                self.failed = true;
                Err(e)
            },
        }
    }

    /// Read the next box header, borrowing the payload without decoding it.
    pub(crate) fn next_raw(&mut self) -> Result<Option<RawBox<'a>>> {
        if self.failed {
            return Ok(None);
        }
        let r = self.read_raw();
        if r.is_err() {
            self.failed = true;
        }
        r
    }

    fn read_raw(&mut self) -> Result<Option<RawBox<'a>>> {
        let remaining = &self.data[self.offset..];
        if remaining.is_empty() {
            return Ok(None);
        }
        if remaining.len().to_u64() < BoxHeader::MIN_SIZE {
            return Err(Error::MalformedBox {
                box_type: None,
                reason: "trailing bytes shorter than a box header",
            });
        }
        let mut src = remaining;
        let head = match read_box_header(&mut src) {
            Err(Error::UnexpectedEOF) => {
                return Err(Error::MalformedBox {
                    box_type: None,
                    reason: "truncated box header",
                })
            },
            r => r?,
        };
        let size = if head.size == u64::MAX {
            if !self.top_level {
                return Err(Error::MalformedBox {
                    box_type: Some(head.name.into()),
                    reason: "size 0 is only valid for a top-level box",
                });
            }
            remaining.len().to_u64()
        } else {
            head.size
        };
        if size > remaining.len().to_u64() {
            return Err(Error::MalformedBox {
                box_type: Some(head.name.into()),
                reason: "declared size exceeds remaining buffer",
            });
        }
        // `size <= remaining.len()`, so both conversions are lossless.
        let size = usize::try_from(size)?;
        let header_len = usize::try_from(head.offset)?;
        let offset = self.offset.to_u64();
        self.offset += size;
        Ok(Some(RawBox {
            name: head.name,
            offset,
            payload_offset: offset + head.offset,
            payload: &remaining[header_len..size],
        }))
    }
}

/// An undecoded box borrowed from the input buffer.
pub(crate) struct RawBox<'a> {
    pub(crate) name: BoxType,
    pub(crate) offset: u64,
    pub(crate) payload_offset: u64,
    pub(crate) payload: &'a [u8],
}

impl Iterator for BoxReader<'_> {
    type Item = Result<BmffBox>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_located().map(|b| b.map(|b| b.bmff)).transpose()
    }
}

pub(crate) fn decode_content(name: BoxType, payload: &[u8]) -> Result<BoxContent> {
    Ok(match name.layout() {
        BoxLayout::Leaf => {
            let mut data = TryVec::with_capacity(payload.len())?;
            data.extend_from_slice(payload)?;
            BoxContent::Data(data)
        },
        BoxLayout::Container => BoxContent::Children(decode_children(payload)?),
        BoxLayout::FullContainer => {
            let mut src = payload;
            let (version, flags) = read_fullbox_extra(&mut src).map_err(|e| e.in_box(name.into()))?;
            BoxContent::FullChildren { version, flags, children: decode_children(src)? }
        },
    })
}

/// Decode the nested boxes of a container payload.
pub(crate) fn decode_children(payload: &[u8]) -> Result<TryVec<BmffBox>> {
    let mut children = TryVec::new();
    let mut reader = BoxReader::nested(payload);
    while let Some(child) = reader.next_located()? {
        children.push(child.bmff)?;
    }
    Ok(children)
}

/// Parse the extra header fields for a full box.
pub(crate) fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

pub(crate) fn write_fullbox_extra<T: WriteBytesExt>(dst: &mut T, version: u8, flags: u32) -> Result<()> {
    if flags > 0x00FF_FFFF {
        return Err(Error::Unsupported("full box flags must fit in 24 bits"));
    }
    dst.write_u8(version)?;
    dst.write_u24::<BigEndian>(flags).map_err(From::from)
}

// Parse the extra fields for a full box whose flag fields must be zero.
pub(crate) fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T, options: &ParseOptions) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported("expected flags to be 0"));
    }

    Ok(version)
}

/// Fail if a box reader did not consume the whole payload.
pub(crate) fn check_consumed(box_type: BoxType, left: &[u8]) -> Result<()> {
    if left.is_empty() {
        Ok(())
    } else {
        debug!("{} bytes left unread in {:?}", left.len(), box_type);
        Err(Error::MalformedBox {
            box_type: Some(box_type.into()),
            reason: "unread box content or bad parser sync",
        })
    }
}

/// Split `n` bytes off the front of `src`.
pub(crate) fn take<'a>(src: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if src.len() < n {
        return Err(Error::UnexpectedEOF);
    }
    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}

/// Read a null-terminated string.
pub(crate) fn read_c_string<'a>(src: &mut &'a [u8]) -> Result<&'a [u8]> {
    let end = src
        .iter()
        .position(|&b| b == b'\0')
        .ok_or(Error::MalformedBox { box_type: None, reason: "string is not null-terminated" })?;
    let s = take(src, end)?;
    take(src, 1)?;
    Ok(s)
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(From::from)
}

pub(crate) fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(From::from)
}

pub(crate) fn put_u16<T: WriteBytesExt>(dst: &mut T, value: u16) -> Result<()> {
    dst.write_u16::<BigEndian>(value).map_err(From::from)
}

pub(crate) fn put_u32<T: WriteBytesExt>(dst: &mut T, value: u32) -> Result<()> {
    dst.write_u32::<BigEndian>(value).map_err(From::from)
}

pub(crate) fn put_u64<T: WriteBytesExt>(dst: &mut T, value: u64) -> Result<()> {
    dst.write_u64::<BigEndian>(value).map_err(From::from)
}
