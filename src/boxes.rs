// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// Four-character code identifying box types, item types, brands and
/// reference types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    pub const fn new(value: [u8; 4]) -> Self {
        Self { value }
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.value)
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(value: &[u8; 4]) -> Self {
        Self { value: *value }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => write!(f, "0x{:08x}", self.to_u32()),
        }
    }
}

/// How the payload of a box is laid out for the generic box codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxLayout {
    /// Opaque bytes, interpreted by a box-specific reader.
    Leaf,
    /// Nothing but nested boxes.
    Container,
    /// A version/flags word followed by nested boxes.
    FullContainer,
}

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),* $(,)?) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                $(if t == u32::from_be_bytes(*$boxtype) {
                    return Self::$boxenum;
                })*
                Self::UnknownBox(t)
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> Self {
                match b {
                    $(BoxType::$boxenum => u32::from_be_bytes(*$boxtype)),*,
                    BoxType::UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fourcc.fmt(f)
            }
        }
    };
}

box_database!(
    FileTypeBox b"ftyp",
    MediaDataBox b"mdat",
    MetadataBox b"meta",
    HandlerBox b"hdlr",
    PrimaryItemBox b"pitm",
    ItemInfoBox b"iinf",
    ItemInfoEntry b"infe",
    ItemLocationBox b"iloc",
    ItemReferenceBox b"iref",
    ItemDataBox b"idat",
    ItemProtectionBox b"ipro",
    DataInformationBox b"dinf",
    GroupsListBox b"grpl",
    ImagePropertiesBox b"iprp",
    ItemPropertyContainerBox b"ipco",
    ItemPropertyAssociationBox b"ipma",
    ImageSpatialExtentsBox b"ispe",
    PixelInformationBox b"pixi",
    ImageRotationBox b"irot",
    ImageMirrorBox b"imir",
    AuxiliaryTypeProperty b"auxC",
    AVCConfigurationBox b"avcC",
    HEVCConfigurationBox b"hvcC",
    JPEGConfigurationBox b"jpgC",
    MovieBox b"moov",
    FreeSpaceBox b"free",
    SkipBox b"skip",
    UuidBox b"uuid",
);

impl BoxType {
    /// Payload layout used when decoding this box into a tree.
    pub fn layout(self) -> BoxLayout {
        match self {
            Self::ImagePropertiesBox
            | Self::ItemPropertyContainerBox
            | Self::DataInformationBox
            | Self::GroupsListBox
            | Self::MovieBox => BoxLayout::Container,
            Self::MetadataBox => BoxLayout::FullContainer,
            _ => BoxLayout::Leaf,
        }
    }
}

impl From<FourCC> for BoxType {
    fn from(fourcc: FourCC) -> Self {
        Self::from(fourcc.to_u32())
    }
}

impl PartialEq<&[u8; 4]> for BoxType {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        u32::from(*self) == u32::from_be_bytes(**other)
    }
}
