// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bmff::{self, header_len, write_box_header, BmffBox, BoxContent, BoxReader};
use crate::boxes::{BoxType, FourCC};
use crate::config::{Codec, DecoderConfigRecord};
use crate::item::{copy_bytes, ConfigSource, ImageItem, ImageItemBuilder, ImageSize, ItemProperty, OpaqueItem};
use crate::meta::{
    self, ConstructionMethod, ExtentRange, FileTypeBox, ItemAssociations, ItemInfoEntry, ItemLocation, Property,
    SingleItemTypeReference, WrittenLocation,
};
use crate::store::{ConfigId, ConfigOwner, ItemId, ItemReference, ItemStore};
use crate::{Error, OpenConfig, ParseOptions, ResourceTracker, Result, ToU64, TryVec};
use fallible_collections::TryClone;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::convert::{TryFrom, TryInto as _};
use std::io::{Read, Write};

const PICT_HANDLER: FourCC = FourCC::new(*b"pict");
const MIF1_BRAND: FourCC = FourCC::new(*b"mif1");
const HEIX_BRAND: FourCC = FourCC::new(*b"heix");

/// A HEIF image container: coded image items, their decoder
/// configurations and the references between items.
///
/// ```rust
/// use heif_store::{Codec, Heif, ImageItemBuilder, ImageSize};
///
/// # fn main() -> heif_store::Result<()> {
/// let mut heif = Heif::new();
/// let item = heif.add_item(ImageItemBuilder::new(Codec::Jpeg).size(ImageSize::new(8, 8)?))?;
///
/// // Neither configuration nor data yet
/// assert!(heif.save().is_err());
///
/// let empty_prefix: &[u8] = &[];
/// heif.set_decoder_config(item, empty_prefix)?;
/// heif.set_item_data(item, &[0xFF, 0xD8, 0xFF, 0xD9])?;
/// let saved = heif.save()?;
/// assert_eq!(Heif::open(&saved)?.primary_item(), Some(item));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Heif {
    store: ItemStore,
    primary_item: Option<ItemId>,
}

/// A top-level `mdat` payload, or the `idat` of the meta box.
struct MediaData<'a> {
    /// Offset of `data` from the start of the file, or of the `idat` payload.
    offset: u64,
    data: &'a [u8],
}

impl<'a> MediaData<'a> {
    /// Check whether the beginning of `extent` is within the bounds of the box.
    /// Extents are not allowed to cross box boundaries.
    fn contains_extent(&self, extent: &ExtentRange) -> bool {
        extent
            .start()
            .checked_sub(self.offset)
            .map_or(false, |start| start < self.data.len().to_u64())
    }

    fn extent(&self, extent: &ExtentRange) -> Result<&'a [u8]> {
        let start = extent
            .start()
            .checked_sub(self.offset)
            .ok_or(Error::MalformedContainer("mdat does not contain extent"))?;
        let slice = match extent {
            ExtentRange::WithLength(range) => {
                let end = start
                    .checked_add(range.end - range.start)
                    .ok_or(Error::MalformedContainer("extent end overflow"))?;
                self.data.get(start.try_into()?..end.try_into()?)
            },
            ExtentRange::ToEnd(_) => self.data.get(start.try_into()?..),
        };
        slice.ok_or(Error::MalformedContainer("extent crosses box boundary"))
    }
}

/// What `open` gathers from the children of `meta`.
#[derive(Default)]
struct MetaParts<'m> {
    handler: Option<FourCC>,
    primary_item_id: Option<u32>,
    item_infos: Option<TryVec<ItemInfoEntry>>,
    iloc_items: Option<TryVec<ItemLocation>>,
    item_references: Option<TryVec<SingleItemTypeReference>>,
    iprp: Option<&'m BmffBox>,
    idat: Option<&'m [u8]>,
}

/// How `open` treats an item listed in `iinf`.
#[derive(Clone, Copy)]
enum Slot {
    /// Index into the pending coded items.
    Coded(usize),
    /// Kept in the store as an [`OpaqueItem`].
    Opaque,
    /// Protected content, dropped along with its references.
    Skipped,
}

/// A coded item being assembled while opening.

struct PendingItem {
    id: u32,
    codec: Codec,
    size: Option<ImageSize>,
    config_index: Option<u16>,
    data: Option<TryVec<u8>>,
    properties: TryVec<ItemProperty>,
    name: TryVec<u8>,
    hidden: bool,
}

fn set_once<T>(slot: &mut Option<T>, value: T, duplicate: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::MalformedContainer(duplicate));
    }
    *slot = Some(value);
    Ok(())
}

fn read_meta<'m>(meta: &'m BmffBox, options: &ParseOptions) -> Result<MetaParts<'m>> {
    match meta.content {
        BoxContent::FullChildren { version: 0, .. } => {},
        _ => return Err(Error::Unsupported("unsupported meta version")),
    }

    let mut parts = MetaParts::default();
    for b in meta.children() {
        match b.name() {
            BoxType::HandlerBox => {
                let handler = meta::read_leaf(b, |p| meta::read_hdlr(p, options))?;
                set_once(&mut parts.handler, handler, "There should be exactly one hdlr box per meta")?;
            },
            BoxType::PrimaryItemBox => {
                let primary = meta::read_leaf(b, |p| meta::read_pitm(p, options))?;
                set_once(&mut parts.primary_item_id, primary, "There should be zero or one pitm boxes")?;
            },
            BoxType::ItemInfoBox => {
                let infos = meta::read_leaf(b, |p| meta::read_iinf(p, options))?;
                set_once(&mut parts.item_infos, infos, "There should be zero or one iinf boxes")?;
            },
            BoxType::ItemLocationBox => {
                let locations = meta::read_leaf(b, |p| meta::read_iloc(p, options))?;
                set_once(&mut parts.iloc_items, locations, "There should be zero or one iloc boxes")?;
            },
            BoxType::ItemReferenceBox => {
                let references = meta::read_leaf(b, |p| meta::read_iref(p, options))?;
                set_once(&mut parts.item_references, references, "There should be zero or one iref boxes")?;
            },
            BoxType::ImagePropertiesBox => {
                set_once(&mut parts.iprp, b, "There should be zero or one iprp boxes")?;
            },
            BoxType::ItemDataBox => {
                let idat = b.data().ok_or(Error::MalformedContainer("idat is not a leaf box"))?;
                set_once(&mut parts.idat, idat, "There should be zero or one idat boxes")?;
            },
            other => debug!("skipping meta child {other:?}"),
        }
    }

    match parts.handler {
        Some(handler) if handler == PICT_HANDLER => Ok(parts),
        Some(handler) => {
            warn!("hdlr handler_type: {handler}");
            Err(Error::MalformedContainer("meta handler type must be 'pict'"))
        },
        None => Err(Error::MalformedContainer("Required hdlr box not present in meta box")),
    }
}

fn accepts_brands(ftyp: &FileTypeBox) -> bool {
    ftyp.has_brand(MIF1_BRAND) || ftyp.has_brand(HEIX_BRAND) || Codec::ALL.iter().any(|c| ftyp.has_brand(c.brand()))
}

impl Heif {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a HEIF file with the default limits.
    pub fn open(bytes: &[u8]) -> Result<Self> {
        Self::open_with_config(bytes, &OpenConfig::default())
    }

    /// Read a whole stream, then parse it with the default limits.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = std::vec::Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::open(&buf)
    }

    /// Parse a HEIF file.
    ///
    /// Items are copied into the store under their identifiers from the
    /// file. Coded items of the supported codecs are decoded into
    /// [`ImageItem`]s; other types (`grid`, `Exif`, `mime`, ...) are kept as
    /// [`OpaqueItem`]s. Protected items are skipped, along with the
    /// references that touch them.
    pub fn open_with_config(bytes: &[u8], config: &OpenConfig) -> Result<Self> {
        let options = config.parse_options();
        let mut tracker = ResourceTracker::new(config);
        let mut reader = BoxReader::new(bytes);

        // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
        match reader.next_raw()? {
            Some(b) if b.name == BoxType::FileTypeBox => {
                let ftyp = meta::read_ftyp(b.payload).map_err(|e| e.in_box(b.name.into()))?;
                if !accepts_brands(&ftyp) {
                    warn!("major_brand: {}", ftyp.major_brand);
                    return Err(Error::MalformedContainer("ftyp carries neither 'mif1' nor a supported codec brand"));
                }
            },
            _ => return Err(Error::MalformedContainer("'ftyp' box must occur first")),
        }

        let mut meta_box = None;
        let mut mdats = TryVec::new();
        while let Some(b) = reader.next_raw()? {
            match b.name {
                BoxType::MetadataBox => {
                    tracker.reserve(b.payload.len().to_u64())?;
                    let content = bmff::decode_content(b.name, b.payload)?;
                    let decoded = BmffBox { box_type: b.name.into(), content };
                    set_once(&mut meta_box, decoded, "There should be zero or one meta boxes per ISO 14496-12:2015 § 8.11.1.1")?;
                },
                BoxType::MediaDataBox => {
                    debug!("mdat at {} with {} bytes", b.payload_offset, b.payload.len());
                    mdats.push(MediaData {
                        offset: b.payload_offset,
                        data: b.payload,
                    })?;
                },
                BoxType::FileTypeBox => return Err(Error::MalformedContainer("There should be exactly one ftyp box")),
                other => debug!("skipping top-level {other:?} at {}", b.offset),
            }
        }

        let meta_box = meta_box.ok_or(Error::MalformedContainer("missing meta"))?;
        let parts = read_meta(&meta_box, &options)?;

        let mut heif = Self::new();
        heif.load(parts, &mdats, config, &mut tracker)?;
        Ok(heif)
    }

    fn load(
        &mut self,
        parts: MetaParts<'_>,
        mdats: &[MediaData<'_>],
        config: &OpenConfig,
        tracker: &mut ResourceTracker<'_>,
    ) -> Result<()> {
        let options = config.parse_options();
        let item_infos = parts.item_infos.unwrap_or_else(TryVec::new);
        tracker.validate_item_count(item_infos.len())?;

        let mut known: HashMap<u32, Slot> = HashMap::new();
        known.try_reserve(item_infos.len())?;
        let mut pending: TryVec<PendingItem> = TryVec::new();
        let mut max_id = 0;
        for info in item_infos.iter() {
            if info.item_id == 0 {
                return Err(Error::MalformedContainer("item id 0 is reserved"));
            }
            max_id = max_id.max(info.item_id);
            let slot = if info.protection_index != 0 {
                warn!("skipping protected item {}", info.item_id);
                Slot::Skipped
            } else if let Some(codec) = Codec::from_item_type(info.item_type) {
                pending.push(PendingItem {
                    id: info.item_id,
                    codec,
                    size: None,
                    config_index: None,
                    data: None,
                    properties: TryVec::new(),
                    name: info.name.try_clone()?,
                    hidden: info.hidden,
                })?;
                Slot::Coded(pending.len() - 1)
            } else {
                debug!("keeping item {} of type {} as opaque", info.item_id, info.item_type);
                let mut item = OpaqueItem::empty(info.item_type, TryVec::new());
                item.name = info.name.try_clone()?;
                item.hidden = info.hidden;
                self.store.insert_opaque(ItemId(info.item_id), item)?;
                Slot::Opaque
            };
            if known.insert(info.item_id, slot).is_some() {
                return Err(Error::MalformedContainer("duplicate item id in iinf"));
            }
        }

        if !pending.is_empty() && parts.iloc_items.is_none() {
            return Err(Error::MalformedContainer("iloc missing"));
        }
        if !pending.is_empty() && parts.iprp.is_none() {
            return Err(Error::MalformedContainer("iprp missing"));
        }

        let lookup = |item_id: u32, missing: &'static str| -> Result<Slot> {
            known.get(&item_id).copied().ok_or(Error::MalformedContainer(missing))
        };

        let mut located = HashSet::new();
        for loc in parts.iloc_items.unwrap_or_else(TryVec::new).iter() {
            let slot = lookup(loc.item_id, "iloc refers to an item missing from iinf")?;
            located.try_reserve(1)?;
            if !located.insert(loc.item_id) {
                return Err(Error::MalformedContainer("duplicate iloc entry for an item"));
            }
            match slot {
                Slot::Coded(index) => pending[index].data = Some(read_item_data(loc, mdats, parts.idat, tracker)?),
                Slot::Opaque => {
                    let data = read_item_data(loc, mdats, parts.idat, tracker)?;
                    if let Some(item) = self.store.opaque_mut(ItemId(loc.item_id)) {
                        item.data = data;
                    }
                },
                Slot::Skipped => {},
            }
        }

        let (mut properties, associations) = match parts.iprp {
            Some(iprp) => meta::read_iprp(iprp, &options).map_err(|e| e.in_box(iprp.box_type))?,
            None => (TryVec::new(), TryVec::new()),
        };

        // Property index of each decoder configuration and the items using it.
        let mut config_users: HashMap<u16, TryVec<u32>> = HashMap::new();
        for a in associations.iter() {
            let slot = lookup(a.item_id, "ipma refers to an item missing from iinf")?;
            if a.property_index == 0 {
                continue;
            }
            let property = properties
                .get(usize::from(a.property_index) - 1)
                .ok_or(Error::MalformedContainer("ipma property index out of range"))?;
            let item = match slot {
                Slot::Coded(index) => &mut pending[index],
                Slot::Opaque => {
                    if let Some(item) = self.store.opaque_mut(ItemId(a.item_id)) {
                        add_opaque_property(item, property, a.essential)?;
                    }
                    continue;
                },
                Slot::Skipped => continue,
            };
            match property {
                Property::Size(size) => set_once(&mut item.size, *size, "item has more than one ispe")?,
                Property::Config(_) => {
                    set_once(&mut item.config_index, a.property_index, "item has more than one decoder configuration")?;
                    config_users.try_reserve(1)?;
                    config_users.entry(a.property_index).or_insert_with(TryVec::new).push(item.id)?;
                },
                Property::Item(p) => item.properties.push(p.try_clone()?)?,
                Property::Unknown { box_type, payload } => {
                    if a.essential && !options.lenient {
                        warn!("unknown essential property {box_type} on item {}", item.id);
                        return Err(Error::MalformedContainer("unknown essential property"));
                    }
                    item.properties.push(ItemProperty::Opaque {
                        box_type: *box_type,
                        payload: payload.try_clone()?,
                        essential: a.essential,
                    })?;
                },
            }
        }

        // Configurations move into the store in ipco order.
        let mut config_ids: HashMap<u16, ConfigId> = HashMap::new();
        config_ids.try_reserve(config_users.len())?;
        for (index, property) in properties.iter_mut().enumerate() {
            let index = u16::try_from(index + 1)?;
            let Some(users) = config_users.get(&index) else {
                continue;
            };
            let placeholder = Property::Unknown { box_type: FourCC::default(), payload: TryVec::new() };
            let Property::Config(record) = std::mem::replace(property, placeholder) else {
                continue;
            };
            let owner = match &users[..] {
                [only] => ConfigOwner::Item(ItemId(*only)),
                _ => ConfigOwner::Container,
            };
            config_ids.insert(index, self.store.insert_config(record, owner)?);
        }

        for item in pending.iter_mut() {
            let id = ItemId(item.id);
            let size = item.size.ok_or(Error::MalformedContainer("coded item without ispe"))?;
            tracker.validate_megapixels(size)?;
            let config = item
                .config_index
                .and_then(|index| config_ids.get(&index).copied())
                .ok_or(Error::MalformedContainer("coded item without decoder configuration"))?;
            if let Some(record) = self.store.config(config) {
                item.codec.strategy().check(Some(id), record)?;
            }
            let data = item.data.take().ok_or(Error::MalformedContainer("coded item without location"))?;

            let mut image = ImageItem::new(item.codec, size);
            image.data = data;
            image.properties = std::mem::replace(&mut item.properties, TryVec::new());
            image.name = std::mem::replace(&mut item.name, TryVec::new());
            image.hidden = item.hidden;
            self.store.insert_item(id, image, config)?;
        }

        for r in parts.item_references.unwrap_or_else(TryVec::new).iter() {
            let from = lookup(r.from_item_id, "iref refers to a nonexistent item")?;
            for &to_item_id in r.to_item_ids.iter() {
                let to = lookup(to_item_id, "iref refers to a nonexistent item")?;
                if matches!(from, Slot::Skipped) || matches!(to, Slot::Skipped) {
                    debug!("dropping {} reference {} -> {to_item_id}", r.reference_type, r.from_item_id);
                    continue;
                }
                self.store
                    .add_reference(r.reference_type, ItemId(r.from_item_id), ItemId(to_item_id))
                    .map_err(|e| match e {
                        Error::CyclicReference { .. } => Error::MalformedContainer("cyclic item references"),
                        e => e,
                    })?;
            }
        }

        if let Some(primary) = parts.primary_item_id {
            match lookup(primary, "pitm refers to a nonexistent item")? {
                Slot::Skipped => warn!("primary item {primary} is protected"),
                _ => self.primary_item = Some(ItemId(primary)),
            }
        }

        self.store.reserve_ids_through(ItemId(max_id));
        Ok(())
    }

    /// Create a complete item in one call. See [`ImageItemBuilder`] to set
    /// the parts one at a time.
    pub fn create_item<'a>(
        &mut self,
        codec: Codec,
        size: ImageSize,
        config: impl Into<ConfigSource<'a>>,
        data: &'a [u8],
    ) -> Result<ItemId> {
        self.add_item(ImageItemBuilder::new(codec).size(size).decoder_config(config).data(data))
    }

    pub fn add_item(&mut self, builder: ImageItemBuilder<'_>) -> Result<ItemId> {
        self.store.register(builder)
    }

    /// Add an item of a type this crate does not decode, such as `Exif`
    /// metadata for a `cdsc` reference.
    pub fn add_opaque_item(&mut self, item: OpaqueItem) -> Result<ItemId> {
        self.store.register_opaque(item)
    }

    /// Remove an opaque item and the references touching it.
    pub fn release_opaque_item(&mut self, item: ItemId) -> Result<OpaqueItem> {
        let released = self.store.release_opaque(item)?;
        if self.primary_item == Some(item) {
            self.primary_item = None;
        }
        Ok(released)
    }

    /// Add a container-owned decoder configuration for items to share.
    pub fn add_config(&mut self, record: DecoderConfigRecord) -> Result<ConfigId> {
        self.store.add_config(record)
    }

    /// Destroy a decoder configuration that no item uses.
    pub fn destroy_config(&mut self, config: ConfigId) -> Result<DecoderConfigRecord> {
        self.store.destroy_config(config)
    }

    /// Remove an item, the references touching it, and its exclusively
    /// owned configuration.
    pub fn release_item(&mut self, item: ItemId) -> Result<ImageItem> {
        let released = self.store.release(item)?;
        if self.primary_item == Some(item) {
            self.primary_item = None;
        }
        Ok(released)
    }

    pub fn set_decoder_config<'a>(&mut self, item: ItemId, config: impl Into<ConfigSource<'a>>) -> Result<ConfigId> {
        self.store.set_decoder_config(item, config.into())
    }

    pub fn set_item_data(&mut self, item: ItemId, data: &[u8]) -> Result<()> {
        self.store.set_item_data(item, data)
    }

    pub fn set_size(&mut self, item: ItemId, size: ImageSize) -> Result<()> {
        self.store.set_size(item, size)
    }

    pub fn add_property(&mut self, item: ItemId, property: ItemProperty) -> Result<()> {
        self.store.add_property(item, property)
    }

    pub fn set_hidden(&mut self, item: ItemId, hidden: bool) -> Result<()> {
        self.store.set_hidden(item, hidden)
    }

    pub fn add_reference(&mut self, reference_type: impl Into<FourCC>, from: ItemId, to: ItemId) -> Result<()> {
        self.store.add_reference(reference_type, from, to)
    }

    pub fn references(&self) -> &[ItemReference] {
        self.store.references()
    }

    pub fn references_from(&self, from: ItemId, reference_type: impl Into<FourCC>) -> impl Iterator<Item = ItemId> + '_ {
        self.store.references_from(from, reference_type)
    }

    pub fn referencing_items(&self, to: ItemId, reference_type: impl Into<FourCC>) -> impl Iterator<Item = ItemId> + '_ {
        self.store.referencing_items(to, reference_type)
    }

    /// The primary item may be coded or opaque (a `grid`, typically).
    pub fn set_primary_item(&mut self, item: ItemId) -> Result<()> {
        if !self.store.contains(item) {
            return Err(Error::UnknownItem(item));
        }
        self.primary_item = Some(item);
        Ok(())
    }

    /// The primary item: the one set explicitly or read from `pitm`, else
    /// the lowest item id.
    pub fn primary_item(&self) -> Option<ItemId> {
        self.primary_item.or_else(|| self.store.items().map(|(id, _)| id).min())
    }

    pub fn item(&self, id: ItemId) -> Option<&ImageItem> {
        self.store.item(id)
    }

    pub fn opaque_item(&self, id: ItemId) -> Option<&OpaqueItem> {
        self.store.opaque_item(id)
    }

    pub fn opaque_items(&self) -> impl Iterator<Item = (ItemId, &OpaqueItem)> {
        self.store.opaque_items()
    }

    /// `infe` item type of any item.
    pub fn item_type(&self, id: ItemId) -> Option<FourCC> {
        self.store.item_type(id)
    }

    /// Payload of any item: the coded frame, or the raw bytes of an opaque
    /// item such as the `Exif` block.
    pub fn item_data(&self, id: ItemId) -> Option<&[u8]> {
        self.store.item_data(id)
    }

    /// Coded and opaque items of one item type, ascending.
    pub fn item_ids_by_type(&self, item_type: impl Into<FourCC>) -> Result<TryVec<ItemId>> {
        self.store.item_ids_by_type(item_type)
    }

    /// Items in no particular order; see [`Heif::item_ids`] for a sorted list.
    pub fn items(&self) -> impl Iterator<Item = (ItemId, &ImageItem)> {
        self.store.items()
    }

    pub fn item_ids(&self) -> Result<TryVec<ItemId>> {
        self.store.item_ids()
    }

    pub fn item_ids_by_codec(&self, codec: Codec) -> Result<TryVec<ItemId>> {
        self.store.item_ids_by_codec(codec)
    }

    pub fn config(&self, id: ConfigId) -> Option<&DecoderConfigRecord> {
        self.store.config(id)
    }

    /// Decoder configurations, by ascending id.
    pub fn configs(&self) -> Result<TryVec<(ConfigId, &DecoderConfigRecord)>> {
        let ids = self.store.config_ids()?;
        let mut configs = TryVec::with_capacity(ids.len())?;
        for &id in ids.iter() {
            if let Some(record) = self.store.config(id) {
                configs.push((id, record))?;
            }
        }
        Ok(configs)
    }

    /// The decoder configuration attached to an item.
    pub fn item_config(&self, item: ItemId) -> Option<&DecoderConfigRecord> {
        self.store.item_config(item)
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Serialize the container into a new buffer.
    pub fn save(&self) -> Result<std::vec::Vec<u8>> {
        let mut out = std::vec::Vec::new();
        self.save_to(&mut out)?;
        Ok(out)
    }

    /// Serialize the container: `ftyp`, then `meta`, then one `mdat` with
    /// every item payload in item id order.
    pub fn save_to<W: Write>(&self, dst: &mut W) -> Result<()> {
        let ids = self.store.item_ids()?;
        let opaque_ids = self.store.opaque_ids()?;
        let mut items = TryVec::with_capacity(ids.len() + opaque_ids.len())?;
        for &id in ids.iter() {
            let item = self.store.item(id).ok_or(Error::UnknownItem(id))?;
            if let Some(missing) = item.missing() {
                return Err(Error::IncompleteItem { item: id, missing });
            }
            items.push((id, Stored::Coded(item)))?;
        }
        for &id in opaque_ids.iter() {
            let item = self.store.opaque_item(id).ok_or(Error::UnknownItem(id))?;
            items.push((id, Stored::Opaque(item)))?;
        }
        items.sort_unstable_by_key(|&(id, _)| id);

        let ftyp = meta::write_ftyp(&self.file_type(&items)?)?;
        let hdlr = meta::write_hdlr(PICT_HANDLER)?;
        let pitm = match self.primary_item.or_else(|| ids.first().copied()) {
            Some(primary) => Some(meta::write_pitm(primary.0)?),
            None => None,
        };
        let iinf = self.write_iinf(&items)?;
        let iref = self.write_iref()?;
        let iprp = self.write_iprp(&items)?;

        // A zero length would read back as "to the end of the file", so
        // empty payloads get no iloc entry.
        let mut locations = TryVec::with_capacity(items.len())?;
        let mut total_data = 0u64;
        for &(id, item) in items.iter().filter(|(_, item)| !item.data().is_empty()) {
            let length = item.data().len().to_u64();
            locations.push(WrittenLocation { item_id: id.0, offset: total_data, length })?;
            total_data = total_data.checked_add(length).ok_or(Error::Unsupported("item data too large"))?;
        }

        let fixed_meta_len: u64 = 4
            + hdlr.encoded_len()
            + pitm.as_ref().map_or(0, BmffBox::encoded_len)
            + iinf.encoded_len()
            + iref.as_ref().map_or(0, BmffBox::encoded_len)
            + iprp.encoded_len();

        // Offsets are relative to the start of the mdat payload until the
        // meta length, which depends on the offset width, is known.
        let mut sizing = TryVec::with_capacity(locations.len())?;
        for l in locations.iter() {
            sizing.push(WrittenLocation { offset: 0, length: 0, ..*l })?;
        }
        let mut data_start = 0;
        let mut wide_offsets = false;
        for wide in [false, true] {
            let meta_payload = fixed_meta_len + meta::write_iloc(&sizing, wide)?.encoded_len();
            data_start = ftyp.encoded_len() + header_len(meta_payload) + meta_payload + header_len(total_data);
            wide_offsets = wide;
            if data_start.saturating_add(total_data) <= u64::from(u32::MAX) {
                break;
            }
        }
        for l in locations.iter_mut() {
            l.offset += data_start;
        }
        debug!("writing {} items, data at {data_start}, wide offsets: {wide_offsets}", items.len());

        let mut children = TryVec::with_capacity(6)?;
        children.push(hdlr)?;
        if let Some(pitm) = pitm {
            children.push(pitm)?;
        }
        children.push(iinf)?;
        children.push(meta::write_iloc(&locations, wide_offsets)?)?;
        if let Some(iref) = iref {
            children.push(iref)?;
        }
        children.push(iprp)?;
        let meta = BmffBox::full_container(b"meta", 0, 0, children);

        let mut head = bmff::encode(&ftyp)?;
        bmff::encode_into(&meta, &mut head)?;
        write_box_header(&mut head, FourCC::new(*b"mdat"), total_data)?;
        if head.len().to_u64() != data_start {
            return Err(Error::Unsupported("meta length changed while writing"));
        }
        dst.write_all(&head)?;
        for &(_, item) in items.iter() {
            dst.write_all(item.data())?;
        }
        Ok(())
    }

    fn file_type(&self, items: &[(ItemId, Stored<'_>)]) -> Result<FileTypeBox> {
        let mut compatible_brands = TryVec::new();
        compatible_brands.push(MIF1_BRAND)?;
        for codec in Codec::ALL {
            if items.iter().any(|(_, item)| matches!(item, Stored::Coded(i) if i.codec() == codec)) {
                compatible_brands.push(codec.brand())?;
            }
        }
        Ok(FileTypeBox {
            major_brand: MIF1_BRAND,
            minor_version: 0,
            compatible_brands,
        })
    }

    fn write_iinf(&self, items: &[(ItemId, Stored<'_>)]) -> Result<BmffBox> {
        let mut entries = TryVec::with_capacity(items.len())?;
        for &(id, item) in items.iter() {
            entries.push(ItemInfoEntry {
                item_id: id.0,
                item_type: item.item_type(),
                protection_index: 0,
                name: copy_bytes(item.name().as_bytes())?,
                hidden: item.is_hidden(),
            })?;
        }
        meta::write_iinf(&entries)
    }

    /// One `SingleItemTypeReferenceBox` per reference type and source item,
    /// in order of first use.
    fn write_iref(&self) -> Result<Option<BmffBox>> {
        let references = self.store.references();
        if references.is_empty() {
            return Ok(None);
        }
        let mut groups: TryVec<SingleItemTypeReference> = TryVec::new();
        for r in references {
            let group = groups
                .iter_mut()
                .find(|g| g.reference_type == r.reference_type && g.from_item_id == r.from.0);
            match group {
                Some(group) => group.to_item_ids.push(r.to.0)?,
                None => {
                    let mut to_item_ids = TryVec::new();
                    to_item_ids.push(r.to.0)?;
                    groups.push(SingleItemTypeReference {
                        reference_type: r.reference_type,
                        from_item_id: r.from.0,
                        to_item_ids,
                    })?;
                },
            }
        }
        meta::write_iref(&groups).map(Some)
    }

    /// Shared configurations and equal sizes are written to `ipco` once.
    fn write_iprp(&self, items: &[(ItemId, Stored<'_>)]) -> Result<BmffBox> {
        let mut ipco = TryVec::new();
        let mut config_index: HashMap<ConfigId, u16> = HashMap::new();
        let mut size_index: HashMap<ImageSize, u16> = HashMap::new();
        let mut associations = TryVec::with_capacity(items.len())?;

        fn push_property(ipco: &mut TryVec<BmffBox>, b: BmffBox) -> Result<u16> {
            ipco.push(b)?;
            u16::try_from(ipco.len()).map_err(|_| Error::Unsupported("more than 65535 item properties"))
        }

        for &(id, item) in items.iter() {
            let mut entries = TryVec::new();

            let (size, properties) = match item {
                Stored::Coded(item) => {
                    let config = item.config_id().ok_or(Error::IncompleteItem {
                        item: id,
                        missing: "decoder configuration",
                    })?;
                    let index = match config_index.get(&config) {
                        Some(&index) => index,
                        None => {
                            let record = self.store.config(config).ok_or(Error::UnknownConfig(config))?;
                            let index = push_property(&mut ipco, meta::write_config(record)?)?;
                            config_index.try_reserve(1)?;
                            config_index.insert(config, index);
                            index
                        },
                    };
                    entries.push((true, index))?;
                    (Some(item.size()), item.properties())
                },
                Stored::Opaque(item) => (item.size(), item.properties()),
            };

            if let Some(size) = size {
                let index = match size_index.get(&size) {
                    Some(&index) => index,
                    None => {
                        let index = push_property(&mut ipco, meta::write_ispe(size)?)?;
                        size_index.try_reserve(1)?;
                        size_index.insert(size, index);
                        index
                    },
                };
                entries.push((false, index))?;
            }

            for property in properties {
                let index = push_property(&mut ipco, meta::write_property(property)?)?;
                entries.push((property.is_essential(), index))?;
            }

            if !entries.is_empty() {
                associations.push(ItemAssociations { item_id: id.0, entries })?;
            }
        }

        let property_count = ipco.len();
        let ipma = meta::write_ipma(&associations, property_count)?;
        let mut children = TryVec::with_capacity(2)?;
        children.push(BmffBox::container(b"ipco", ipco))?;
        children.push(ipma)?;
        Ok(BmffBox::container(b"iprp", children))
    }
}

/// An item as `save` sees it.
#[derive(Clone, Copy)]
enum Stored<'a> {
    Coded(&'a ImageItem),
    Opaque(&'a OpaqueItem),
}

impl<'a> Stored<'a> {
    fn item_type(self) -> FourCC {
        match self {
            Self::Coded(item) => item.item_type(),
            Self::Opaque(item) => item.item_type(),
        }
    }

    fn data(self) -> &'a [u8] {
        match self {
            Self::Coded(item) => item.data(),
            Self::Opaque(item) => item.data(),
        }
    }

    fn name(self) -> &'a str {
        match self {
            Self::Coded(item) => item.name(),
            Self::Opaque(item) => item.name(),
        }
    }

    fn is_hidden(self) -> bool {
        match self {
            Self::Coded(item) => item.is_hidden(),
            Self::Opaque(item) => item.is_hidden(),
        }
    }
}

/// Carry an `ipco` entry over to an opaque item. Decoder configurations
/// stay serialized, and nothing is rejected as unknown since the item is
/// not decoded here.
fn add_opaque_property(item: &mut OpaqueItem, property: &Property, essential: bool) -> Result<()> {
    let carried = match property {
        Property::Size(size) => return set_once(&mut item.size, *size, "item has more than one ispe"),
        Property::Config(record) => ItemProperty::Opaque {
            box_type: record.codec().config_box(),
            payload: record.serialize()?,
            essential,
        },
        Property::Item(p) => p.try_clone()?,
        Property::Unknown { box_type, payload } => ItemProperty::Opaque {
            box_type: *box_type,
            payload: payload.try_clone()?,
            essential,
        },
    };
    item.properties.push(carried)?;
    Ok(())
}

/// Copy an item's extents out of the `mdat` boxes or the `idat`.
fn read_item_data(
    loc: &ItemLocation,
    mdats: &[MediaData<'_>],
    idat: Option<&[u8]>,
    tracker: &mut ResourceTracker<'_>,
) -> Result<TryVec<u8>> {
    let idat_source;
    let sources = match loc.construction_method {
        ConstructionMethod::File => mdats,
        ConstructionMethod::Idat => {
            let data = idat.ok_or(Error::MalformedContainer("idat extent without an idat box"))?;
            idat_source = [MediaData { offset: 0, data }];
            &idat_source[..]
        },
    };

    let mut data = TryVec::new();
    for extent in loc.extents.iter() {
        let source = sources
            .iter()
            .find(|s| s.contains_extent(extent))
            .ok_or(Error::MalformedContainer("item data outside every mdat and idat"))?;
        let slice = source.extent(extent)?;
        tracker.reserve(slice.len().to_u64())?;
        data.extend_from_slice(slice)?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AVCC: [u8; 17] = [1, 66, 0xC0, 30, 0xFF, 0xE1, 0, 4, 0x67, 0x42, 0xC0, 0x1E, 1, 0, 2, 0x68, 0xCE];

    fn size(w: u32, h: u32) -> ImageSize {
        ImageSize::new(w, h).unwrap()
    }

    #[test]
    fn release_clears_primary() {
        let mut heif = Heif::new();
        let a = heif.create_item(Codec::Avc, size(4, 4), &AVCC[..], &[1]).unwrap();
        let b = heif.create_item(Codec::Avc, size(4, 4), &AVCC[..], &[2]).unwrap();
        heif.set_primary_item(b).unwrap();
        assert_eq!(heif.primary_item(), Some(b));
        heif.release_item(b).unwrap();
        assert_eq!(heif.primary_item(), Some(a));
        assert!(heif.set_primary_item(b).is_err());
    }

    #[test]
    fn shared_properties_are_written_once() {
        let mut heif = Heif::new();
        let config = heif
            .add_config(DecoderConfigRecord::parse(FourCC::new(*b"avcC"), &AVCC).unwrap())
            .unwrap();
        let a = heif.create_item(Codec::Avc, size(64, 64), config, &[1, 1]).unwrap();
        let b = heif.create_item(Codec::Avc, size(64, 64), config, &[2]).unwrap();
        heif.add_property(b, ItemProperty::Rotation(1)).unwrap();

        let items = [(a, Stored::Coded(heif.item(a).unwrap())), (b, Stored::Coded(heif.item(b).unwrap()))];
        let iprp = heif.write_iprp(&items).unwrap();
        // avcC, ispe, irot
        assert_eq!(iprp.children()[0].children().len(), 3);
    }

    #[test]
    fn offsets_point_into_mdat() {
        let mut heif = Heif::new();
        heif.create_item(Codec::Avc, size(16, 16), &AVCC[..], &[9; 5]).unwrap();
        heif.create_item(Codec::Avc, size(16, 16), &AVCC[..], &[7; 3]).unwrap();
        let bytes = heif.save().unwrap();
        let boxes = bmff::decode_all(&bytes).unwrap();
        assert_eq!(boxes.len(), 3);
        assert_eq!(boxes[2].box_type, b"mdat");
        assert_eq!(&bytes[bytes.len() - 8..], &[9, 9, 9, 9, 9, 7, 7, 7]);

        let meta = &boxes[1];
        let iloc = meta.children().iter().find(|b| b.name() == BoxType::ItemLocationBox).unwrap();
        let locations = meta::read_leaf(iloc, |p| meta::read_iloc(p, &ParseOptions::default())).unwrap();
        assert_eq!(locations[0].extents[0].start(), bytes.len() as u64 - 8);
    }

    #[test]
    fn empty_opaque_payload_has_no_location() {
        let mut heif = Heif::new();
        let coded = heif.create_item(Codec::Avc, size(16, 16), &AVCC[..], &[9; 5]).unwrap();
        let empty = heif.add_opaque_item(OpaqueItem::new(*b"mime", &[]).unwrap()).unwrap();
        let bytes = heif.save().unwrap();

        let boxes = bmff::decode_all(&bytes).unwrap();
        let iloc = boxes[1].children().iter().find(|b| b.name() == BoxType::ItemLocationBox).unwrap();
        let locations = meta::read_leaf(iloc, |p| meta::read_iloc(p, &ParseOptions::default())).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].item_id, coded.0);

        let reopened = Heif::open(&bytes).unwrap();
        assert_eq!(reopened.item_data(empty), Some(&[][..]));
        assert_eq!(reopened.item_type(empty), Some(FourCC::new(*b"mime")));
    }

    #[test]
    fn empty_container_round_trips() {
        let bytes = Heif::new().save().unwrap();
        let heif = Heif::open(&bytes).unwrap();
        assert!(heif.is_empty());
        assert_eq!(heif.primary_item(), None);
    }
}
