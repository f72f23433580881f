// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::boxes::FourCC;
use crate::config::{Codec, DecoderConfigRecord};
use crate::item::{copy_bytes, ConfigSource, ImageItem, ImageItemBuilder, ImageSize, ItemProperty, OpaqueItem};
use crate::{Error, Result, TryVec};
use log::debug;
use std::collections::HashMap;
use std::fmt;

/// Identifier of an item, unique within one container and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

/// Identifier of a decoder configuration held by an [`ItemStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a decoder configuration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOwner {
    /// Shared; lives until destroyed explicitly.
    Container,
    /// Exclusive; goes away with the item's last use of it.
    Item(ItemId),
}

/// A typed reference between two items, one entry of an `iref` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemReference {
    /// `thmb`, `auxl`, `cdsc`, `base`, `dimg`, ...
    pub reference_type: FourCC,
    pub from: ItemId,
    pub to: ItemId,
}

#[derive(Debug)]
struct ConfigEntry {
    record: DecoderConfigRecord,
    owner: ConfigOwner,
    references: u32,
}

enum ResolvedConfig {
    Existing(ConfigId),
    New(DecoderConfigRecord),
}

/// Items, decoder configurations and the references between them.
///
/// Coded items and [`OpaqueItem`]s share one identifier namespace, and
/// references may connect either kind.
#[derive(Debug)]
pub struct ItemStore {
    items: HashMap<ItemId, ImageItem>,
    opaque: HashMap<ItemId, OpaqueItem>,
    configs: HashMap<ConfigId, ConfigEntry>,
    references: TryVec<ItemReference>,
    next_item_id: u32,
    next_config_id: u32,
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStore {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            opaque: HashMap::new(),
            configs: HashMap::new(),
            references: TryVec::new(),
            next_item_id: 1,
            next_config_id: 1,
        }
    }

    /// Validate and register a new item.
    ///
    /// Fails with `InvalidSize`, `UnknownConfig`, `UnsupportedCodec`,
    /// `MalformedConfig` or `ConfigTypeMismatch` without touching the store.
    pub fn register(&mut self, builder: ImageItemBuilder<'_>) -> Result<ItemId> {
        let mut item = builder.stage()?;
        let config = match builder.config {
            Some(source) => Some(self.resolve(item.codec, None, source)?),
            None => None,
        };

        let id = ItemId(self.next_item_id);
        let next_item_id = self
            .next_item_id
            .checked_add(1)
            .ok_or(Error::Unsupported("item identifiers exhausted"))?;
        self.items.try_reserve(1)?;
        self.configs.try_reserve(1)?;

        item.config = match config {
            Some(ResolvedConfig::Existing(config)) => Some(config),
            Some(ResolvedConfig::New(record)) => Some(self.insert_config(record, ConfigOwner::Item(id))?),
            None => None,
        };
        if let Some(config) = item.config {
            self.acquire(config)?;
        }
        debug!("registered {:?} item {id} as {:?}", item.codec, item.config);
        self.items.insert(id, item);
        self.next_item_id = next_item_id;
        Ok(id)
    }

    /// Register an item of a type this crate does not decode.
    pub fn register_opaque(&mut self, item: OpaqueItem) -> Result<ItemId> {
        let id = ItemId(self.next_item_id);
        let next_item_id = self
            .next_item_id
            .checked_add(1)
            .ok_or(Error::Unsupported("item identifiers exhausted"))?;
        self.opaque.try_reserve(1)?;
        debug!("registered {} item {id}", item.item_type);
        self.opaque.insert(id, item);
        self.next_item_id = next_item_id;
        Ok(id)
    }

    /// Add a container-owned configuration that items can share.
    pub fn add_config(&mut self, record: DecoderConfigRecord) -> Result<ConfigId> {
        self.insert_config(record, ConfigOwner::Container)
    }

    pub(crate) fn insert_config(&mut self, record: DecoderConfigRecord, owner: ConfigOwner) -> Result<ConfigId> {
        let id = ConfigId(self.next_config_id);
        let next_config_id = self
            .next_config_id
            .checked_add(1)
            .ok_or(Error::Unsupported("configuration identifiers exhausted"))?;
        self.configs.try_reserve(1)?;
        self.configs.insert(id, ConfigEntry { record, owner, references: 0 });
        self.next_config_id = next_config_id;
        Ok(id)
    }

    /// Register an item read from a file under its original identifier.
    pub(crate) fn insert_item(&mut self, id: ItemId, mut item: ImageItem, config: ConfigId) -> Result<()> {
        if self.contains(id) {
            return Err(Error::MalformedContainer("duplicate item id"));
        }
        self.items.try_reserve(1)?;
        self.acquire(config)?;
        item.config = Some(config);
        self.items.insert(id, item);
        self.reserve_ids_through(id);
        Ok(())
    }

    pub(crate) fn insert_opaque(&mut self, id: ItemId, item: OpaqueItem) -> Result<()> {
        if self.contains(id) {
            return Err(Error::MalformedContainer("duplicate item id"));
        }
        self.opaque.try_reserve(1)?;
        self.opaque.insert(id, item);
        self.reserve_ids_through(id);
        Ok(())
    }

    pub(crate) fn opaque_mut(&mut self, id: ItemId) -> Option<&mut OpaqueItem> {
        self.opaque.get_mut(&id)
    }

    /// Never hand out `id` or anything below it.
    pub(crate) fn reserve_ids_through(&mut self, id: ItemId) {
        self.next_item_id = self.next_item_id.max(id.0.saturating_add(1));
    }

    /// Attach a shared configuration to an item, replacing its current one.
    pub fn attach_config(&mut self, item: ItemId, config: ConfigId) -> Result<()> {
        self.set_decoder_config(item, ConfigSource::Shared(config)).map(drop)
    }

    /// Replace an item's configuration. The new configuration is checked
    /// first, so on failure the previous one stays attached.
    pub fn set_decoder_config(&mut self, item: ItemId, source: ConfigSource<'_>) -> Result<ConfigId> {
        let current = self.items.get(&item).ok_or(Error::UnknownItem(item))?;
        let (codec, previous) = (current.codec, current.config);
        let resolved = self.resolve(codec, Some(item), source)?;
        if let ResolvedConfig::Existing(config) = resolved {
            if previous == Some(config) {
                return Ok(config);
            }
        }

        let config = match resolved {
            ResolvedConfig::Existing(config) => config,
            ResolvedConfig::New(record) => self.insert_config(record, ConfigOwner::Item(item))?,
        };
        self.acquire(config)?;
        if let Some(previous) = previous {
            self.detach(item, previous);
        }
        if let Some(current) = self.items.get_mut(&item) {
            current.config = Some(config);
        }
        Ok(config)
    }

    fn resolve(&self, codec: Codec, item: Option<ItemId>, source: ConfigSource<'_>) -> Result<ResolvedConfig> {
        let strategy = codec.strategy();
        match source {
            ConfigSource::Shared(config) => {
                let entry = self.configs.get(&config).ok_or(Error::UnknownConfig(config))?;
                strategy.check(item, &entry.record)?;
                Ok(ResolvedConfig::Existing(config))
            },
            ConfigSource::Bytes(bytes) => {
                let record = DecoderConfigRecord::parse(strategy.config_box, bytes)?;
                strategy.check(item, &record)?;
                Ok(ResolvedConfig::New(record))
            },
            ConfigSource::Record(record) => {
                strategy.check(item, &record)?;
                Ok(ResolvedConfig::New(record))
            },
        }
    }

    fn acquire(&mut self, config: ConfigId) -> Result<()> {
        let entry = self.configs.get_mut(&config).ok_or(Error::UnknownConfig(config))?;
        entry.references = entry
            .references
            .checked_add(1)
            .ok_or(Error::Unsupported("configuration reference count overflow"))?;
        Ok(())
    }

    /// Drop `item`'s use of `config`. An exclusively owned configuration is
    /// destroyed with its last use, or handed to the container when other
    /// items still use it.
    fn detach(&mut self, item: ItemId, config: ConfigId) {
        let Some(entry) = self.configs.get_mut(&config) else {
            return;
        };
        entry.references = entry.references.saturating_sub(1);
        if entry.owner == ConfigOwner::Item(item) {
            if entry.references == 0 {
                debug!("destroying configuration {config} with item {item}");
                self.configs.remove(&config);
            } else {
                entry.owner = ConfigOwner::Container;
            }
        }
    }

    /// Remove an item along with the references touching it.
    pub fn release(&mut self, item: ItemId) -> Result<ImageItem> {
        if !self.items.contains_key(&item) {
            return Err(Error::UnknownItem(item));
        }
        self.drop_references(item)?;
        let released = self.items.remove(&item).ok_or(Error::UnknownItem(item))?;
        if let Some(config) = released.config {
            self.detach(item, config);
        }
        Ok(released)
    }

    /// Remove an opaque item along with the references touching it.
    pub fn release_opaque(&mut self, item: ItemId) -> Result<OpaqueItem> {
        if !self.opaque.contains_key(&item) {
            return Err(Error::UnknownItem(item));
        }
        self.drop_references(item)?;
        self.opaque.remove(&item).ok_or(Error::UnknownItem(item))
    }

    fn drop_references(&mut self, item: ItemId) -> Result<()> {
        let mut kept = TryVec::with_capacity(self.references.len())?;
        for r in self.references.iter().filter(|r| r.from != item && r.to != item) {
            kept.push(*r)?;
        }
        self.references = kept;
        Ok(())
    }

    /// Destroy a configuration no item uses any more.
    pub fn destroy_config(&mut self, config: ConfigId) -> Result<DecoderConfigRecord> {
        let entry = self.configs.get(&config).ok_or(Error::UnknownConfig(config))?;
        if entry.references > 0 {
            return Err(Error::ConfigInUse {
                config,
                references: entry.references,
            });
        }
        self.configs
            .remove(&config)
            .map(|entry| entry.record)
            .ok_or(Error::UnknownConfig(config))
    }

    pub fn set_item_data(&mut self, item: ItemId, data: &[u8]) -> Result<()> {
        let copy = copy_bytes(data)?;
        self.item_mut(item)?.data = copy;
        Ok(())
    }

    pub fn set_size(&mut self, item: ItemId, size: ImageSize) -> Result<()> {
        let size = size.validated()?;
        self.item_mut(item)?.size = size;
        Ok(())
    }

    pub fn add_property(&mut self, item: ItemId, property: ItemProperty) -> Result<()> {
        property.validate()?;
        self.item_mut(item)?.properties.push(property)?;
        Ok(())
    }

    pub fn set_hidden(&mut self, item: ItemId, hidden: bool) -> Result<()> {
        self.item_mut(item)?.hidden = hidden;
        Ok(())
    }

    fn item_mut(&mut self, item: ItemId) -> Result<&mut ImageItem> {
        self.items.get_mut(&item).ok_or(Error::UnknownItem(item))
    }

    /// Record that `from` refers to `to` with `reference_type`.
    ///
    /// Cycles are rejected among references of the same type. Pairs of
    /// different types may point both ways, as `prem` and `auxl` do
    /// between an image and its alpha plane.
    pub fn add_reference(&mut self, reference_type: impl Into<FourCC>, from: ItemId, to: ItemId) -> Result<()> {
        let reference_type = reference_type.into();
        for id in [from, to] {
            if !self.contains(id) {
                return Err(Error::UnknownItem(id));
            }
        }
        if from == to || self.reaches(reference_type, to, from)? {
            return Err(Error::CyclicReference { from, to });
        }
        self.references.push(ItemReference { reference_type, from, to })?;
        Ok(())
    }

    /// Whether a chain of `reference_type` references leads from `start`
    /// to `target`.
    fn reaches(&self, reference_type: FourCC, start: ItemId, target: ItemId) -> Result<bool> {
        // Breadth-first; `seen` doubles as the queue.
        let mut seen = TryVec::new();
        seen.push(start)?;
        let mut next = 0;
        while let Some(&id) = seen.get(next) {
            next += 1;
            if id == target {
                return Ok(true);
            }
            for r in self.references.iter().filter(|r| r.from == id && r.reference_type == reference_type) {
                if !seen.contains(&r.to) {
                    seen.push(r.to)?;
                }
            }
        }
        Ok(false)
    }

    pub fn item(&self, id: ItemId) -> Option<&ImageItem> {
        self.items.get(&id)
    }

    pub fn opaque_item(&self, id: ItemId) -> Option<&OpaqueItem> {
        self.opaque.get(&id)
    }

    /// Whether `id` names a coded or an opaque item.
    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id) || self.opaque.contains_key(&id)
    }

    /// The `infe` item type of a coded or opaque item.
    pub fn item_type(&self, id: ItemId) -> Option<FourCC> {
        match self.items.get(&id) {
            Some(item) => Some(item.item_type()),
            None => self.opaque.get(&id).map(|item| item.item_type),
        }
    }

    /// Payload of a coded or opaque item.
    pub fn item_data(&self, id: ItemId) -> Option<&[u8]> {
        match self.items.get(&id) {
            Some(item) => Some(item.data()),
            None => self.opaque.get(&id).map(OpaqueItem::data),
        }
    }

    pub fn config(&self, id: ConfigId) -> Option<&DecoderConfigRecord> {
        self.configs.get(&id).map(|entry| &entry.record)
    }

    pub fn config_owner(&self, id: ConfigId) -> Option<ConfigOwner> {
        self.configs.get(&id).map(|entry| entry.owner)
    }

    /// Number of items using the configuration.
    pub fn config_references(&self, id: ConfigId) -> Option<u32> {
        self.configs.get(&id).map(|entry| entry.references)
    }

    /// The configuration attached to an item.
    pub fn item_config(&self, item: ItemId) -> Option<&DecoderConfigRecord> {
        self.item(item).and_then(|item| item.config).and_then(|config| self.config(config))
    }

    /// Number of coded items; opaque items are not counted.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in no particular order.
    pub fn items(&self) -> impl Iterator<Item = (ItemId, &ImageItem)> {
        self.items.iter().map(|(&id, item)| (id, item))
    }

    /// Opaque items in no particular order.
    pub fn opaque_items(&self) -> impl Iterator<Item = (ItemId, &OpaqueItem)> {
        self.opaque.iter().map(|(&id, item)| (id, item))
    }

    /// Opaque item identifiers, ascending.
    pub fn opaque_ids(&self) -> Result<TryVec<ItemId>> {
        let mut ids = TryVec::with_capacity(self.opaque.len())?;
        for &id in self.opaque.keys() {
            ids.push(id)?;
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Identifiers of coded and opaque items with one `infe` item type,
    /// ascending.
    pub fn item_ids_by_type(&self, item_type: impl Into<FourCC>) -> Result<TryVec<ItemId>> {
        let item_type = item_type.into();
        let mut ids = self.sorted_ids(|item| item.item_type() == item_type)?;
        for (&id, item) in self.opaque.iter() {
            if item.item_type == item_type {
                ids.push(id)?;
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// All item identifiers, ascending.
    pub fn item_ids(&self) -> Result<TryVec<ItemId>> {
        self.sorted_ids(|_| true)
    }

    /// Identifiers of the items of one codec, ascending.
    pub fn item_ids_by_codec(&self, codec: Codec) -> Result<TryVec<ItemId>> {
        self.sorted_ids(|item| item.codec == codec)
    }

    fn sorted_ids(&self, filter: impl Fn(&ImageItem) -> bool) -> Result<TryVec<ItemId>> {
        let mut ids = TryVec::with_capacity(self.items.len())?;
        for (&id, item) in self.items.iter() {
            if filter(item) {
                ids.push(id)?;
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// All configuration identifiers, ascending.
    pub fn config_ids(&self) -> Result<TryVec<ConfigId>> {
        let mut ids = TryVec::with_capacity(self.configs.len())?;
        for &id in self.configs.keys() {
            ids.push(id)?;
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Every reference, in insertion order.
    pub fn references(&self) -> &[ItemReference] {
        &self.references
    }

    /// Targets of `from`'s references of one type, in order.
    pub fn references_from(&self, from: ItemId, reference_type: impl Into<FourCC>) -> impl Iterator<Item = ItemId> + '_ {
        let reference_type = reference_type.into();
        self.references
            .iter()
            .filter(move |r| r.from == from && r.reference_type == reference_type)
            .map(|r| r.to)
    }

    /// Items referring to `to` with one reference type, in order.
    pub fn referencing_items(&self, to: ItemId, reference_type: impl Into<FourCC>) -> impl Iterator<Item = ItemId> + '_ {
        let reference_type = reference_type.into();
        self.references
            .iter()
            .filter(move |r| r.to == to && r.reference_type == reference_type)
            .map(|r| r.from)
    }
}
