// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use heif_store::bmff::{self, BmffBox};
use heif_store::{
    AuxiliaryType, Codec, ConfigOwner, ConfigSource, DecoderConfigRecord, Error, FourCC, Heif, ImageItemBuilder,
    ImageSize, ItemId, ItemProperty, MirrorAxis, OpaqueItem, OpenConfig, TryVec,
};

/// Main profile, one VPS and one SPS, 4-byte NAL lengths.
static HVCC: [u8; 38] = [
    1, 0x01, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0x5A, 0xF0, 0, 0xFC, 0xFD, 0xF8, 0xF8, 0, 0, 0x0F, 2, 0xA1, 0, 1, 0, 3,
    0x42, 0x01, 0x01, 0x22, 0, 1, 0, 2, 0x44, 0x01,
];

/// Baseline profile, one SPS, one PPS, 4-byte NAL lengths.
static AVCC: [u8; 17] = [1, 66, 0xC0, 30, 0xFF, 0xE1, 0, 4, 0x67, 0x42, 0xC0, 0x1E, 1, 0, 2, 0x68, 0xCE];

/// An empty `jpgC`.
static NO_PREFIX: &[u8] = &[];

/// Payload of the `mdat` in hand-assembled files.
static PAYLOAD: [u8; 16] = [0xAB; 16];
/// `ftyp` (24 bytes) + `mdat` header (8 bytes).
const PAYLOAD_OFFSET: u32 = 32;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn size(width: u32, height: u32) -> ImageSize {
    ImageSize::new(width, height).expect("valid size")
}

fn avc_record() -> DecoderConfigRecord {
    DecoderConfigRecord::parse(FourCC::new(*b"avcC"), &AVCC).expect("valid avcC")
}

// ============================================================================
// Hand assembly of box streams
// ============================================================================

fn leaf(box_type: &[u8; 4], payload: &[u8]) -> BmffBox {
    BmffBox::leaf(box_type, payload).expect("leaf")
}

fn full(box_type: &[u8; 4], version: u8, body: &[u8]) -> BmffBox {
    let mut payload = vec![version, 0, 0, 0];
    payload.extend_from_slice(body);
    leaf(box_type, &payload)
}

fn boxes(list: Vec<BmffBox>) -> TryVec<BmffBox> {
    TryVec::from(list)
}

fn ftyp() -> BmffBox {
    leaf(b"ftyp", b"mif1\0\0\0\0mif1avci")
}

fn hdlr() -> BmffBox {
    let mut body = vec![0; 4];
    body.extend_from_slice(b"pict");
    body.extend_from_slice(&[0; 13]);
    full(b"hdlr", 0, &body)
}

fn infe(id: u16, item_type: &[u8; 4]) -> BmffBox {
    let mut body = id.to_be_bytes().to_vec();
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(item_type);
    body.push(0);
    full(b"infe", 2, &body)
}

fn iinf(entries: Vec<BmffBox>) -> BmffBox {
    let mut body = (entries.len() as u16).to_be_bytes().to_vec();
    for e in &entries {
        bmff::encode_into(e, &mut body).unwrap();
    }
    full(b"iinf", 0, &body)
}

/// Version 0 `iloc` with 4-byte offsets and lengths, one extent per item.
fn iloc(items: &[(u16, u32, u32)]) -> BmffBox {
    let mut body = vec![0x44, 0x00];
    body.extend_from_slice(&(items.len() as u16).to_be_bytes());
    for &(id, offset, length) in items {
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(&[0, 0, 0, 1]);
        body.extend_from_slice(&offset.to_be_bytes());
        body.extend_from_slice(&length.to_be_bytes());
    }
    full(b"iloc", 0, &body)
}

fn ispe(width: u32, height: u32) -> BmffBox {
    let mut body = width.to_be_bytes().to_vec();
    body.extend_from_slice(&height.to_be_bytes());
    full(b"ispe", 0, &body)
}

/// `ipma` with one-byte associations: (item, [(essential, index)]).
fn ipma(items: &[(u16, &[(bool, u8)])]) -> BmffBox {
    let mut body = (items.len() as u32).to_be_bytes().to_vec();
    for &(id, associations) in items {
        body.extend_from_slice(&id.to_be_bytes());
        body.push(associations.len() as u8);
        for &(essential, index) in associations {
            body.push(u8::from(essential) << 7 | index);
        }
    }
    full(b"ipma", 0, &body)
}

fn iprp(ipco: Vec<BmffBox>, ipma: BmffBox) -> BmffBox {
    BmffBox::container(b"iprp", boxes(vec![BmffBox::container(b"ipco", boxes(ipco)), ipma]))
}

fn iref(reference_type: &[u8; 4], from: u16, to: &[u16]) -> BmffBox {
    let mut payload = from.to_be_bytes().to_vec();
    payload.extend_from_slice(&(to.len() as u16).to_be_bytes());
    for id in to {
        payload.extend_from_slice(&id.to_be_bytes());
    }
    let mut body = vec![];
    bmff::encode_into(&leaf(reference_type, &payload), &mut body).unwrap();
    full(b"iref", 0, &body)
}

/// `meta` children for AVC items sharing one `avcC` and one `ispe`, all
/// pointing at the whole `mdat` payload.
fn avc_meta(ids: &[u16]) -> Vec<BmffBox> {
    let associations: &[(bool, u8)] = &[(true, 1), (false, 2)];
    let map: Vec<(u16, &[(bool, u8)])> = ids.iter().map(|&id| (id, associations)).collect();
    let locations: Vec<(u16, u32, u32)> = ids.iter().map(|&id| (id, PAYLOAD_OFFSET, PAYLOAD.len() as u32)).collect();
    vec![
        hdlr(),
        full(b"pitm", 0, &ids[0].to_be_bytes()),
        iinf(ids.iter().map(|&id| infe(id, b"avc1")).collect()),
        iloc(&locations),
        iprp(vec![leaf(b"avcC", &AVCC), ispe(64, 48)], ipma(&map)),
    ]
}

/// `ftyp`, `mdat`, then `meta`, so item offsets do not depend on the
/// size of `meta`.
fn assemble(meta_children: Vec<BmffBox>) -> Vec<u8> {
    let mut file = bmff::encode(&ftyp()).unwrap();
    bmff::encode_into(&leaf(b"mdat", &PAYLOAD), &mut file).unwrap();
    let meta = BmffBox::full_container(b"meta", 0, 0, boxes(meta_children));
    bmff::encode_into(&meta, &mut file).unwrap();
    assert_eq!(file[24..28], [0, 0, 0, 24]);
    file
}

fn malformed_container(result: Result<Heif, Error>) -> &'static str {
    match result {
        Err(Error::MalformedContainer(reason)) => reason,
        other => panic!("expected MalformedContainer, got {other:?}"),
    }
}

// ============================================================================
// Building, saving and reopening
// ============================================================================

#[test]
fn avc_item_round_trip() {
    init_logger();
    let payload: Vec<u8> = (0..100u8).collect();
    let mut heif = Heif::new();
    let id = heif.create_item(Codec::Avc, size(1920, 1080), &AVCC[..], &payload).unwrap();
    assert_eq!(id, ItemId(1));

    let saved = heif.save().unwrap();
    let reopened = Heif::open(&saved).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.primary_item(), Some(id));

    let item = reopened.item(id).unwrap();
    assert_eq!(item.codec(), Codec::Avc);
    assert_eq!(item.item_type(), b"avc1");
    assert_eq!(item.size(), size(1920, 1080));
    assert_eq!(item.data(), &payload[..]);

    let record = reopened.item_config(id).unwrap();
    assert_eq!(record, &avc_record());
    assert_eq!(&record.sequence_parameter_sets().unwrap()[0][..], &[0x67, 0x42, 0xC0, 0x1E][..]);
    assert_eq!(&record.picture_parameter_sets().unwrap()[0][..], &[0x68, 0xCE][..]);
    assert_eq!(record.serialize().unwrap()[..], AVCC[..]);

    // Saving what was read writes the same bytes again.
    assert_eq!(reopened.save().unwrap(), saved);
}

#[test]
fn hevc_item_round_trip() {
    let mut heif = Heif::new();
    let id = heif.create_item(Codec::Hevc, size(640, 480), &HVCC[..], &PAYLOAD).unwrap();
    let saved = heif.save().unwrap();
    let top = bmff::decode_all(&saved).unwrap();
    assert_eq!(top[0].data().unwrap(), b"mif1\0\0\0\0mif1heic");
    assert_eq!(Codec::Hevc.brand(), b"heic");

    let reopened = Heif::open(&saved).unwrap();
    let item = reopened.item(id).unwrap();
    assert_eq!(item.codec(), Codec::Hevc);
    assert_eq!(item.item_type(), b"hvc1");
    assert_eq!(item.size(), size(640, 480));
    assert_eq!(item.data(), &PAYLOAD[..]);
    let record = reopened.item_config(id).unwrap();
    assert_eq!(record.codec(), Codec::Hevc);
    assert_eq!(record.serialize().unwrap()[..], HVCC[..]);
    assert_eq!(reopened.save().unwrap(), saved);
}

#[test]
fn item_name_with_nul_is_rejected() {
    let mut heif = Heif::new();
    let builder = ImageItemBuilder::new(Codec::Avc)
        .size(size(8, 8))
        .decoder_config(&AVCC[..])
        .data(&PAYLOAD)
        .name("left\0right");
    assert!(matches!(heif.add_item(builder), Err(Error::Unsupported(_))));
    assert!(heif.is_empty());
    assert!(heif.configs().unwrap().is_empty());
    assert_eq!(heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &PAYLOAD).unwrap(), ItemId(1));
}

#[test]
fn saved_file_starts_with_mif1_ftyp() {
    let mut heif = Heif::new();
    heif.create_item(Codec::Jpeg, size(2, 2), NO_PREFIX, &[0xFF, 0xD8]).unwrap();
    let saved = heif.save().unwrap();
    let top = bmff::decode_all(&saved).unwrap();
    let names: Vec<FourCC> = top.iter().map(|b| b.box_type).collect();
    assert_eq!(names, [FourCC::new(*b"ftyp"), FourCC::new(*b"meta"), FourCC::new(*b"mdat")]);
    assert_eq!(top[0].data().unwrap(), b"mif1\0\0\0\0mif1jpeg");
}

#[test]
fn incomplete_item_fails_save_until_completed() {
    let mut heif = Heif::new();
    let id = heif.add_item(ImageItemBuilder::new(Codec::Avc).size(size(16, 16))).unwrap();
    match heif.save() {
        Err(Error::IncompleteItem { item, missing }) => {
            assert_eq!(item, id);
            assert_eq!(missing, "decoder configuration");
        },
        other => panic!("unexpected {other:?}"),
    }

    heif.set_decoder_config(id, &AVCC[..]).unwrap();
    assert!(matches!(heif.save(), Err(Error::IncompleteItem { missing: "image data", .. })));

    heif.set_item_data(id, &[0, 0, 0, 1, 0x65]).unwrap();
    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    assert_eq!(reopened.item(id).unwrap().data(), &[0, 0, 0, 1, 0x65]);
}

#[test]
fn invalid_size_registers_nothing() {
    let mut heif = Heif::new();
    let built = ImageItemBuilder::new(Codec::Avc).size(ImageSize { width: 0, height: 5 }).decoder_config(&AVCC[..]);
    assert!(matches!(heif.add_item(built), Err(Error::InvalidSize { width: 0, height: 5 })));
    assert!(heif.is_empty());
    assert!(heif.configs().unwrap().is_empty());

    // The failed attempt used no identifier.
    let id = heif.create_item(Codec::Avc, size(1, 1), &AVCC[..], &[1]).unwrap();
    assert_eq!(id, ItemId(1));
}

#[test]
fn config_in_use_cannot_be_destroyed() {
    let mut heif = Heif::new();
    let config = heif.add_config(avc_record()).unwrap();
    let a = heif.create_item(Codec::Avc, size(8, 8), config, &[1]).unwrap();
    let b = heif.create_item(Codec::Avc, size(8, 8), config, &[2]).unwrap();

    match heif.destroy_config(config) {
        Err(Error::ConfigInUse { config: c, references }) => {
            assert_eq!(c, config);
            assert_eq!(references, 2);
        },
        other => panic!("unexpected {other:?}"),
    }
    heif.release_item(a).unwrap();
    assert!(matches!(heif.destroy_config(config), Err(Error::ConfigInUse { references: 1, .. })));
    heif.release_item(b).unwrap();
    assert_eq!(heif.destroy_config(config).unwrap(), avc_record());
    assert!(heif.config(config).is_none());
}

#[test]
fn config_type_mismatch_keeps_previous_config() {
    let mut heif = Heif::new();
    let id = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[1]).unwrap();
    let before = heif.item(id).unwrap().config_id();

    let jpeg = DecoderConfigRecord::parse(FourCC::new(*b"jpgC"), &[0xFF, 0xD8]).unwrap();
    match heif.set_decoder_config(id, ConfigSource::Record(jpeg)) {
        Err(Error::ConfigTypeMismatch { item, codec, config }) => {
            assert_eq!(item, Some(id));
            assert_eq!(codec, Codec::Avc);
            assert_eq!(config, Codec::Jpeg);
        },
        other => panic!("unexpected {other:?}"),
    }

    // 3-byte NAL lengths are not allowed for AVC items.
    let mut three_byte_lengths = AVCC;
    three_byte_lengths[4] = 0xFE;
    assert!(matches!(
        heif.set_decoder_config(id, &three_byte_lengths[..]),
        Err(Error::ConfigTypeMismatch { .. })
    ));

    assert_eq!(heif.item(id).unwrap().config_id(), before);
    assert_eq!(heif.item_config(id), Some(&avc_record()));
}

#[test]
fn shared_config_round_trip() {
    init_logger();
    let mut heif = Heif::new();
    let config = heif.add_config(avc_record()).unwrap();
    let a = heif.create_item(Codec::Avc, size(32, 32), config, &[1; 4]).unwrap();
    let b = heif.create_item(Codec::Avc, size(32, 32), config, &[2; 4]).unwrap();
    let c = heif.create_item(Codec::Avc, size(16, 16), &AVCC[..], &[3; 4]).unwrap();

    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    let shared = reopened.item(a).unwrap().config_id().unwrap();
    assert_eq!(reopened.item(b).unwrap().config_id(), Some(shared));
    assert_eq!(reopened.store().config_owner(shared), Some(ConfigOwner::Container));
    assert_eq!(reopened.store().config_references(shared), Some(2));

    let own = reopened.item(c).unwrap().config_id().unwrap();
    assert_ne!(own, shared);
    assert_eq!(reopened.store().config_owner(own), Some(ConfigOwner::Item(c)));
    assert_eq!(reopened.configs().unwrap().len(), 2);
    assert_eq!(reopened.item(b).unwrap().data(), &[2; 4]);
}

#[test]
fn references_round_trip() {
    let mut heif = Heif::new();
    let main = heif.create_item(Codec::Avc, size(64, 64), &AVCC[..], &[1]).unwrap();
    let thumb = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[2]).unwrap();
    let alpha = heif.create_item(Codec::Avc, size(64, 64), &AVCC[..], &[3]).unwrap();
    heif.add_reference(*b"thmb", thumb, main).unwrap();
    heif.add_reference(*b"auxl", alpha, main).unwrap();
    heif.add_property(alpha, ItemProperty::AuxiliaryType(AuxiliaryType::new(AuxiliaryType::ALPHA).unwrap()))
        .unwrap();
    heif.set_hidden(alpha, true).unwrap();

    assert!(matches!(
        heif.add_reference(*b"thmb", main, thumb),
        Err(Error::CyclicReference { .. })
    ));
    assert!(matches!(heif.add_reference(*b"thmb", main, ItemId(99)), Err(Error::UnknownItem(ItemId(99)))));

    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    assert_eq!(reopened.references_from(thumb, *b"thmb").collect::<Vec<_>>(), [main]);
    assert_eq!(reopened.referencing_items(main, *b"auxl").collect::<Vec<_>>(), [alpha]);
    assert_eq!(reopened.referencing_items(main, *b"cdsc").count(), 0);

    let alpha_item = reopened.item(alpha).unwrap();
    assert!(alpha_item.is_hidden());
    match &alpha_item.properties()[0] {
        ItemProperty::AuxiliaryType(aux) => assert!(aux.is_alpha()),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn releasing_an_item_drops_its_references() {
    let mut heif = Heif::new();
    let main = heif.create_item(Codec::Avc, size(64, 64), &AVCC[..], &[1]).unwrap();
    let thumb = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[2]).unwrap();
    heif.add_reference(*b"thmb", thumb, main).unwrap();
    heif.release_item(thumb).unwrap();
    assert!(heif.references().is_empty());
    assert!(heif.item(thumb).is_none());

    // Identifiers are never reused.
    let next = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[2]).unwrap();
    assert_eq!(next, ItemId(3));
}

#[test]
fn item_properties_round_trip() {
    let mut heif = Heif::new();
    let id = heif
        .add_item(
            ImageItemBuilder::new(Codec::Jpeg)
                .size(size(640, 480))
                .decoder_config(NO_PREFIX)
                .data(&[0xFF, 0xD8, 0xFF, 0xD9])
                .name("photo"),
        )
        .unwrap();
    heif.add_property(id, ItemProperty::Rotation(3)).unwrap();
    heif.add_property(id, ItemProperty::Mirror(MirrorAxis::Horizontal)).unwrap();
    heif.add_property(id, ItemProperty::PixelInformation([8, 8, 8].into_iter().collect())).unwrap();
    assert!(heif.add_property(id, ItemProperty::Rotation(4)).is_err());

    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    let item = reopened.item(id).unwrap();
    assert_eq!(item.name(), "photo");
    assert_eq!(item.properties(), heif.item(id).unwrap().properties());
    assert_eq!(reopened.item_ids_by_codec(Codec::Jpeg).unwrap()[..], [id]);
    assert!(reopened.item_ids_by_codec(Codec::Hevc).unwrap().is_empty());
}

#[test]
fn explicit_primary_item_is_kept() {
    let mut heif = Heif::new();
    heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[1]).unwrap();
    let second = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[2]).unwrap();
    heif.set_primary_item(second).unwrap();
    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    assert_eq!(reopened.primary_item(), Some(second));
}

#[test]
fn from_reader_reads_the_whole_stream() {
    let mut heif = Heif::new();
    let id = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[5; 10]).unwrap();
    let mut saved = vec![];
    heif.save_to(&mut saved).unwrap();
    let reopened = Heif::from_reader(&mut std::io::Cursor::new(saved)).unwrap();
    assert_eq!(reopened.item(id).unwrap().data(), &[5; 10]);
}

// ============================================================================
// Hand-assembled files
// ============================================================================

#[test]
fn hand_assembled_file_opens() {
    init_logger();
    let heif = Heif::open(&assemble(avc_meta(&[1, 2]))).unwrap();
    assert_eq!(heif.len(), 2);
    assert_eq!(heif.item(ItemId(2)).unwrap().data(), &PAYLOAD);
    assert_eq!(heif.item(ItemId(1)).unwrap().size(), size(64, 48));
    // One avcC for both items: shared.
    let config = heif.item(ItemId(1)).unwrap().config_id().unwrap();
    assert_eq!(heif.store().config_owner(config), Some(ConfigOwner::Container));
}

#[test]
fn new_ids_follow_the_file_ids() {
    let mut heif = Heif::open(&assemble(avc_meta(&[7]))).unwrap();
    let id = heif.create_item(Codec::Avc, size(8, 8), &AVCC[..], &[1]).unwrap();
    assert_eq!(id, ItemId(8));
}

#[test]
fn ftyp_must_come_first() {
    let mut file = bmff::encode(&leaf(b"free", &[])).unwrap();
    file.extend_from_slice(&assemble(avc_meta(&[1])));
    assert_eq!(malformed_container(Heif::open(&file)), "'ftyp' box must occur first");
    assert!(Heif::open(&[]).is_err());
}

#[test]
fn ftyp_needs_a_heif_brand() {
    let mut file = assemble(avc_meta(&[1]));
    file[8..12].copy_from_slice(b"isom");
    file[16..24].copy_from_slice(b"isomiso2");
    malformed_container(Heif::open(&file));
}

#[test]
fn duplicate_meta_is_malformed() {
    let mut file = assemble(avc_meta(&[1]));
    let meta = BmffBox::full_container(b"meta", 0, 0, boxes(avc_meta(&[1])));
    bmff::encode_into(&meta, &mut file).unwrap();
    malformed_container(Heif::open(&file));
}

#[test]
fn extent_outside_mdat_is_malformed() {
    let mut meta = avc_meta(&[1]);
    meta[3] = iloc(&[(1, 1000, 16)]);
    assert_eq!(malformed_container(Heif::open(&assemble(meta))), "item data outside every mdat and idat");

    // Starts inside, ends past the mdat.
    let mut meta = avc_meta(&[1]);
    meta[3] = iloc(&[(1, PAYLOAD_OFFSET + 8, 16)]);
    assert_eq!(malformed_container(Heif::open(&assemble(meta))), "extent crosses box boundary");
}

#[test]
fn unknown_essential_property() {
    init_logger();
    let mut meta = avc_meta(&[1]);
    meta[4] = iprp(
        vec![leaf(b"avcC", &AVCC), ispe(64, 48), leaf(b"xtra", &[1, 2])],
        ipma(&[(1, &[(true, 1), (false, 2), (true, 3)][..])]),
    );
    let file = assemble(meta);
    assert_eq!(malformed_container(Heif::open(&file)), "unknown essential property");

    let lenient = OpenConfig::default().lenient(true);
    let heif = Heif::open_with_config(&file, &lenient).unwrap();
    let expected = ItemProperty::Opaque {
        box_type: FourCC::new(*b"xtra"),
        payload: TryVec::from(vec![1, 2]),
        essential: true,
    };
    assert_eq!(heif.item(ItemId(1)).unwrap().properties(), [expected]);

    // Kept through another save.
    let again = Heif::open_with_config(&heif.save().unwrap(), &lenient).unwrap();
    assert_eq!(again.item(ItemId(1)).unwrap().properties()[0].box_type(), b"xtra");
}

#[test]
fn unknown_plain_property_is_kept() {
    let mut meta = avc_meta(&[1]);
    meta[4] = iprp(
        vec![leaf(b"avcC", &AVCC), ispe(64, 48), leaf(b"colr", b"nclx")],
        ipma(&[(1, &[(true, 1), (false, 2), (false, 3)][..])]),
    );
    let heif = Heif::open(&assemble(meta)).unwrap();
    let item = heif.item(ItemId(1)).unwrap();
    assert!(!item.properties()[0].is_essential());
    assert_eq!(item.properties()[0].box_type(), b"colr");
}

#[test]
fn cyclic_references_are_malformed() {
    let mut meta = avc_meta(&[1, 2]);
    let mut body = vec![0, 0, 0, 0];
    for (from, to) in [(1u16, 2u16), (2, 1)] {
        let mut payload = from.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 1]);
        payload.extend_from_slice(&to.to_be_bytes());
        bmff::encode_into(&leaf(b"dimg", &payload), &mut body).unwrap();
    }
    meta.push(leaf(b"iref", &body));
    assert_eq!(malformed_container(Heif::open(&assemble(meta))), "cyclic item references");
}

#[test]
fn reference_to_missing_item_is_malformed() {
    let mut meta = avc_meta(&[1]);
    meta.push(iref(b"thmb", 1, &[9]));
    assert_eq!(malformed_container(Heif::open(&assemble(meta))), "iref refers to a nonexistent item");
}

#[test]
fn coded_item_without_size_is_malformed() {
    let mut meta = avc_meta(&[1]);
    meta[4] = iprp(vec![leaf(b"avcC", &AVCC)], ipma(&[(1, &[(true, 1)][..])]));
    assert_eq!(malformed_container(Heif::open(&assemble(meta))), "coded item without ispe");
}

#[test]
fn coded_item_without_config_is_malformed() {
    let mut meta = avc_meta(&[1]);
    meta[4] = iprp(vec![ispe(4, 4)], ipma(&[(1, &[(false, 1)][..])]));
    assert_eq!(
        malformed_container(Heif::open(&assemble(meta))),
        "coded item without decoder configuration"
    );
}

#[test]
fn property_index_out_of_range_is_malformed() {
    let mut meta = avc_meta(&[1]);
    meta[4] = iprp(vec![leaf(b"avcC", &AVCC), ispe(4, 4)], ipma(&[(1, &[(true, 1), (false, 5)][..])]));
    malformed_container(Heif::open(&assemble(meta)));
}

/// Items 1 (`avc1`), 2 (`grid` over item 1, primary) and 3 (`Exif`
/// describing item 1).
fn grid_and_exif_meta() -> Vec<BmffBox> {
    let mut meta = avc_meta(&[1]);
    meta[1] = full(b"pitm", 0, &[0, 2]);
    meta[2] = iinf(vec![infe(1, b"avc1"), infe(2, b"grid"), infe(3, b"Exif")]);
    meta[3] = iloc(&[(1, PAYLOAD_OFFSET, 16), (2, PAYLOAD_OFFSET + 8, 8), (3, PAYLOAD_OFFSET, 4)]);
    meta[4] = iprp(
        vec![leaf(b"avcC", &AVCC), ispe(64, 48), leaf(b"clap", &[0; 32])],
        ipma(&[(1, &[(true, 1), (false, 2)][..]), (2, &[(false, 2), (true, 3)][..])]),
    );
    let mut body = vec![0, 0, 0, 0];
    for (reference_type, from) in [(b"dimg", 2u16), (b"cdsc", 3)] {
        let mut payload = from.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 1, 0, 1]);
        bmff::encode_into(&leaf(reference_type, &payload), &mut body).unwrap();
    }
    meta.push(leaf(b"iref", &body));
    meta
}

fn assert_grid_and_exif(heif: &Heif) {
    let (image, grid, exif) = (ItemId(1), ItemId(2), ItemId(3));
    assert_eq!(heif.item_ids().unwrap()[..], [image]);
    assert_eq!(heif.item_ids_by_type(*b"grid").unwrap()[..], [grid]);
    assert_eq!(heif.item_ids_by_type(*b"Exif").unwrap()[..], [exif]);
    assert_eq!(heif.item_ids_by_type(*b"avc1").unwrap()[..], [image]);
    assert_eq!(heif.primary_item(), Some(grid));

    assert_eq!(heif.item_type(exif), Some(FourCC::new(*b"Exif")));
    assert_eq!(heif.item_data(exif), Some(&PAYLOAD[..4]));
    let grid_item = heif.opaque_item(grid).unwrap();
    assert_eq!(grid_item.size(), Some(size(64, 48)));
    assert_eq!(grid_item.data(), &PAYLOAD[8..]);
    assert_eq!(grid_item.properties().len(), 1);
    assert_eq!(grid_item.properties()[0].box_type(), b"clap");
    assert!(grid_item.properties()[0].is_essential());

    assert_eq!(heif.references_from(grid, *b"dimg").collect::<Vec<_>>(), [image]);
    assert_eq!(heif.referencing_items(image, *b"cdsc").collect::<Vec<_>>(), [exif]);
}

#[test]
fn unmodeled_items_survive_open_and_save() {
    init_logger();
    let heif = Heif::open(&assemble(grid_and_exif_meta())).unwrap();
    assert_grid_and_exif(&heif);

    let saved = heif.save().unwrap();
    let mut reopened = Heif::open(&saved).unwrap();
    assert_grid_and_exif(&reopened);
    assert_eq!(reopened.save().unwrap(), saved);

    // Opaque ids stay taken.
    assert_eq!(reopened.create_item(Codec::Avc, size(1, 1), &AVCC[..], &[1]).unwrap(), ItemId(4));
    reopened.release_opaque_item(ItemId(2)).unwrap();
    assert_eq!(reopened.references_from(ItemId(2), *b"dimg").count(), 0);
    assert_eq!(reopened.primary_item(), Some(ItemId(1)));
}

#[test]
fn exif_item_can_be_added() {
    let mut heif = Heif::new();
    let image = heif.create_item(Codec::Jpeg, size(2, 2), NO_PREFIX, &[0xFF, 0xD8]).unwrap();
    let exif = heif.add_opaque_item(OpaqueItem::new(*b"Exif", b"\0\0\0\0II*\0").unwrap()).unwrap();
    heif.add_reference(*b"cdsc", exif, image).unwrap();
    assert!(matches!(OpaqueItem::new(*b"jpeg", &[]), Err(Error::Unsupported(_))));

    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.item_data(exif), Some(&b"\0\0\0\0II*\0"[..]));
    assert_eq!(reopened.referencing_items(image, *b"cdsc").collect::<Vec<_>>(), [exif]);
    assert_eq!(reopened.primary_item(), Some(image));
}

#[test]
fn protected_items_are_skipped() {
    init_logger();
    let mut meta = avc_meta(&[1]);
    let mut body = 2u16.to_be_bytes().to_vec();
    body.extend_from_slice(&[0, 1]);
    body.extend_from_slice(b"avc1");
    body.push(0);
    meta[2] = iinf(vec![infe(1, b"avc1"), full(b"infe", 2, &body)]);
    meta.push(iref(b"thmb", 2, &[1]));
    let mut heif = Heif::open(&assemble(meta)).unwrap();

    assert_eq!(heif.item_ids().unwrap()[..], [ItemId(1)]);
    assert_eq!(heif.item_type(ItemId(2)), None);
    assert!(heif.references().is_empty());
    // Skipped ids stay taken.
    assert_eq!(heif.create_item(Codec::Avc, size(1, 1), &AVCC[..], &[1]).unwrap(), ItemId(3));
}

#[test]
fn premultiplied_alpha_file_opens() {
    let mut meta = avc_meta(&[1, 2]);
    let mut body = vec![0, 0, 0, 0];
    for (reference_type, from, to) in [(b"auxl", 2u16, 1u16), (b"prem", 1, 2)] {
        let mut payload = from.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 1]);
        payload.extend_from_slice(&to.to_be_bytes());
        bmff::encode_into(&leaf(reference_type, &payload), &mut body).unwrap();
    }
    meta.push(leaf(b"iref", &body));
    let heif = Heif::open(&assemble(meta)).unwrap();
    assert_eq!(heif.references_from(ItemId(2), *b"auxl").collect::<Vec<_>>(), [ItemId(1)]);
    assert_eq!(heif.references_from(ItemId(1), *b"prem").collect::<Vec<_>>(), [ItemId(2)]);

    let reopened = Heif::open(&heif.save().unwrap()).unwrap();
    assert_eq!(reopened.references().len(), 2);
}

#[test]
fn idat_extents() {
    let mut meta = avc_meta(&[1]);
    // version 1, offset_size 4, length_size 4, construction_method 1
    let body = [
        0x44, 0x00, 0, 1, //
        0, 1, 0, 1, 0, 0, 0, 1, //
        0, 0, 0, 2, 0, 0, 0, 3,
    ];
    meta[3] = full(b"iloc", 1, &body);
    meta.push(leaf(b"idat", &[9, 8, 7, 6, 5, 4]));
    let heif = Heif::open(&assemble(meta)).unwrap();
    assert_eq!(heif.item(ItemId(1)).unwrap().data(), &[7, 6, 5]);
}

#[test]
fn truncated_box_is_malformed() {
    let file = assemble(avc_meta(&[1]));
    match Heif::open(&file[..file.len() - 3]) {
        Err(Error::MalformedBox { box_type, .. }) => assert_eq!(box_type, Some(FourCC::new(*b"meta"))),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn non_zero_flags_need_lenient() {
    let mut meta = avc_meta(&[1]);
    meta[1] = leaf(b"pitm", &[0, 0, 0, 1, 0, 1]);
    let file = assemble(meta);
    assert!(matches!(Heif::open(&file), Err(Error::Unsupported(_))));
    let heif = Heif::open_with_config(&file, &OpenConfig::default().lenient(true)).unwrap();
    assert_eq!(heif.primary_item(), Some(ItemId(1)));
}

// ============================================================================
// Resource limits
// ============================================================================

#[test]
fn item_count_limit() {
    let file = assemble(avc_meta(&[1, 2, 3]));
    let config = OpenConfig::default().with_max_items(2);
    assert!(matches!(
        Heif::open_with_config(&file, &config),
        Err(Error::ResourceLimitExceeded("item count limit exceeded"))
    ));
    Heif::open_with_config(&file, &config.with_max_items(3)).unwrap();
}

#[test]
fn peak_memory_limit() {
    let file = assemble(avc_meta(&[1]));
    let config = OpenConfig::default().with_peak_memory_limit(64);
    assert!(matches!(Heif::open_with_config(&file, &config), Err(Error::ResourceLimitExceeded(_))));
    Heif::open_with_config(&file, &OpenConfig::unlimited()).unwrap();
}

#[test]
fn megapixel_limit() {
    let mut meta = avc_meta(&[1]);
    meta[4] = iprp(vec![leaf(b"avcC", &AVCC), ispe(4000, 3000)], ipma(&[(1, &[(true, 1), (false, 2)][..])]));
    let file = assemble(meta);
    let config = OpenConfig::default().with_total_megapixels_limit(10);
    assert!(matches!(
        Heif::open_with_config(&file, &config),
        Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"))
    ));
    Heif::open_with_config(&file, &config.with_total_megapixels_limit(12)).unwrap();
}

// ============================================================================
// Box codec
// ============================================================================

#[test]
fn box_tree_round_trip() {
    let file = assemble(avc_meta(&[1, 2]));
    let tree = bmff::decode_all(&file).unwrap();
    let mut again = vec![];
    for b in tree.iter() {
        bmff::encode_into(b, &mut again).unwrap();
    }
    assert_eq!(again, file);
}

#[test]
fn lazy_reader_reports_positions() {
    let file = assemble(avc_meta(&[1]));
    let mut reader = bmff::decode(&file);
    let ftyp = reader.next_located().unwrap().unwrap();
    assert_eq!((ftyp.offset, ftyp.payload_offset, ftyp.payload_len), (0, 8, 16));
    let mdat = reader.next_located().unwrap().unwrap();
    assert_eq!(mdat.payload_offset, u64::from(PAYLOAD_OFFSET));
    assert!(reader.next_located().unwrap().is_some());
    assert!(reader.next_located().unwrap().is_none());
}
