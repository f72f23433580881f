//! List the box tree and the coded image items of a HEIF file
use heif_store::bmff::{self, BmffBox};
use heif_store::Heif;
use std::env;
use std::fs;

fn print_tree(b: &BmffBox, depth: usize) {
    match b.data() {
        Some(data) => println!("{:indent$}{} ({} bytes)", "", b.box_type, data.len(), indent = depth * 2),
        None => println!("{:indent$}{}", "", b.box_type, indent = depth * 2),
    }
    for child in b.children() {
        print_tree(child, depth + 1);
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <heif-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let bytes = fs::read(path).expect("Failed to read file");

    println!("File: {path}");
    for b in bmff::decode(&bytes) {
        match b {
            Ok(b) if b.box_type == b"mdat" => println!("mdat ({} bytes)", b.payload_len()),
            Ok(b) => print_tree(&b, 0),
            Err(e) => {
                eprintln!("Box error: {e}");
                std::process::exit(1);
            },
        }
    }

    let heif = match Heif::open(&bytes) {
        Ok(heif) => heif,
        Err(e) => {
            eprintln!("Parse error: {e}");
            std::process::exit(1);
        },
    };

    println!("Primary item: {:?}", heif.primary_item());
    for id in heif.item_ids().expect("out of memory").iter() {
        let Some(item) = heif.item(*id) else { continue };
        println!(
            "Item {id}: {} {}x{}, {} bytes, config {:?}{}",
            item.item_type(),
            item.size().width,
            item.size().height,
            item.data().len(),
            item.config_id(),
            if item.is_hidden() { ", hidden" } else { "" },
        );
        if let Some(record) = heif.item_config(*id) {
            println!("  {:?} NAL length size: {:?}", record.codec(), record.length_size());
        }
        for property in item.properties() {
            println!("  {} essential={}", property.box_type(), property.is_essential());
        }
        for r in heif.references().iter().filter(|r| r.from == *id) {
            println!("  {} -> {}", r.reference_type, r.to);
        }
    }
    for (id, item) in heif.opaque_items() {
        println!(
            "Item {id}: {} (not decoded), {} bytes, size {:?}",
            item.item_type(),
            item.data().len(),
            item.size().map(|s| (s.width, s.height)),
        );
    }
}
