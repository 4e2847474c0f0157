//! OpenRaster (.ora) format support
//!
//! ORA is a ZIP archive containing:
//! - mimetype: "image/openraster" (stored, not compressed)
//! - stack.xml: layer structure and metadata
//! - data/*.png: individual layer pixel data
//! - mergedimage.png: flattened composite
//! - Thumbnails/thumbnail.png: bounded preview
//!
//! Mask layers live in a nested stack named "layers"; the base raster is the
//! layer named "original". Image properties and metrics ride along as
//! `prop_*` / `metrics_*` attributes on the original layer element, so they
//! survive a round trip through ORA-aware editors.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Write};
use std::path::Path;

use image::ImageFormat;
use indexmap::IndexMap;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::file::category::CategoryFilter;
use crate::file::Codec;
use crate::model::encode::{encode_classmap_png, encode_rgba_png, mask_from_dynamic};
use crate::model::{
    normalize_name, Dimension, Layer, MultiLayerImage, PropertyValue, ORIGINAL_LAYER_KEY,
};

const ORA_MIMETYPE: &str = "image/openraster";
const MASK_STACK_NAME: &str = "layers";
const PROPERTY_ATTR_PREFIX: &str = "prop_";
const METRIC_ATTR_PREFIX: &str = "metrics_";
const TITLE_PROPERTY: &str = "title";

/// Codec for the OpenRaster interchange format.
pub struct OraCodec {
    filter: CategoryFilter,
    extensions: Vec<String>,
}

impl OraCodec {
    pub fn new(filter: CategoryFilter, extensions: Vec<String>) -> Self {
        Self { filter, extensions }
    }
}

fn write_mask_layer_xml(writer: &mut Writer<Cursor<Vec<u8>>>, layer: &Layer) -> Result<()> {
    let mut layer_elem = BytesStart::new("layer");
    layer_elem.push_attribute(("name", layer.name()));
    layer_elem.push_attribute(("src", format!("data/{}.png", layer.name()).as_str()));
    layer_elem.push_attribute(("x", layer.x.to_string().as_str()));
    layer_elem.push_attribute(("y", layer.y.to_string().as_str()));
    layer_elem.push_attribute(("composite-op", "svg:src-over"));
    layer_elem.push_attribute(("opacity", layer.opacity.to_string().as_str()));
    layer_elem.push_attribute((
        "visibility",
        if layer.visibility { "visible" } else { "hidden" },
    ));
    writer.write_event(Event::Empty(layer_elem))?;
    Ok(())
}

fn write_original_layer_xml(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    img: &MultiLayerImage,
) -> Result<()> {
    let mut layer_elem = BytesStart::new("layer");
    layer_elem.push_attribute(("name", ORIGINAL_LAYER_KEY));
    layer_elem.push_attribute((
        "src",
        format!("data/{ORIGINAL_LAYER_KEY}.png").as_str(),
    ));
    layer_elem.push_attribute(("x", "0"));
    layer_elem.push_attribute(("y", "0"));
    layer_elem.push_attribute(("composite-op", "svg:src-over"));
    layer_elem.push_attribute(("opacity", "1.0"));
    layer_elem.push_attribute(("visibility", "visible"));

    let title_attr = format!("{PROPERTY_ATTR_PREFIX}{TITLE_PROPERTY}");
    layer_elem.push_attribute((title_attr.as_str(), img.title()));
    for (key, value) in &img.properties {
        let attr_key = format!("{PROPERTY_ATTR_PREFIX}{key}");
        layer_elem.push_attribute((attr_key.as_str(), value.to_serial_string().as_str()));
    }
    for (key, value) in &img.metrics {
        let attr_key = format!("{METRIC_ATTR_PREFIX}{key}");
        layer_elem.push_attribute((attr_key.as_str(), value.to_string().as_str()));
    }

    writer.write_event(Event::Empty(layer_elem))?;
    Ok(())
}

/// Generate stack.xml content for a multi-layer image
fn generate_stack_xml(img: &MultiLayerImage) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let dim = img.dimension();

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut image_start = BytesStart::new("image");
    image_start.push_attribute(("w", dim.width.to_string().as_str()));
    image_start.push_attribute(("h", dim.height.to_string().as_str()));
    writer.write_event(Event::Start(image_start))?;

    let mut stack_start = BytesStart::new("stack");
    stack_start.push_attribute(("composite-op", "svg:src-over"));
    stack_start.push_attribute(("opacity", "1.0"));
    stack_start.push_attribute(("visibility", "visible"));
    writer.write_event(Event::Start(stack_start))?;

    // Mask group (in reverse order - ORA uses top-to-bottom, we use bottom-to-top)
    // Only layers that carry a mask get an entry; save skips their data too
    let mut mask_stack = BytesStart::new("stack");
    mask_stack.push_attribute(("name", MASK_STACK_NAME));
    writer.write_event(Event::Start(mask_stack))?;
    for layer in img.layers.iter().rev().filter(|l| l.is_valid()) {
        write_mask_layer_xml(&mut writer, layer)?;
    }
    writer.write_event(Event::End(BytesEnd::new("stack")))?;

    // The base raster sits below the mask group
    write_original_layer_xml(&mut writer, img)?;

    writer.write_event(Event::End(BytesEnd::new("stack")))?;
    writer.write_event(Event::End(BytesEnd::new("image")))?;

    Ok(writer.into_inner().into_inner())
}

/// One parsed <layer> element.
#[derive(Debug)]
struct OraLayerRecord {
    name: String,
    src: String,
    x: i32,
    y: i32,
    opacity: f32,
    visible: bool,
    properties: IndexMap<String, PropertyValue>,
    metrics: IndexMap<String, f64>,
}

/// Parse stack.xml and extract layer records in document order.
fn parse_stack_xml(xml_data: &[u8]) -> Result<Vec<OraLayerRecord>> {
    let mut reader = Reader::from_reader(xml_data);
    reader.trim_text(true);

    let mut records = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) if e.name().as_ref() == b"layer" => {
                let mut record = OraLayerRecord {
                    name: String::new(),
                    src: String::new(),
                    x: 0,
                    y: 0,
                    opacity: 1.0,
                    visible: true,
                    properties: IndexMap::new(),
                    metrics: IndexMap::new(),
                };

                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = String::from_utf8_lossy(&attr.value).to_string();

                    match key.as_str() {
                        "name" => record.name = value,
                        "src" => record.src = value,
                        "x" => record.x = value.parse().unwrap_or(0),
                        "y" => record.y = value.parse().unwrap_or(0),
                        "opacity" => record.opacity = value.parse().unwrap_or(1.0),
                        "visibility" => record.visible = value != "hidden",
                        _ if key.starts_with(PROPERTY_ATTR_PREFIX) => {
                            let pkey = key.trim_start_matches(PROPERTY_ATTR_PREFIX).to_string();
                            record.properties.insert(pkey, PropertyValue::Text(value));
                        }
                        _ if key.starts_with(METRIC_ATTR_PREFIX) => {
                            let mkey = key.trim_start_matches(METRIC_ATTR_PREFIX).to_string();
                            match value.parse::<f64>() {
                                Ok(v) => {
                                    record.metrics.insert(mkey, v);
                                }
                                Err(_) => {
                                    warn!("[ORA] metric '{}' is not numeric: '{}'", mkey, value);
                                }
                            }
                        }
                        _ => {}
                    }
                }

                // Nameless layers fall back to their payload file stem
                if record.name.is_empty() {
                    record.name = record
                        .src
                        .trim_start_matches("data/")
                        .trim_end_matches(".png")
                        .to_string();
                }

                records.push(record);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(format!("XML parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(records)
}

fn read_zip_entry(zip: &mut ZipArchive<BufReader<File>>, name: &str) -> Result<Vec<u8>> {
    let mut entry = zip.by_name(name)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

impl Codec for OraCodec {
    fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    fn load(&mut self, path: &Path) -> Result<MultiLayerImage> {
        info!("[ORA] Loading file: {:?}", path);
        let file = File::open(path)?;
        let mut zip = ZipArchive::new(BufReader::new(file))?;

        // 1. The mimetype entry identifies the container
        {
            let mut mimetype_file = zip.by_name("mimetype")?;
            let mut mimetype = String::new();
            mimetype_file.read_to_string(&mut mimetype)?;
            if mimetype.trim() != ORA_MIMETYPE {
                return Err(Error::InvalidFormat(format!(
                    "invalid ORA mimetype: expected '{ORA_MIMETYPE}', got '{mimetype}'"
                )));
            }
        }

        // 2. Parse stack.xml
        let stack_xml = read_zip_entry(&mut zip, "stack.xml")?;
        let records = parse_stack_xml(&stack_xml)?;

        let original_record = records
            .iter()
            .find(|r| normalize_name(&r.name) == ORIGINAL_LAYER_KEY)
            .ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "ORA file has no '{ORIGINAL_LAYER_KEY}' layer: {}",
                    path.display()
                ))
            })?;

        // 3. Decode the base raster
        let original_bytes = read_zip_entry(&mut zip, &original_record.src)?;
        let original =
            image::load_from_memory_with_format(&original_bytes, ImageFormat::Png)?.to_rgba8();
        let mut img = MultiLayerImage::new(path, original);

        let mut properties = original_record.properties.clone();
        if let Some(title) = properties.shift_remove(TITLE_PROPERTY) {
            img.set_title(&title.to_serial_string());
        }
        img.properties = properties;
        img.metrics = original_record.metrics.clone();

        // 4. Decode the kept mask layers (document order is top-to-bottom)
        let mut masks = Vec::new();
        for record in records
            .iter()
            .filter(|r| normalize_name(&r.name) != ORIGINAL_LAYER_KEY)
        {
            let class_id = match self.filter.resolve(&record.name) {
                Some(id) => id,
                None => {
                    debug!("[ORA] skipping layer '{}' (not in categories)", record.name);
                    continue;
                }
            };
            let mask_bytes = read_zip_entry(&mut zip, &record.src)?;
            let decoded = image::load_from_memory_with_format(&mask_bytes, ImageFormat::Png)?;
            let mut layer = Layer::with_mask(&record.name, class_id, mask_from_dynamic(&decoded));
            layer.set_opacity(record.opacity);
            layer.visibility = record.visible;
            layer.x = record.x;
            layer.y = record.y;
            masks.push(layer);
        }
        masks.reverse();
        img.layers = masks;

        info!(
            "[ORA] Loaded {:?}: {} mask layers, {}x{}",
            path,
            img.layers.len(),
            img.dimension().width,
            img.dimension().height
        );
        Ok(img)
    }

    fn save(&self, img: &MultiLayerImage, path: &Path) -> Result<()> {
        info!("[ORA] Saving file: {:?}", path);
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);

        // 1. mimetype must be the first entry and must not be compressed
        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        zip.start_file("mimetype", options_stored)?;
        zip.write_all(ORA_MIMETYPE.as_bytes())?;

        // Everything else deflates
        let options_deflate = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // 2. Write stack.xml
        let stack_xml = generate_stack_xml(img)?;
        zip.start_file("stack.xml", options_deflate)?;
        zip.write_all(&stack_xml)?;

        // 3. Write layer data
        zip.start_file(
            format!("data/{ORIGINAL_LAYER_KEY}.png").as_str(),
            options_deflate,
        )?;
        zip.write_all(&encode_rgba_png(img.original())?)?;

        for layer in &img.layers {
            if !layer.is_valid() {
                warn!("[ORA] skipping layer '{}' without a mask", layer.name());
                continue;
            }
            zip.start_file(
                format!("data/{}.png", layer.name()).as_str(),
                options_deflate,
            )?;
            zip.write_all(&encode_classmap_png(layer)?)?;
        }

        // 4. Write merged composite and thumbnail
        zip.start_file("mergedimage.png", options_deflate)?;
        zip.write_all(&encode_rgba_png(&img.blended_image())?)?;

        let thumbnail = img.thumbnail_within(Dimension::new(256, 256));
        zip.add_directory("Thumbnails", options_deflate)?;
        zip.start_file("Thumbnails/thumbnail.png", options_deflate)?;
        zip.write_all(&encode_rgba_png(&thumbnail)?)?;

        zip.finish()?;
        info!(
            "[ORA] Saved {:?}: {} mask layers",
            path,
            img.layers.iter().filter(|l| l.is_valid()).count()
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbaImage};

    fn sample_image() -> MultiLayerImage {
        let mut img = MultiLayerImage::new("bridge.ora", RgbaImage::new(4, 3));
        img.set_property("altitude", "12312.123");
        img.set_metric("iou", 0.78);

        let mut mask = GrayImage::new(4, 3);
        mask.put_pixel(1, 1, image::Luma([1]));
        let mut crack = Layer::with_mask("crack", 100, mask);
        crack.set_opacity(0.5);
        crack.visibility = false;
        crack.x = 1;
        crack.y = 2;
        img.layers.push(crack);
        img.layers.push(Layer::with_mask(
            "spalling",
            200,
            GrayImage::new(4, 3),
        ));
        img
    }

    #[test]
    fn stack_xml_round_trip() {
        let img = sample_image();
        let xml = generate_stack_xml(&img).unwrap();
        let records = parse_stack_xml(&xml).unwrap();

        // two masks in reverse order, then the original
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].name, "spalling");
        assert_eq!(records[1].name, "crack");
        assert_eq!(records[2].name, "original");

        assert_eq!(records[1].src, "data/crack.png");
        assert_eq!(records[1].x, 1);
        assert_eq!(records[1].y, 2);
        assert_eq!(records[1].opacity, 0.5);
        assert!(!records[1].visible);

        let original = &records[2];
        assert_eq!(
            original.properties.get("altitude").unwrap().as_text(),
            Some("12312.123")
        );
        assert_eq!(
            original.properties.get(TITLE_PROPERTY).unwrap().as_text(),
            Some("bridge")
        );
        assert_eq!(original.metrics.get("iou"), Some(&0.78));
    }

    #[test]
    fn layer_name_falls_back_to_src() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
            <image w="4" h="3"><stack>
            <layer src="data/moss.png" opacity="1.0"/>
            </stack></image>"#;
        let records = parse_stack_xml(xml).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "moss");
    }

    #[test]
    fn mismatched_xml_is_an_error() {
        let err = parse_stack_xml(b"<image><stack></wrong></image>").unwrap_err();
        assert!(matches!(err, Error::Xml(_)));
    }
}
