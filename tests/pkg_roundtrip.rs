//! Package container round trips
//!
//! End-to-end save/load through the package codec, plus the free-form
//! asset store semantics on real files.

use std::io::Write;
use std::path::PathBuf;

use image::{GrayImage, Luma, Rgba, RgbaImage};
use maskpack::{
    CategoryFilter, Codec, CodecRegistry, Error, Layer, MultiLayerImage, PackageArchive,
};
use tempfile::TempDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Route codec logs through the test harness; `RUST_LOG` overrides the level.
fn trace_init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maskpack=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn filter() -> CategoryFilter {
    CategoryFilter::explicit([("Crack", 100u8), ("SurfDeg", 200u8)])
}

fn checker_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| Luma([((x + y) % 2) as u8]))
}

fn solid_rgba(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba(rgba))
}

fn sample_image(path: PathBuf) -> MultiLayerImage {
    let mut img = MultiLayerImage::new(path, solid_rgba(8, 6, [10, 20, 30, 255]));
    img.set_property("inspector", "jb");
    img.set_metric("score", 0.5);

    let mut crack = Layer::with_mask("crack", 1, checker_mask(8, 6));
    crack.set_opacity(0.75);
    img.layers.push(crack);

    let mut surf = Layer::with_mask("surfdeg", 1, GrayImage::from_pixel(8, 6, Luma([1])));
    surf.set_opacity(0.25);
    surf.visibility = false;
    img.layers.push(surf);

    img
}

fn pkg_codec() -> Box<dyn Codec> {
    let registry = CodecRegistry::builtin();
    registry.build("pkg", filter()).unwrap()
}

// === Save/load identity ===

#[test]
fn save_then_load_preserves_layers_and_metadata() {
    trace_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inspection.pkg");
    let img = sample_image(path.clone());

    let mut codec = pkg_codec();
    codec.save(&img, &path).unwrap();
    let loaded = codec.load(&path).unwrap();

    assert_eq!(loaded.title(), "inspection");
    assert_eq!(loaded.count_layers(), 3, "original plus two mask layers");
    assert_eq!(loaded.layer_names(), vec!["crack", "surfdeg"]);

    let crack = loaded.get_layer("crack").unwrap();
    assert_eq!(crack.class_id, 100, "class id comes from the filter");
    assert!((crack.opacity - 0.75).abs() < 1e-6);
    assert!(crack.visibility);
    assert_eq!(crack.image.as_ref().unwrap(), &checker_mask(8, 6));

    let surf = loaded.get_layer("surfdeg").unwrap();
    assert_eq!(surf.class_id, 200);
    assert!((surf.opacity - 0.25).abs() < 1e-6);
    assert!(!surf.visibility);

    assert_eq!(
        loaded.get_property("inspector").unwrap().as_text(),
        Some("jb")
    );
    assert!((loaded.get_metric("score").unwrap() - 0.5).abs() < 1e-9);
    assert_eq!(loaded.original(), img.original());
    assert!(loaded.archive.is_some(), "loading attaches the asset store");
}

#[test]
fn second_round_trip_is_stable() {
    trace_init();
    let dir = TempDir::new().unwrap();
    let first_path = dir.path().join("a.pkg");
    let second_path = dir.path().join("b.pkg");

    let mut codec = pkg_codec();
    codec.save(&sample_image(first_path.clone()), &first_path).unwrap();
    let first = codec.load(&first_path).unwrap();
    codec.save(&first, &second_path).unwrap();
    let second = codec.load(&second_path).unwrap();

    assert_eq!(first.layer_names(), second.layer_names());
    for name in first.layer_names() {
        let a = first.get_layer(name).unwrap();
        let b = second.get_layer(name).unwrap();
        assert_eq!(a.class_id, b.class_id);
        assert_eq!(a.visibility, b.visibility);
        assert!((a.opacity - b.opacity).abs() < 1e-6);
        assert_eq!(a.image, b.image);
    }
}

#[test]
fn images_only_mode_skips_metadata() {
    trace_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inspection.pkg");

    let mut codec = pkg_codec();
    codec.save(&sample_image(path.clone()), &path).unwrap();

    let registry = CodecRegistry::builtin();
    let entry = registry.find("pkg").unwrap();
    let mut fast = maskpack::file::pkg::PkgCodec::new(
        filter(),
        entry.extensions().to_vec(),
    )
    .with_images_only(true);
    let loaded = fast.load(&path).unwrap();

    assert!(loaded.properties.is_empty());
    assert!(loaded.metrics.is_empty());
    assert_eq!(loaded.count_layers(), 3);
}

#[test]
fn missing_manifest_entry_is_not_found() {
    trace_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hollow.pkg");

    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file("stray.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"nothing useful").unwrap();
    writer.finish().unwrap();

    let err = pkg_codec().load(&path).unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
}

// === Free-form asset store ===

#[test]
fn asset_overwrite_requires_permission_and_invalidates_cache() {
    trace_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("probe.pkg");
    pkg_codec().save(&sample_image(path.clone()), &path).unwrap();

    let red = solid_rgba(3, 3, [255, 0, 0, 255]);
    let blue = solid_rgba(3, 3, [0, 0, 255, 255]);

    let mut archive = PackageArchive::new(&path);
    archive.set_asset("probe.depth", &red, false).unwrap();
    assert_eq!(archive.get_asset("probe.depth").unwrap(), red);

    let err = archive.set_asset("probe.depth", &blue, false).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
    assert_eq!(
        archive.get_asset("probe.depth").unwrap(),
        red,
        "rejected write must leave the old content"
    );

    archive.set_asset("probe.depth", &blue, true).unwrap();
    assert_eq!(
        archive.get_asset("probe.depth").unwrap(),
        blue,
        "cached copy must be dropped on overwrite"
    );
}

#[test]
fn assets_survive_codec_resave() {
    trace_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("probe.pkg");

    let mut codec = pkg_codec();
    codec.save(&sample_image(path.clone()), &path).unwrap();

    let red = solid_rgba(4, 2, [255, 0, 0, 255]);
    let mut archive = PackageArchive::new(&path);
    archive.set_asset("scan.depth.front", &red, false).unwrap();

    // Reload so the image carries the asset store, then rewrite in place
    let loaded = codec.load(&path).unwrap();
    codec.save(&loaded, &path).unwrap();

    let mut reopened = PackageArchive::new(&path);
    assert_eq!(
        reopened.get_asset_list().unwrap(),
        vec!["scan.depth.front".to_string()]
    );
    assert_eq!(reopened.get_asset("scan.depth.front").unwrap(), red);

    let reloaded = codec.load(&path).unwrap();
    assert_eq!(reloaded.layer_names(), vec!["crack", "surfdeg"]);
}
