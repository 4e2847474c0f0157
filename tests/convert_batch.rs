//! Batch conversion
//!
//! Directory fan-out with per-file failure isolation, format chaining
//! through the pipeline, and lazy analysis of file sets.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgba, RgbaImage};
use maskpack::{
    calculate_stats, CategoryFilter, CodecRegistry, ConversionPipeline, Layer,
    MultiLayerImage,
};
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

fn sample_image(path: PathBuf) -> MultiLayerImage {
    let mut img = MultiLayerImage::new(
        path,
        RgbaImage::from_pixel(8, 6, Rgba([10, 20, 30, 255])),
    );
    let mut crack = Layer::with_mask(
        "crack",
        1,
        GrayImage::from_fn(8, 6, |x, y| Luma([((x + y) % 2) as u8])),
    );
    crack.set_opacity(0.75);
    img.layers.push(crack);
    let mut surf = Layer::with_mask("surfdeg", 1, GrayImage::from_pixel(8, 6, Luma([1])));
    surf.visibility = false;
    img.layers.push(surf);
    img
}

/// Lay out `good` valid packages plus `broken` junk files in `dir`.
fn build_corpus(registry: &CodecRegistry, dir: &Path, good: usize, broken: usize) {
    fs::create_dir_all(dir).unwrap();
    let codec = registry.build("pkg", filter()).unwrap();
    for i in 0..good {
        let path = dir.join(format!("scan_{i}.pkg"));
        codec.save(&sample_image(path.clone()), &path).unwrap();
    }
    for i in 0..broken {
        fs::write(dir.join(format!("broken_{i}.pkg")), b"not a container").unwrap();
    }
}

// === Directory batches ===

#[test]
fn batch_isolates_failures_and_keeps_outputs() {
    trace_init();
    let registry = CodecRegistry::builtin();
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let dst = root.path().join("out");
    build_corpus(&registry, &src, 3, 1);

    let pipeline = ConversionPipeline::new(&registry, "pkg", "tiff", filter())
        .unwrap()
        .with_workers(2);
    let pattern = format!("{}/*.pkg", src.display());
    let outcomes = pipeline.convert_dir(&pattern, &dst).unwrap();

    assert_eq!(outcomes.len(), 4);
    let failures: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].source.ends_with("broken_0.pkg"));
    assert!(failures[0].error.is_some());

    let mut outputs: Vec<_> = fs::read_dir(&dst)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    outputs.sort();
    assert_eq!(outputs, vec!["scan_0.tif", "scan_1.tif", "scan_2.tif"]);

    // Outputs written before the failure are intact and loadable
    let mut tiff = registry.build("tiff", filter()).unwrap();
    let converted = tiff.load(&dst.join("scan_0.tif")).unwrap();
    assert_eq!(converted.layer_names(), vec!["crack", "surfdeg"]);
    assert_eq!(converted.get_layer("crack").unwrap().class_id, 100);
}

#[test]
fn lazy_batch_converts_while_consumed() {
    trace_init();
    let registry = CodecRegistry::builtin();
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let dst = root.path().join("out");
    build_corpus(&registry, &src, 2, 1);

    let pipeline = ConversionPipeline::new(&registry, "pkg", "openraster", filter()).unwrap();
    let pattern = format!("{}/*.pkg", src.display());
    let outcomes: Vec<_> = pipeline.convert_dir_lazy(&pattern, &dst).unwrap().collect();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.iter().filter(|o| o.success).count(), 2);
    assert_eq!(fs::read_dir(&dst).unwrap().count(), 2);

    let mut ora = registry.build("openraster", filter()).unwrap();
    let converted = ora.load(&dst.join("scan_0.ora")).unwrap();
    assert_eq!(converted.layer_names(), vec!["crack", "surfdeg"]);
    assert!(!converted.get_layer("surfdeg").unwrap().visibility);
}

#[test]
fn empty_pattern_yields_empty_batch() {
    trace_init();
    let registry = CodecRegistry::builtin();
    let root = tempfile::tempdir().unwrap();
    let dst = root.path().join("out");

    let pipeline = ConversionPipeline::new(&registry, "pkg", "tiff", filter()).unwrap();
    let pattern = format!("{}/nothing/*.pkg", root.path().display());
    let outcomes = pipeline.convert_dir(&pattern, &dst).unwrap();
    assert!(outcomes.is_empty());
    assert!(dst.is_dir(), "destination directory is still created");
}

// === Format chaining ===

#[test]
fn pkg_to_tiff_to_pkg_preserves_annotations() {
    trace_init();
    let registry = CodecRegistry::builtin();
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("scan.pkg");
    let middle = root.path().join("scan.tif");
    let result = root.path().join("scan_back.pkg");

    registry
        .build("pkg", filter())
        .unwrap()
        .save(&sample_image(source.clone()), &source)
        .unwrap();

    ConversionPipeline::new(&registry, "pkg", "tiff", filter())
        .unwrap()
        .convert_file(&source, &middle)
        .unwrap();
    ConversionPipeline::for_paths(&registry, &middle, &result, filter())
        .unwrap()
        .convert_file(&middle, &result)
        .unwrap();

    let original = registry.load_file(&source, filter()).unwrap();
    let round_tripped = registry.load_file(&result, filter()).unwrap();
    assert_eq!(original.layer_names(), round_tripped.layer_names());
    for name in original.layer_names() {
        let a = original.get_layer(name).unwrap();
        let b = round_tripped.get_layer(name).unwrap();
        assert_eq!(a.class_id, b.class_id);
        assert_eq!(a.visibility, b.visibility);
        assert!((a.opacity - b.opacity).abs() < 1e-6);
        assert_eq!(a.image, b.image);
    }
}

#[test]
fn mismatched_source_extension_is_rejected() {
    trace_init();
    let registry = CodecRegistry::builtin();
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("scan.ora");
    fs::write(&source, b"whatever").unwrap();

    let pipeline = ConversionPipeline::new(&registry, "pkg", "tiff", filter()).unwrap();
    let err = pipeline
        .convert_file(&source, &root.path().join("scan.tif"))
        .unwrap_err();
    assert!(matches!(err, maskpack::Error::InvalidFormat(_)));
}

// === Analysis ===

#[test]
fn stats_stream_reports_per_file_results() {
    trace_init();
    let registry = CodecRegistry::builtin();
    let root = tempfile::tempdir().unwrap();
    let good = root.path().join("scan.pkg");
    registry
        .build("pkg", filter())
        .unwrap()
        .save(&sample_image(good.clone()), &good)
        .unwrap();

    let files = vec![good, root.path().join("missing.pkg")];
    let filter = filter();
    let results: Vec<_> = calculate_stats(&registry, &files, &filter).collect();

    assert_eq!(results.len(), 2);
    let stats = results[0].1.as_ref().unwrap();
    assert_eq!(stats.name, "scan");
    let record = stats.to_record();
    assert_eq!(record.keys().next().unwrap(), "Name");
    assert!(record.contains_key("crack_coverage"));
    assert!(results[1].1.is_err());
}
