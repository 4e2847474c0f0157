//! Per-layer and per-image mask statistics

use indexmap::IndexMap;
use serde::Serialize;

use crate::model::MultiLayerImage;

/// Coverage figures for one mask layer.
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub name: String,
    pub class_id: u8,
    /// Number of set pixels in the mask.
    pub pixel_count: u64,
    /// Set pixels as a percentage of the canvas area.
    pub coverage: f64,
}

/// Statistics record for a whole image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageStats {
    /// Image title (the "Name" column of exported records).
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub layers: Vec<LayerStats>,
    /// Percentage of canvas pixels covered by the union of all masks.
    pub overall_coverage: f64,
    /// Names of layers with non-zero coverage.
    pub active_defects: Vec<String>,
}

impl ImageStats {
    /// Flatten into an ordered string record, one column per figure. The
    /// record starts with a "Name" column so rows from many images line up
    /// in tabular exports.
    pub fn to_record(&self) -> IndexMap<String, String> {
        let mut record = IndexMap::new();
        record.insert("Name".to_string(), self.name.clone());
        record.insert(
            "Dimension".to_string(),
            format!("{}x{}", self.width, self.height),
        );
        for layer in &self.layers {
            record.insert(format!("{}_pixels", layer.name), layer.pixel_count.to_string());
            record.insert(
                format!("{}_coverage", layer.name),
                format!("{:.4}", layer.coverage),
            );
        }
        record.insert(
            "overall_coverage".to_string(),
            format!("{:.4}", self.overall_coverage),
        );
        record.insert("active_defects".to_string(), self.active_defects.join(";"));
        record
    }

    /// Column names of [`Self::to_record`], in record order.
    pub fn field_names(&self) -> Vec<String> {
        self.to_record().into_keys().collect()
    }
}

impl MultiLayerImage {
    /// Compute per-layer pixel counts and coverage plus the image-level
    /// union coverage. Coverage divides by the canvas area floored to 1.
    pub fn get_stats(&self) -> ImageStats {
        let dim = self.dimension();
        let total = dim.area_clamped() as f64;

        let layers: Vec<LayerStats> = self
            .layers
            .iter()
            .map(|layer| {
                let pixel_count = layer.pixel_count();
                LayerStats {
                    name: layer.name().to_string(),
                    class_id: layer.class_id,
                    pixel_count,
                    coverage: pixel_count as f64 / total * 100.0,
                }
            })
            .collect();

        let fused = self.fused_classmap();
        let union_pixels = fused.pixels().filter(|p| p.0[0] != 0).count() as u64;

        let active_defects = layers
            .iter()
            .filter(|l| l.pixel_count > 0)
            .map(|l| l.name.clone())
            .collect();

        ImageStats {
            name: self.title().to_string(),
            width: dim.width,
            height: dim.height,
            layers,
            overall_coverage: union_pixels as f64 / total * 100.0,
            active_defects,
        }
    }
}
