//! Tract-backed human parsing
//!
//! Runs an ATR-labelled parsing network (SCHP / `SegFormer` exports) with
//! Tract, a pure Rust ONNX runtime. The network takes a normalized NCHW
//! tensor and produces per-class logits, which are reduced to a label
//! raster at model resolution.

use crate::{
    error::{Result, TryOnError},
    inference::{ModelKind, Segmenter},
    types::SegmentationMap,
    utils::{ImagePreprocessor, NormalizationConfig},
};
use image::RgbImage;
use instant::Instant;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Debug, Clone)]
enum ModelSource {
    File(PathBuf),
    Bytes(Arc<[u8]>),
}

/// Human-parsing segmenter running on Tract
pub struct TractSegmenter {
    source: ModelSource,
    normalization: NormalizationConfig,
    model: OnceLock<TractModel>,
}

impl std::fmt::Debug for TractSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TractSegmenter")
            .field("source", &self.source)
            .field("input_size", &self.normalization.target_size)
            .field("loaded", &self.model.get().is_some())
            .finish()
    }
}

impl TractSegmenter {
    /// Segmenter reading its ONNX graph from `path` on first use
    #[must_use]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            source: ModelSource::File(path.as_ref().to_path_buf()),
            normalization: NormalizationConfig::default(),
            model: OnceLock::new(),
        }
    }

    /// Segmenter over an in-memory ONNX graph
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            source: ModelSource::Bytes(bytes.into()),
            normalization: NormalizationConfig::default(),
            model: OnceLock::new(),
        }
    }

    /// Override the input size and normalization statistics
    #[must_use]
    pub fn with_normalization(mut self, normalization: NormalizationConfig) -> Self {
        self.normalization = normalization;
        self
    }

    fn load(&self) -> Result<TractModel> {
        let start = Instant::now();
        let bytes: Vec<u8> = match &self.source {
            ModelSource::File(path) => std::fs::read(path).map_err(|e| {
                TryOnError::model_failure(
                    ModelKind::Segmentation,
                    format!("cannot read {}: {e}", path.display()),
                )
            })?,
            ModelSource::Bytes(bytes) => bytes.to_vec(),
        };

        let size = self.normalization.target_size as usize;
        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .map_err(|e| failure(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .map_err(|e| failure(format!("Failed to fix input shape: {e}")))?
            .into_optimized()
            .map_err(|e| failure(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| failure(format!("Failed to create runnable model: {e}")))?;

        log::info!(
            "Tract segmenter loaded in {}ms (input {}x{})",
            start.elapsed().as_millis(),
            size,
            size
        );
        Ok(model)
    }

    fn model(&self) -> Result<&TractModel> {
        if let Some(model) = self.model.get() {
            return Ok(model);
        }
        let loaded = self.load()?;
        // A concurrent loader may have won; either copy is equivalent
        let _ = self.model.set(loaded);
        self.model
            .get()
            .ok_or_else(|| failure("segmentation model vanished after load"))
    }
}

fn failure<S: Into<String>>(message: S) -> TryOnError {
    TryOnError::model_failure(ModelKind::Segmentation, message)
}

/// Per-pixel argmax over `[1, C, H, W]` logits
pub fn argmax_labels(logits: &ndarray::ArrayViewD<'_, f32>) -> Result<SegmentationMap> {
    let shape = logits.shape();
    if shape.len() != 4 || shape[0] != 1 {
        return Err(failure(format!("expected [1, C, H, W] logits, got {shape:?}")));
    }
    let (classes, height, width) = (shape[1], shape[2], shape[3]);
    if classes == 0 || classes > usize::from(u8::MAX) + 1 {
        return Err(failure(format!("unsupported class count {classes}")));
    }

    let mut labels = Vec::with_capacity(height * width);
    for y in 0..height {
        for x in 0..width {
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..classes {
                let score = logits[[0, c, y, x]];
                if score > best_score {
                    best_score = score;
                    best = c;
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            labels.push(best as u8);
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    SegmentationMap::new(width as u32, height as u32, labels)
}

impl Segmenter for TractSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<SegmentationMap> {
        let model = self.model()?;
        let input = ImagePreprocessor::to_tensor(image, &self.normalization)?;

        let start = Instant::now();
        let outputs = model
            .run(tvec![Tensor::from(input).into()])
            .map_err(|e| failure(format!("Tract inference failed: {e}")))?;
        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| failure("No output tensor found"))?
            .into_arc_tensor();
        let logits = output
            .to_array_view::<f32>()
            .map_err(|e| failure(format!("Failed to convert output tensor: {e}")))?;

        let map = argmax_labels(&logits)?;
        log::debug!(
            "Tract segmentation completed in {}ms ({:?})",
            start.elapsed().as_millis(),
            map.dimensions()
        );
        Ok(map)
    }

    fn warm_up(&self) -> Result<()> {
        self.model().map(|_| ())
    }
}

#[cfg(all(test, feature = "tract"))]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_argmax_picks_highest_logit() {
        let mut logits = Array4::<f32>::zeros((1, 3, 2, 2));
        logits[[0, 2, 0, 0]] = 5.0;
        logits[[0, 1, 1, 1]] = 3.0;
        logits[[0, 0, 0, 1]] = 1.0;
        let map = argmax_labels(&logits.into_dyn().view()).unwrap();
        assert_eq!(map.dimensions(), (2, 2));
        assert_eq!(map.get(0, 0), 2);
        assert_eq!(map.get(1, 1), 1);
        assert_eq!(map.get(1, 0), 0);
    }

    #[test]
    fn test_argmax_rejects_wrong_rank() {
        let logits = ndarray::Array3::<f32>::zeros((3, 2, 2));
        let err = argmax_labels(&logits.into_dyn().view()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelFailure);
    }

    #[test]
    fn test_missing_model_file_is_model_failure() {
        let segmenter = TractSegmenter::from_file("/nonexistent/parsing.onnx");
        let err = segmenter.warm_up().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelFailure);
        assert!(!format!("{segmenter:?}").is_empty());
    }

    #[test]
    fn test_garbage_bytes_fail_to_load() {
        let segmenter = TractSegmenter::from_bytes(b"not an onnx graph".to_vec());
        let err = segmenter.segment(&RgbImage::new(8, 8)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelFailure);
    }
}
