//! Transport-neutral request and response types
//!
//! A server maps `POST /api/tryon` onto [`TryOnRequest::from_parts`] and
//! answers with a [`TryOnResponse`] or an [`ErrorBody`] whose status comes
//! from [`ErrorKind::http_status`]. `GET /health` answers with a
//! [`HealthBody`].

use crate::{
    config::{JobOptions, TryOnConfig},
    error::{ErrorKind, Result, TryOnError},
    resources::HealthReport,
    types::{GarmentCategory, ProcessingTimings, QualityCaveat, TryOnResult},
};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upload formats accepted for either image field
pub const ACCEPTED_FORMATS: [ImageFormat; 3] =
    [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP];

/// Decode one uploaded image field
///
/// The format is sniffed from the bytes, never taken from a file name or
/// content type.
pub fn decode_upload(field: &str, bytes: &[u8], max_bytes: usize) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(TryOnError::invalid_input(format!("{field} is empty")));
    }
    if bytes.len() > max_bytes {
        return Err(TryOnError::invalid_input(format!(
            "{field} is {} bytes, limit is {max_bytes}",
            bytes.len()
        )));
    }
    let format = image::guess_format(bytes)
        .map_err(|_| TryOnError::invalid_input(format!("{field} is not a recognised image")))?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(TryOnError::invalid_input(format!(
            "{field} has unsupported format {format:?}, expected PNG, JPEG or WebP"
        )));
    }
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| TryOnError::invalid_input(format!("{field} could not be decoded: {e}")))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(TryOnError::invalid_input(format!("{field} has no pixels")));
    }
    Ok(image.to_rgb8())
}

/// A validated try-on submission
#[derive(Debug, Clone)]
pub struct TryOnRequest {
    pub person: RgbImage,
    pub garment: RgbImage,
    pub options: JobOptions,
}

impl TryOnRequest {
    #[must_use]
    pub fn new(person: RgbImage, garment: RgbImage, category: GarmentCategory) -> Self {
        Self {
            person,
            garment,
            options: JobOptions::new(category),
        }
    }

    /// Replace the per-job overrides
    #[must_use]
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn category(&self) -> GarmentCategory {
        self.options.category
    }

    /// Validate the multipart fields of a submission
    ///
    /// Uploads above the default configuration's size limit are rejected.
    pub fn from_parts(person_image: &[u8], clothing_image: &[u8], category: &str) -> Result<Self> {
        Self::from_parts_with_limit(
            person_image,
            clothing_image,
            category,
            TryOnConfig::default().max_upload_bytes,
        )
    }

    /// [`Self::from_parts`] with an explicit per-field byte limit
    pub fn from_parts_with_limit(
        person_image: &[u8],
        clothing_image: &[u8],
        category: &str,
        max_bytes: usize,
    ) -> Result<Self> {
        let category: GarmentCategory = category.parse()?;
        let person = decode_upload("person_image", person_image, max_bytes)?;
        let garment = decode_upload("clothing_image", clothing_image, max_bytes)?;
        Ok(Self::new(person, garment, category))
    }
}

fn json_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(body)
        .map_err(|e| TryOnError::internal(format!("response serialization failed: {e}")))
}

/// Successful response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryOnResponse {
    pub job_id: Uuid,
    pub status: String,
    pub garment_category: GarmentCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_sha256: Option<String>,
    pub caveats: Vec<QualityCaveat>,
    pub timings: ProcessingTimings,
}

impl TryOnResponse {
    /// Stored results are referenced by location, others are inlined as base64 PNG
    pub fn from_result(result: &TryOnResult) -> Result<Self> {
        let (result_url, result_b64, result_sha256) = match &result.stored {
            Some(stored) => (
                Some(stored.location.clone()),
                None,
                Some(stored.sha256.clone()),
            ),
            None => (None, Some(result.to_base64()?), None),
        };
        Ok(Self {
            job_id: result.job_id,
            status: "completed".to_string(),
            garment_category: result.category,
            result_url,
            result_b64,
            result_sha256,
            caveats: result.caveats.clone(),
            timings: result.timings.clone(),
        })
    }

    /// Serialized `application/json` body
    pub fn to_json(&self) -> Result<Vec<u8>> {
        json_body(self)
    }
}

/// Failure response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl ErrorBody {
    #[must_use]
    pub fn from_error(error: &TryOnError, job_id: Option<Uuid>) -> Self {
        Self {
            error_kind: error.kind(),
            message: error.to_string(),
            job_id,
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.error_kind.http_status()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        json_body(self)
    }
}

/// Health response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBody {
    /// `ok` once every model is resident, `loading` before
    pub status: String,
    #[serde(flatten)]
    pub report: HealthReport,
}

impl From<HealthReport> for HealthBody {
    fn from(report: HealthReport) -> Self {
        let status = if report.all_models_loaded {
            "ok"
        } else {
            "loading"
        };
        Self {
            status: status.to_string(),
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoredResult;
    use image::Rgb;
    use std::io::Cursor;

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let image = RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    #[test]
    fn test_from_parts_decodes_png_and_jpeg() {
        let request =
            TryOnRequest::from_parts(&encoded(ImageFormat::Png), &encoded(ImageFormat::Jpeg), "upper")
                .unwrap();
        assert_eq!(request.person.dimensions(), (8, 6));
        assert_eq!(request.garment.dimensions(), (8, 6));
        assert_eq!(request.category(), GarmentCategory::Upper);
    }

    #[test]
    fn test_overall_is_full() {
        let png = encoded(ImageFormat::Png);
        let request = TryOnRequest::from_parts(&png, &png, "overall").unwrap();
        assert_eq!(request.category(), GarmentCategory::Full);
    }

    #[test]
    fn test_rejections_are_invalid_input() {
        let png = encoded(ImageFormat::Png);
        let gif: &[u8] = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";
        let cases: Vec<(&[u8], &[u8], &str)> = vec![
            (&[], &png, "upper"),
            (&png, b"definitely not an image", "upper"),
            (&png, gif, "lower"),
            (&png, &png, "hat"),
        ];
        for (person, clothing, category) in cases {
            let err = TryOnRequest::from_parts(person, clothing, category).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{err}");
        }
    }

    #[test]
    fn test_size_limit() {
        let png = encoded(ImageFormat::Png);
        let err = TryOnRequest::from_parts_with_limit(&png, &png, "upper", 16).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_response_inline_vs_stored() {
        let mut result = TryOnResult {
            job_id: Uuid::new_v4(),
            category: GarmentCategory::Lower,
            image: RgbImage::new(4, 4),
            caveats: vec![QualityCaveat::AffineOnlyWarp],
            timings: ProcessingTimings::default(),
            stored: None,
        };
        let inline = TryOnResponse::from_result(&result).unwrap();
        assert!(inline.result_b64.is_some());
        assert!(inline.result_url.is_none());

        result.stored = Some(StoredResult {
            key: "results/x.png".to_string(),
            location: "https://cdn.example.com/results/x.png".to_string(),
            sha256: "00".to_string(),
            size_bytes: 1,
        });
        let stored = TryOnResponse::from_result(&result).unwrap();
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["garment_category"], "lower");
        assert_eq!(json["caveats"][0], "affine_only_warp");
        assert!(json.get("result_b64").is_none());
    }

    #[test]
    fn test_error_body_status() {
        let body = ErrorBody::from_error(&TryOnError::segmentation_empty("lower"), None);
        assert_eq!(body.http_status(), 422);
        let json: serde_json::Value = serde_json::from_slice(&body.to_json().unwrap()).unwrap();
        assert_eq!(json["error_kind"], "SegmentationEmpty");
        assert!(json.get("job_id").is_none());
    }
}
