//! Vegetation analysis over a decoded frame.
//!
//! Pure functions: nothing here touches the filesystem. Brightness is
//! Rec.601 luma (0.299 R + 0.587 G + 0.114 B). Vegetation classification
//! runs in HSV on the OpenCV scale (hue 0-180, saturation/value 0-255):
//! a pixel counts as vegetation when hue is in the green band [35, 85] and
//! both saturation and value are at least 40, which rejects near-black and
//! near-gray pixels.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Green band bounds on the 0-180 hue scale.
const GREEN_HUE_MIN: u8 = 35;
const GREEN_HUE_MAX: u8 = 85;
/// Minimum saturation and value for a pixel to count as vegetation.
const MIN_SATURATION: u8 = 40;
const MIN_VALUE: u8 = 40;

/// Coverage fraction above which a frame counts as containing a plant.
/// Fixed by design; detection at exactly 5% is negative.
const DETECTION_THRESHOLD: f64 = 0.05;

/// Overlay blend weight toward pure green for classified pixels.
const OVERLAY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicStats {
    pub mean_brightness: f64,
    pub std_brightness: f64,
    pub min_brightness: u8,
    pub max_brightness: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColorAnalysis {
    /// Mean value per channel, RGB order.
    pub mean_rgb: [f64; 3],
    /// Each channel's share of the total channel mass, in percent.
    /// All zero for an all-black image.
    pub green_ratio: f64,
    pub red_ratio: f64,
    pub blue_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlantDetection {
    pub green_pixel_count: u64,
    pub total_pixel_count: u64,
    pub green_coverage_percent: f64,
    pub plant_detected: bool,
}

/// The `analysis` block of a persisted analysis record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAnalysis {
    pub basic_stats: BasicStats,
    pub color_analysis: ColorAnalysis,
    pub plant_detection: PlantDetection,
}

/// Analyze one frame: brightness stats, channel ratios, vegetation coverage.
pub fn analyze(img: &RgbImage) -> Result<ImageAnalysis, AnalysisError> {
    let total_pixels = u64::from(img.width()) * u64::from(img.height());
    if total_pixels == 0 {
        return Err(AnalysisError::EmptyImage);
    }

    let mut luma_sum = 0.0f64;
    let mut luma_sq_sum = 0.0f64;
    let mut luma_min = u8::MAX;
    let mut luma_max = u8::MIN;

    let mut channel_sum = [0.0f64; 3];
    let mut green_pixels = 0u64;

    for pixel in img.pixels() {
        let y = luma(pixel);
        luma_sum += y;
        luma_sq_sum += y * y;

        let y8 = y.round().clamp(0.0, 255.0) as u8;
        luma_min = luma_min.min(y8);
        luma_max = luma_max.max(y8);

        channel_sum[0] += f64::from(pixel[0]);
        channel_sum[1] += f64::from(pixel[1]);
        channel_sum[2] += f64::from(pixel[2]);

        if is_vegetation(pixel) {
            green_pixels += 1;
        }
    }

    let n = total_pixels as f64;
    let mean = luma_sum / n;
    let variance = (luma_sq_sum / n - mean * mean).max(0.0);

    let mean_rgb = [
        channel_sum[0] / n,
        channel_sum[1] / n,
        channel_sum[2] / n,
    ];
    let total_mass = mean_rgb[0] + mean_rgb[1] + mean_rgb[2];
    let ratio = |channel: f64| {
        if total_mass > 0.0 {
            channel / total_mass * 100.0
        } else {
            0.0
        }
    };

    let coverage_fraction = green_pixels as f64 / n;

    Ok(ImageAnalysis {
        basic_stats: BasicStats {
            mean_brightness: mean,
            std_brightness: variance.sqrt(),
            min_brightness: luma_min,
            max_brightness: luma_max,
        },
        color_analysis: ColorAnalysis {
            mean_rgb,
            green_ratio: ratio(mean_rgb[1]),
            red_ratio: ratio(mean_rgb[0]),
            blue_ratio: ratio(mean_rgb[2]),
        },
        plant_detection: PlantDetection {
            green_pixel_count: green_pixels,
            total_pixel_count: total_pixels,
            green_coverage_percent: coverage_fraction * 100.0,
            plant_detected: coverage_fraction > DETECTION_THRESHOLD,
        },
    })
}

/// Render the overlay raster: vegetation pixels blended 30% toward pure
/// green, everything else untouched. Never a substitute for the raw image.
pub fn overlay(img: &RgbImage) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        if is_vegetation(pixel) {
            let keep = 1.0 - OVERLAY_ALPHA;
            let blend = |orig: u8, highlight: f64| {
                (f64::from(orig) * keep + highlight * OVERLAY_ALPHA)
                    .round()
                    .clamp(0.0, 255.0) as u8
            };
            *pixel = Rgb([blend(pixel[0], 0.0), blend(pixel[1], 255.0), blend(pixel[2], 0.0)]);
        }
    }
    out
}

fn luma(pixel: &Rgb<u8>) -> f64 {
    0.299 * f64::from(pixel[0]) + 0.587 * f64::from(pixel[1]) + 0.114 * f64::from(pixel[2])
}

fn is_vegetation(pixel: &Rgb<u8>) -> bool {
    let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
    (GREEN_HUE_MIN..=GREEN_HUE_MAX).contains(&h) && s >= MIN_SATURATION && v >= MIN_VALUE
}

/// RGB to HSV on the OpenCV 8-bit scale: hue 0-180, saturation and
/// value 0-255.
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let rf = f64::from(r);
    let gf = f64::from(g);
    let bf = f64::from(b);

    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let value = max;
    let saturation = if max > 0.0 { delta / max * 255.0 } else { 0.0 };

    let hue_deg = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (((gf - bf) / delta).rem_euclid(6.0))
    } else if max == gf {
        60.0 * ((bf - rf) / delta + 2.0)
    } else {
        60.0 * ((rf - gf) / delta + 4.0)
    };

    (
        (hue_deg / 2.0).round().clamp(0.0, 180.0) as u8,
        saturation.round().clamp(0.0, 255.0) as u8,
        value.round().clamp(0.0, 255.0) as u8,
    )
}
