//! Thin image I/O adapter (component G).
//!
//! Per the system's scope, decoding is treated as "load grayscale
//! pixel matrix + optional container metadata": PNG/JPEG/BMP/TIFF go
//! through the `image` crate's 8-bit luminance conversion; DICOM goes
//! through a minimal Explicit-VR-Little-Endian pixel-data locator that
//! preserves the rest of the dataset byte-for-byte so the writer can
//! splice a recovered pixel buffer back in without re-encoding the
//! whole object.
//!
//! This module does not attempt a general DICOM object model — no
//! transfer-syntax negotiation, no signed pixel representation, no
//! compressed transfer syntaxes. Those are genuinely out of scope for
//! a watermarking codec that only ever rewrites pixel *values*, never
//! the dataset structure around them.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// In-memory grayscale pixel matrix, row-major, one `u16` per sample
/// regardless of the underlying bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMatrix {
    pub data: Vec<u16>,
    pub height: usize,
    pub width: usize,
    pub bit_depth: u8,
}

impl ImageMatrix {
    pub fn new(data: Vec<u16>, height: usize, width: usize, bit_depth: u8) -> Self {
        debug_assert_eq!(data.len(), height * width);
        Self { data, height, width, bit_depth }
    }

    #[inline]
    pub fn get(&self, y: usize, x: usize) -> u16 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, y: usize, x: usize, value: u16) {
        self.data[y * self.width + x] = value;
    }

    /// Maximum representable value `M = 2^bit_depth - 1`.
    #[inline]
    pub fn max_value(&self) -> u32 {
        (1u32 << self.bit_depth) - 1
    }
}

/// Opaque container metadata the writer needs to preserve alongside a
/// recovered or watermarked pixel buffer.
#[derive(Debug, Clone)]
pub enum Container {
    /// PNG/JPEG/BMP/TIFF: no metadata beyond the pixel buffer itself.
    Plain,
    /// DICOM: the full original file bytes, plus the byte range that
    /// holds the pixel data element's value field.
    Dicom(DicomContainer),
}

#[derive(Debug, Clone)]
pub struct DicomContainer {
    pub raw: Vec<u8>,
    pub pixel_data_offset: usize,
    pub pixel_data_len: usize,
    pub bits_allocated: u8,
}

/// Result of loading an image: its pixel matrix plus whatever
/// container metadata the writer will need.
pub struct LoadedImage {
    pub matrix: ImageMatrix,
    pub container: Container,
}

/// File extensions this crate knows how to load/save (`spec.md` §1).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "dcm"];

/// Loads a grayscale pixel matrix (plus container metadata) from
/// `path`, dispatching on `data_type` (`"png"`, `"dcm"`, ...).
pub fn load_grayscale(path: &Path, data_type: &str) -> Result<LoadedImage> {
    if !path.exists() {
        return Err(Error::InputMissing(path.display().to_string()));
    }
    if !SUPPORTED_EXTENSIONS.contains(&data_type) {
        return Err(Error::UnsupportedFormat(data_type.to_string()));
    }

    if data_type == "dcm" {
        load_dicom(path)
    } else {
        load_raster(path)
    }
}

/// Saves `matrix` back to `path`, substituting the pixel buffer into
/// `container` while preserving any other container state.
pub fn save_grayscale(path: &Path, matrix: &ImageMatrix, container: &Container) -> Result<()> {
    match container {
        Container::Plain => save_raster(path, matrix),
        Container::Dicom(dicom) => save_dicom(path, matrix, dicom),
    }
}

fn load_raster(path: &Path) -> Result<LoadedImage> {
    let img = image::open(path)
        .map_err(|e| Error::ImageDecodeFailed(format!("{}: {e}", path.display())))?;
    let luma = img.into_luma8();
    let (width, height) = (luma.width() as usize, luma.height() as usize);
    let data = luma.into_raw().into_iter().map(|b| b as u16).collect();

    Ok(LoadedImage {
        matrix: ImageMatrix::new(data, height, width, 8),
        container: Container::Plain,
    })
}

fn save_raster(path: &Path, matrix: &ImageMatrix) -> Result<()> {
    let bytes: Vec<u8> = matrix.data.iter().map(|&v| v as u8).collect();
    let buffer = image::GrayImage::from_raw(matrix.width as u32, matrix.height as u32, bytes)
        .ok_or_else(|| Error::Other("pixel buffer does not match declared dimensions".into()))?;
    buffer
        .save(path)
        .map_err(|e| Error::Other(format!("failed to save {}: {e}", path.display())))
}

/// Minimal Explicit-VR-Little-Endian DICOM element walk, looking for
/// Rows (0028,0010), Columns (0028,0011), BitsAllocated (0028,0100)
/// and PixelData (7FE0,0010). Stops as soon as PixelData is located.
fn load_dicom(path: &Path) -> Result<LoadedImage> {
    let raw = fs::read(path)
        .map_err(|e| Error::ImageDecodeFailed(format!("{}: {e}", path.display())))?;

    let mut cursor = if raw.len() > 132 && &raw[128..132] == b"DICM" {
        132
    } else {
        0
    };

    let mut rows: Option<u16> = None;
    let mut columns: Option<u16> = None;
    let mut bits_allocated: Option<u16> = None;
    let mut pixel_data_offset = None;
    let mut pixel_data_len = 0usize;

    while cursor + 8 <= raw.len() {
        let group = u16::from_le_bytes([raw[cursor], raw[cursor + 1]]);
        let element = u16::from_le_bytes([raw[cursor + 2], raw[cursor + 3]]);
        let vr = &raw[cursor + 4..cursor + 6];
        let vr_str = std::str::from_utf8(vr).unwrap_or("??");

        let (value_offset, value_len) = if matches!(
            vr_str,
            "OB" | "OW" | "OF" | "SQ" | "UT" | "UN"
        ) {
            if cursor + 12 > raw.len() {
                break;
            }
            let len = u32::from_le_bytes([
                raw[cursor + 8],
                raw[cursor + 9],
                raw[cursor + 10],
                raw[cursor + 11],
            ]) as usize;
            (cursor + 12, len)
        } else {
            if cursor + 8 > raw.len() {
                break;
            }
            let len = u16::from_le_bytes([raw[cursor + 6], raw[cursor + 7]]) as usize;
            (cursor + 8, len)
        };

        if value_offset + value_len > raw.len() {
            break;
        }

        match (group, element) {
            (0x0028, 0x0010) => {
                rows = Some(u16::from_le_bytes([raw[value_offset], raw[value_offset + 1]]));
            }
            (0x0028, 0x0011) => {
                columns = Some(u16::from_le_bytes([raw[value_offset], raw[value_offset + 1]]));
            }
            (0x0028, 0x0100) => {
                bits_allocated =
                    Some(u16::from_le_bytes([raw[value_offset], raw[value_offset + 1]]));
            }
            (0x7FE0, 0x0010) => {
                pixel_data_offset = Some(value_offset);
                pixel_data_len = value_len;
                break;
            }
            _ => {}
        }

        cursor = value_offset + value_len;
    }

    let rows = rows.ok_or_else(|| Error::ImageDecodeFailed("missing Rows".into()))? as usize;
    let columns =
        columns.ok_or_else(|| Error::ImageDecodeFailed("missing Columns".into()))? as usize;
    let bits_allocated = bits_allocated.unwrap_or(16) as u8;
    let pixel_data_offset =
        pixel_data_offset.ok_or_else(|| Error::ImageDecodeFailed("missing PixelData".into()))?;

    let bytes_per_sample = (bits_allocated as usize).div_ceil(8).max(1);
    let sample_count = rows * columns;
    if pixel_data_len < sample_count * bytes_per_sample {
        return Err(Error::ImageDecodeFailed("pixel data shorter than Rows*Columns".into()));
    }

    let mut data = Vec::with_capacity(sample_count);
    for i in 0..sample_count {
        let off = pixel_data_offset + i * bytes_per_sample;
        let sample = if bytes_per_sample == 1 {
            raw[off] as u16
        } else {
            u16::from_le_bytes([raw[off], raw[off + 1]])
        };
        data.push(sample);
    }

    Ok(LoadedImage {
        matrix: ImageMatrix::new(data, rows, columns, bits_allocated),
        container: Container::Dicom(DicomContainer {
            raw,
            pixel_data_offset,
            pixel_data_len,
            bits_allocated,
        }),
    })
}

fn save_dicom(path: &Path, matrix: &ImageMatrix, dicom: &DicomContainer) -> Result<()> {
    let bytes_per_sample = (dicom.bits_allocated as usize).div_ceil(8).max(1);
    let mut out = dicom.raw.clone();

    for (i, &sample) in matrix.data.iter().enumerate() {
        let off = dicom.pixel_data_offset + i * bytes_per_sample;
        if bytes_per_sample == 1 {
            out[off] = sample as u8;
        } else {
            let le = sample.to_le_bytes();
            out[off] = le[0];
            out[off + 1] = le[1];
        }
    }

    fs::write(path, out)
        .map_err(|e| Error::Other(format!("failed to save {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_value_matches_bit_depth() {
        let m = ImageMatrix::new(vec![0; 4], 2, 2, 8);
        assert_eq!(m.max_value(), 255);
        let m12 = ImageMatrix::new(vec![0; 4], 2, 2, 12);
        assert_eq!(m12.max_value(), 4095);
    }

    #[test]
    fn get_set_roundtrip() {
        let mut m = ImageMatrix::new(vec![0; 6], 2, 3, 8);
        m.set(1, 2, 200);
        assert_eq!(m.get(1, 2), 200);
    }
}
