//! Format codec
//!
//! Converts native clipboard buffers into `DataModel`s and back. Text and file
//! lists stay inline; Bitmap, Rtf, Html and Png payloads are written to
//! timestamp-named files under `<root>/<FormatFolder>/`.
//!
//! Conversion failures are logged and reported as `None`: callers treat a
//! missing result as "format unavailable".

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use image::{ImageFormat, RgbaImage};
use thiserror::Error;
use tracing::{debug, warn};

use crate::interface::ClipboardFormat;
use crate::models::{Clip, DataModel};
use crate::native::{FormatRecord, OutgoingFormat};

/// Separator between paths of a Files payload
pub const FILES_SEPARATOR: char = '|';

const BITMAP_INFO_HEADER_LEN: usize = 40;
const BI_RGB: u32 = 0;
const BI_BITFIELDS: u32 = 3;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid bitmap: {0}")]
    InvalidBitmap(&'static str),
    #[error("Empty payload")]
    Empty,
}

// ─────────────────────────────────────────────────────────────────────────────
// TEXT
// ─────────────────────────────────────────────────────────────────────────────

/// Decode UTF-16LE bytes, dropping trailing NULs.
pub fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let end = units.iter().rposition(|u| *u != 0).map_or(0, |i| i + 1);
    String::from_utf16_lossy(&units[..end])
}

/// UTF-16LE with a NUL terminator, as clipboard text is stored natively
pub fn encode_utf16(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// BITMAP
// ─────────────────────────────────────────────────────────────────────────────

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    read_u32(bytes, at) as i32
}

/// Decode a packed DIB (`BITMAPINFOHEADER` followed by 24 or 32 bpp pixels).
pub fn dib_to_image(dib: &[u8]) -> Result<RgbaImage, CodecError> {
    if dib.len() < BITMAP_INFO_HEADER_LEN {
        return Err(CodecError::InvalidBitmap("header truncated"));
    }
    let header_len = read_u32(dib, 0) as usize;
    let width = read_i32(dib, 4);
    let height = read_i32(dib, 8);
    let bit_count = read_u16(dib, 14);
    let compression = read_u32(dib, 16);

    if header_len < BITMAP_INFO_HEADER_LEN || width <= 0 || height == 0 {
        return Err(CodecError::InvalidBitmap("bad dimensions"));
    }
    if bit_count != 24 && bit_count != 32 {
        return Err(CodecError::InvalidBitmap("unsupported bit depth"));
    }
    let masks_len = match compression {
        BI_RGB => 0,
        BI_BITFIELDS if header_len == BITMAP_INFO_HEADER_LEN => 12,
        BI_BITFIELDS => 0,
        _ => return Err(CodecError::InvalidBitmap("compressed bitmap")),
    };

    let width = width as u32;
    let rows = height.unsigned_abs();
    let bottom_up = height > 0;
    let bytes_per_pixel = (bit_count / 8) as usize;
    let stride = ((width as usize * bit_count as usize + 31) / 32) * 4;
    let pixels_at = header_len + masks_len;
    let needed = stride
        .checked_mul(rows as usize)
        .and_then(|n| n.checked_add(pixels_at))
        .ok_or(CodecError::InvalidBitmap("size overflow"))?;
    if dib.len() < needed {
        return Err(CodecError::InvalidBitmap("pixel data truncated"));
    }

    let mut image = RgbaImage::new(width, rows);
    let mut any_alpha = false;
    for y in 0..rows {
        let src_row = (if bottom_up { rows - 1 - y } else { y }) as usize;
        let row = &dib[pixels_at + src_row * stride..];
        for x in 0..width {
            let px = &row[x as usize * bytes_per_pixel..];
            let alpha = if bytes_per_pixel == 4 { px[3] } else { 255 };
            any_alpha |= alpha != 0;
            image.put_pixel(x, y, image::Rgba([px[2], px[1], px[0], alpha]));
        }
    }
    // 32 bpp DIBs from most producers leave the fourth byte zeroed.
    if bytes_per_pixel == 4 && !any_alpha {
        image.pixels_mut().for_each(|p| p.0[3] = 255);
    }
    Ok(image)
}

/// Encode a bottom-up 32 bpp packed DIB
pub fn image_to_dib(image: &RgbaImage) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let pixel_bytes = width as usize * height as usize * 4;
    let mut dib = Vec::with_capacity(BITMAP_INFO_HEADER_LEN + pixel_bytes);
    dib.extend_from_slice(&(BITMAP_INFO_HEADER_LEN as u32).to_le_bytes());
    dib.extend_from_slice(&(width as i32).to_le_bytes());
    dib.extend_from_slice(&(height as i32).to_le_bytes());
    dib.extend_from_slice(&1u16.to_le_bytes());
    dib.extend_from_slice(&32u16.to_le_bytes());
    dib.extend_from_slice(&BI_RGB.to_le_bytes());
    dib.extend_from_slice(&(pixel_bytes as u32).to_le_bytes());
    dib.extend_from_slice(&[0u8; 16]);
    for y in (0..height).rev() {
        for x in 0..width {
            let [r, g, b, a] = image.get_pixel(x, y).0;
            dib.extend_from_slice(&[b, g, r, a]);
        }
    }
    dib
}

// ─────────────────────────────────────────────────────────────────────────────
// CODEC
// ─────────────────────────────────────────────────────────────────────────────

/// Payload files written for one capture. Removed on drop unless kept.
#[derive(Debug, Default)]
pub struct PayloadGuard {
    paths: Vec<PathBuf>,
}

impl PayloadGuard {
    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// The capture was stored; the files now belong to its data models.
    pub fn keep(mut self) {
        self.paths.clear();
    }
}

impl Drop for PayloadGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "could not remove aborted payload");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormatCodec {
    root: PathBuf,
}

impl FormatCodec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_path(&self, format: ClipboardFormat) -> Option<PathBuf> {
        format.folder().map(|folder| self.root.join(folder))
    }

    /// Absolute payload path for a file name read from the store
    pub fn full_path(&self, format: ClipboardFormat, file_name: &str) -> String {
        match self.folder_path(format) {
            Some(folder) => folder.join(file_name).to_string_lossy().into_owned(),
            None => file_name.to_string(),
        }
    }

    /// Value persisted for `data`: file-backed formats keep only the file name.
    pub fn stored_value(data: &DataModel) -> String {
        if !data.format.is_file_backed() {
            return data.data.clone();
        }
        Path::new(&data.data)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| data.data.clone())
    }

    fn unique_path(&self, format: ClipboardFormat, time: NaiveDateTime) -> Result<PathBuf, CodecError> {
        let (Some(folder), Some(ext)) = (self.folder_path(format), format.extension()) else {
            return Err(CodecError::Empty);
        };
        fs::create_dir_all(&folder)?;
        let stem = time.format("%Y%m%d_%H%M%S%3f").to_string();
        let mut path = folder.join(format!("{stem}.{ext}"));
        let mut n = 1;
        while path.exists() {
            path = folder.join(format!("{stem}_{n}.{ext}"));
            n += 1;
        }
        Ok(path)
    }

    fn write_payload(
        &self,
        record: &FormatRecord,
        time: NaiveDateTime,
    ) -> Result<PathBuf, CodecError> {
        if record.bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        let path = self.unique_path(record.format, time)?;
        match record.format {
            ClipboardFormat::Bitmap => {
                let image = dib_to_image(&record.bytes)?;
                image.save_with_format(&path, ImageFormat::Bmp)?;
            }
            _ => fs::write(&path, &record.bytes)?,
        }
        Ok(path)
    }

    /// Convert one captured format. Files written are registered with `guard`.
    pub fn to_data_model(
        &self,
        record: &FormatRecord,
        time: NaiveDateTime,
        guard: &mut PayloadGuard,
    ) -> Option<DataModel> {
        if record.hash.is_empty() {
            debug!(format = ?record.format, "capture record without hash");
            return None;
        }
        let data = match record.format {
            ClipboardFormat::Text | ClipboardFormat::Files => decode_utf16(&record.bytes),
            _ => match self.write_payload(record, time) {
                Ok(path) => {
                    guard.track(path.clone());
                    path.to_string_lossy().into_owned()
                }
                Err(e) => {
                    warn!(format = ?record.format, error = %e, "payload conversion failed");
                    return None;
                }
            },
        };
        Some(DataModel::new(record.format, data, record.hash.clone()))
    }

    /// Buffer to hand back to the native clipboard
    pub fn to_outgoing(&self, data: &DataModel) -> Option<OutgoingFormat> {
        let bytes = match data.format {
            ClipboardFormat::Text | ClipboardFormat::Files => Ok(encode_utf16(&data.data)),
            ClipboardFormat::Bitmap => image::open(&data.data)
                .map(|img| image_to_dib(&img.to_rgba8()))
                .map_err(CodecError::from),
            _ => fs::read(&data.data).map_err(CodecError::from),
        };
        match bytes {
            Ok(bytes) => Some(OutgoingFormat { format: data.format, bytes }),
            Err(e) => {
                warn!(format = ?data.format, error = %e, "cannot read payload for clipboard");
                None
            }
        }
    }

    pub fn clear_external_files(&self, clip: &Clip) {
        for path in clip.payload_files() {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path, error = %e, "could not delete payload file");
                }
            }
        }
    }

    /// Remove every payload folder tree under the root
    pub fn clear_all_external_data(&self) {
        for format in ClipboardFormat::ALL {
            let Some(folder) = self.folder_path(format) else {
                continue;
            };
            if folder.exists() {
                if let Err(e) = fs::remove_dir_all(&folder) {
                    warn!(folder = %folder.display(), error = %e, "could not delete payload folder");
                }
            }
        }
    }

    /// Write a single format to a user-chosen file
    pub fn save_data_to_file(&self, data: &DataModel, dest: &Path) -> Result<(), CodecError> {
        if data.format.is_file_backed() {
            fs::copy(&data.data, dest)?;
        } else {
            fs::write(dest, data.data.as_bytes())?;
        }
        Ok(())
    }
}
