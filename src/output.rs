use anyhow::{bail, Result};
use chrono::{Local, NaiveDateTime};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::pnm::{self, PnmEncoder};
use image::{ColorType, ImageEncoder};
use log::debug;
use scrcomp::Canvas;
use std::env;
use std::io::Write;
use std::path::PathBuf;

/// Environment variable overriding the directory screenshots are saved to.
pub const DEFAULT_DIR_ENV: &str = "SCRCOMP_DEFAULT_DIR";

/// Supported image encoding formats.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum EncodingFormat {
    /// Jpeg / Jpg encoder.
    #[value(alias = "jpg")]
    Jpeg,
    /// Png encoder.
    Png,
    /// Ppm encoder
    Ppm,
}

impl EncodingFormat {
    pub fn extension(self) -> &'static str {
        match self {
            EncodingFormat::Png => "png",
            EncodingFormat::Jpeg => "jpeg",
            EncodingFormat::Ppm => "ppm",
        }
    }
}

/// Encoder settings picked on the command line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EncodingOptions {
    pub format: EncodingFormat,
    /// JPEG quality, 0-100.
    pub jpeg_quality: u8,
    /// PNG compression level, 0-9.
    pub png_level: u8,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            format: EncodingFormat::Png,
            jpeg_quality: 80,
            png_level: 6,
        }
    }
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Write the canvas to anything that implements Write trait. Eg: Stdout or a file on the disk.
pub fn write_to_file(
    mut output_file: impl Write,
    options: EncodingOptions,
    canvas: &Canvas,
) -> Result<()> {
    debug!("Writing image with encoding options: {:?}", options);
    let (width, height) = (canvas.width(), canvas.height());
    if width == 0 || height == 0 {
        bail!("Can not encode an empty {}x{} image", width, height);
    }

    match options.format {
        EncodingFormat::Jpeg => {
            JpegEncoder::new_with_quality(&mut output_file, options.jpeg_quality.max(1)).write_image(
                &canvas.to_rgb8(),
                width,
                height,
                ColorType::Rgb8,
            )?;
        }
        EncodingFormat::Png => {
            PngEncoder::new_with_quality(
                &mut output_file,
                png_compression(options.png_level),
                FilterType::Adaptive,
            )
            .write_image(&canvas.to_rgba8(), width, height, ColorType::Rgba8)?;
        }
        EncodingFormat::Ppm => {
            PnmEncoder::new(&mut output_file)
                .with_subtype(pnm::PnmSubtype::Pixmap(pnm::SampleEncoding::Binary))
                .write_image(&canvas.to_rgb8(), width, height, ColorType::Rgb8)?;
        }
    }
    output_file.flush()?;

    Ok(())
}

/// Where screenshots go without an explicit path: the override directory if it exists, then
/// XDG_PICTURES_DIR, then the current directory.
pub fn get_screenshot_directory() -> PathBuf {
    pick_directory(env::var_os(DEFAULT_DIR_ENV).map(PathBuf::from), dirs::picture_dir())
}

fn pick_directory(default_dir: Option<PathBuf>, pictures: Option<PathBuf>) -> PathBuf {
    default_dir
        .filter(|dir| dir.is_dir())
        .or(pictures)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `<local date>_<local time>_scrcomp.<ext>`, e.g. `20240309_07h05m03s_scrcomp.png`.
pub fn default_filename(format: EncodingFormat) -> String {
    filename_at(Local::now().naive_local(), format)
}

fn filename_at(time: NaiveDateTime, format: EncodingFormat) -> String {
    format!(
        "{}_scrcomp.{}",
        time.format("%Y%m%d_%Hh%Mm%Ss"),
        format.extension()
    )
}
