#[macro_use]
extern crate bitflags;

mod output;
mod platform;

use std::fs::File;
use std::io::{self, BufRead, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{debug, info, LevelFilter};
use scrcomp::{layout, render, CaptureMode, GeoBox};
use simple_logger::SimpleLogger;

use crate::output::{
    default_filename, get_screenshot_directory, write_to_file, EncodingFormat, EncodingOptions,
};
use crate::platform::create_platform;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
/// Take a screenshot of a region spanning any number of Wayland outputs
struct CmdArgs {
    /// Pixels per logical unit of the image. Defaults to the greatest scale of the captured outputs
    #[arg(short, long, value_parser = parse_scale)]
    scale: Option<f64>,
    /// Region to capture as WxH+X+Y in layout coordinates. Use - to read it from stdin
    #[arg(short, long)]
    geometry: Option<String>,
    /// Format to use for encoding screenshot
    #[arg(short = 't', long = "type", value_enum, default_value_t = EncodingFormat::Png)]
    encoding_format: EncodingFormat,
    /// JPEG quality, 0-100
    #[arg(short = 'q', long, value_parser = clap::value_parser!(u8).range(0..=100))]
    jpeg_quality: Option<u8>,
    /// PNG compression level, 0-9
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u8).range(0..=9))]
    png_level: Option<u8>,
    /// Name of the output to screenshot. E.g. DP-1, eDP-1
    #[arg(short, long)]
    output: Option<String>,
    /// Include the cursor
    #[arg(short, long)]
    cursor: bool,
    /// Hex address of a window to screenshot instead of outputs
    #[arg(short, long, value_parser = parse_window_address, conflicts_with_all = ["geometry", "output"])]
    window: Option<u64>,
    /// File to write the screenshot to, - for stdout
    output_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Setup logger
    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .env()
        .init()
        .map_err(|err| anyhow!("Could not set up logging: {}", err))?;

    // Parse command line args
    let args = CmdArgs::parse();
    let options = encoding_options(&args)?;

    let mode = if let Some(address) = args.window {
        CaptureMode::Window { address }
    } else {
        let geometry = match args.geometry.as_deref() {
            Some(text) => Some(read_geometry(text, io::stdin().lock())?),
            None => None,
        };
        CaptureMode::ScreenOutput {
            output: args.output.clone(),
            geometry,
        }
    };
    debug!("Capture mode: {:?}", mode);

    // Take the screenshot
    let mut platform = create_platform(mode)?;
    let region = platform.session().requested_region()?;
    let captured = platform.capture(region, args.cursor)?;
    info!("Captured {} records", captured);

    let records = platform.session().records();
    let region = region.unwrap_or_else(|| layout::layout_extents(records));
    let scale = args
        .scale
        .unwrap_or_else(|| layout::greatest_logical_scale(records, Some(region)));
    debug!("Render {} at scale {}", region, scale);
    let canvas = render(records, region, scale)?;

    // Write screenshot
    match args.output_file {
        Some(path) if path == Path::new("-") => {
            debug!("Write screenshot to stdout");
            write_to_file(io::stdout().lock(), options, &canvas)?;
        }
        Some(path) => save(&path, options, &canvas)?,
        None => {
            let directory = get_screenshot_directory();
            save(
                &directory.join(default_filename(options.format)),
                options,
                &canvas,
            )?;
        }
    }

    Ok(())
}

fn save(path: &Path, options: EncodingOptions, canvas: &scrcomp::Canvas) -> Result<()> {
    debug!("Write screenshot to {}", path.display());
    let file = File::create(path)
        .with_context(|| format!("Could not create {}", path.display()))?;
    write_to_file(BufWriter::new(file), options, canvas)
}

fn parse_scale(value: &str) -> Result<f64, String> {
    let scale = value
        .parse::<f64>()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(format!("scale has to be greater than 0, got {}", value));
    }
    Ok(scale)
}

fn parse_window_address(value: &str) -> Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16)
        .map_err(|_| format!("expected hex window address, got '{}'", value))
}

/// Parse a geometry argument, reading one line from `stdin` for `-`.
fn read_geometry(text: &str, mut stdin: impl BufRead) -> Result<GeoBox> {
    let text = if text == "-" {
        let mut line = String::new();
        stdin
            .read_line(&mut line)
            .context("Could not read geometry from stdin")?;
        line
    } else {
        text.to_owned()
    };
    let text = text.trim();
    text.parse::<GeoBox>()
        .with_context(|| format!("Invalid geometry '{}'", text))
}

fn encoding_options(args: &CmdArgs) -> Result<EncodingOptions> {
    let format = args.encoding_format;
    if args.jpeg_quality.is_some() && format != EncodingFormat::Jpeg {
        bail!("JPEG quality can only be set for jpeg images");
    }
    if args.png_level.is_some() && format != EncodingFormat::Png {
        bail!("PNG compression level can only be set for png images");
    }

    let defaults = EncodingOptions::default();
    Ok(EncodingOptions {
        format,
        jpeg_quality: args.jpeg_quality.unwrap_or(defaults.jpeg_quality),
        png_level: args.png_level.unwrap_or(defaults.png_level),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(args: &[&str]) -> Result<CmdArgs, clap::Error> {
        CmdArgs::try_parse_from(std::iter::once("scrcomp").chain(args.iter().copied()))
    }

    #[test]
    fn scale_has_to_be_positive() {
        assert_eq!(parse_scale("1.5"), Ok(1.5));
        assert!(parse_scale("0").is_err());
        assert!(parse_scale("-2").is_err());
        assert!(parse_scale("inf").is_err());
        assert!(parse_scale("two").is_err());
    }

    #[test]
    fn geometry_from_argument_or_stdin() {
        let empty = Cursor::new(Vec::new());
        assert_eq!(
            read_geometry("100x50+10+-5", empty).unwrap(),
            GeoBox::new(10, -5, 100, 50)
        );

        let stdin = Cursor::new(b"640x480+0+0\n".to_vec());
        assert_eq!(
            read_geometry("-", stdin).unwrap(),
            GeoBox::new(0, 0, 640, 480)
        );

        let stdin = Cursor::new(b"garbage\n".to_vec());
        assert!(read_geometry("-", stdin).is_err());
    }

    #[test]
    fn window_address_is_hex() {
        assert_eq!(parse_window_address("55d0c8a1e2f0"), Ok(0x55d0_c8a1_e2f0));
        assert_eq!(parse_window_address("0x1f"), Ok(0x1f));
        assert!(parse_window_address("window").is_err());
        assert!(parse_window_address("").is_err());

        let args = parse(&["-w", "0xabc"]).unwrap();
        assert_eq!(args.window, Some(0xabc));
        assert!(parse(&["-w", "xyz"]).is_err());
    }

    #[test]
    fn window_conflicts_with_region() {
        assert!(parse(&["-w", "abc", "-g", "10x10+0+0"]).is_err());
        assert!(parse(&["-w", "abc", "-o", "DP-1"]).is_err());
    }

    #[test]
    fn encoder_flags_match_the_format() {
        let args = parse(&["-t", "jpeg", "-q", "95"]).unwrap();
        let options = encoding_options(&args).unwrap();
        assert_eq!(options.format, EncodingFormat::Jpeg);
        assert_eq!(options.jpeg_quality, 95);

        let args = parse(&["-l", "9", "shot.png"]).unwrap();
        let options = encoding_options(&args).unwrap();
        assert_eq!((options.format, options.png_level), (EncodingFormat::Png, 9));
        assert_eq!(args.output_file, Some(PathBuf::from("shot.png")));

        assert!(encoding_options(&parse(&["-q", "50"]).unwrap()).is_err());
        assert!(encoding_options(&parse(&["-t", "ppm", "-l", "1"]).unwrap()).is_err());
        assert!(parse(&["-q", "101"]).is_err());
        assert!(parse(&["-l", "10"]).is_err());
    }

    #[test]
    fn jpg_is_an_alias() {
        let args = parse(&["-t", "jpg"]).unwrap();
        assert_eq!(args.encoding_format, EncodingFormat::Jpeg);
    }
}
