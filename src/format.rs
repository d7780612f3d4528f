use std::fmt;

/// wl_shm pixel encodings. Everything except ARGB8888 and XRGB8888 uses its DRM fourcc code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Bgrx8888,
    Rgb888,
    Bgr888,
    Argb2101010,
    Xrgb2101010,
    Abgr2101010,
    Xbgr2101010,
    /// A format we know nothing about, by wl_shm code.
    Unknown(u32),
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

const WL_SHM_ARGB8888: u32 = 0;
const WL_SHM_XRGB8888: u32 = 1;

const KNOWN_FORMATS: [(PixelFormat, u32); 14] = [
    (PixelFormat::Argb8888, WL_SHM_ARGB8888),
    (PixelFormat::Xrgb8888, WL_SHM_XRGB8888),
    (PixelFormat::Abgr8888, fourcc(b"AB24")),
    (PixelFormat::Xbgr8888, fourcc(b"XB24")),
    (PixelFormat::Rgba8888, fourcc(b"RA24")),
    (PixelFormat::Rgbx8888, fourcc(b"RX24")),
    (PixelFormat::Bgra8888, fourcc(b"BA24")),
    (PixelFormat::Bgrx8888, fourcc(b"BX24")),
    (PixelFormat::Rgb888, fourcc(b"RG24")),
    (PixelFormat::Bgr888, fourcc(b"BG24")),
    (PixelFormat::Argb2101010, fourcc(b"AR30")),
    (PixelFormat::Xrgb2101010, fourcc(b"XR30")),
    (PixelFormat::Abgr2101010, fourcc(b"AB30")),
    (PixelFormat::Xbgr2101010, fourcc(b"XB30")),
];

impl PixelFormat {
    pub fn from_wl_shm(code: u32) -> Self {
        KNOWN_FORMATS
            .iter()
            .find(|(_, known)| *known == code)
            .map(|(format, _)| *format)
            .unwrap_or(PixelFormat::Unknown(code))
    }

    pub fn to_wl_shm(self) -> u32 {
        match self {
            PixelFormat::Unknown(code) => code,
            format => KNOWN_FORMATS
                .iter()
                .find(|(known, _)| *known == format)
                .map(|(_, code)| *code)
                .unwrap_or_default(),
        }
    }

    /// Bytes per pixel, `None` for unknown formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => Some(3),
            PixelFormat::Unknown(_) => None,
            _ => Some(4),
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelFormat::Argb8888
                | PixelFormat::Abgr8888
                | PixelFormat::Rgba8888
                | PixelFormat::Bgra8888
                | PixelFormat::Argb2101010
                | PixelFormat::Abgr2101010
        )
    }

    /// wl_shm buffers carrying alpha are premultiplied.
    pub fn is_premultiplied(self) -> bool {
        self.has_alpha()
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, PixelFormat::Unknown(_))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Unknown(code) => write!(f, "unknown format {:#010x}", code),
            format => write!(f, "{:?}", format),
        }
    }
}

/// An 8 bit per channel pixel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Argb8 {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Argb8 {
    pub const TRANSPARENT: Argb8 = Argb8 {
        a: 0,
        r: 0,
        g: 0,
        b: 0,
    };

    pub fn new(a: u8, r: u8, g: u8, b: u8) -> Self {
        Self { a, r, g, b }
    }

    pub fn from_u32(value: u32) -> Self {
        let [a, r, g, b] = value.to_be_bytes();
        Self { a, r, g, b }
    }

    /// Pack as `0xAARRGGBB`, the canonical canvas encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes([self.a, self.r, self.g, self.b])
    }

    pub fn unpremultiply(self) -> Self {
        match self.a {
            0 => Argb8::TRANSPARENT,
            255 => self,
            a => {
                let a32 = a as u32;
                let channel = |c: u8| ((c as u32 * 255 + a32 / 2) / a32).min(255) as u8;
                Argb8 {
                    a,
                    r: channel(self.r),
                    g: channel(self.g),
                    b: channel(self.b),
                }
            }
        }
    }
}

pub trait Convert {
    /// Unpack one pixel from its raw bytes, channels stay as stored (possibly premultiplied).
    fn unpack(&self, pixel: &[u8]) -> Argb8;
}

/// 8 bit channels at fixed byte offsets.
struct ConvertPacked8 {
    a: Option<usize>,
    r: usize,
    g: usize,
    b: usize,
}

/// 10 bit colour channels with a 2 bit alpha in the top bits.
struct Convert2101010 {
    red_high: bool,
    alpha: bool,
}

/// Expand a 10 bit channel to 8 bits with rounding.
fn convert10_to_8(color: u32) -> u8 {
    (((color & 0x3ff) * 255 + 511) / 1023) as u8
}

/// Creates a converter for `format`, `None` when the format can not be converted.
pub fn create_converter(format: PixelFormat) -> Option<Box<dyn Convert>> {
    let packed = |a, r, g, b| -> Option<Box<dyn Convert>> {
        Some(Box::new(ConvertPacked8 { a, r, g, b }))
    };
    let wide = |red_high, alpha| -> Option<Box<dyn Convert>> {
        Some(Box::new(Convert2101010 { red_high, alpha }))
    };

    // Little endian packing: the lowest named channel sits in byte 0.
    match format {
        PixelFormat::Argb8888 => packed(Some(3), 2, 1, 0),
        PixelFormat::Xrgb8888 => packed(None, 2, 1, 0),
        PixelFormat::Abgr8888 => packed(Some(3), 0, 1, 2),
        PixelFormat::Xbgr8888 => packed(None, 0, 1, 2),
        PixelFormat::Rgba8888 => packed(Some(0), 3, 2, 1),
        PixelFormat::Rgbx8888 => packed(None, 3, 2, 1),
        PixelFormat::Bgra8888 => packed(Some(0), 1, 2, 3),
        PixelFormat::Bgrx8888 => packed(None, 1, 2, 3),
        PixelFormat::Rgb888 => packed(None, 2, 1, 0),
        PixelFormat::Bgr888 => packed(None, 0, 1, 2),
        PixelFormat::Argb2101010 => wide(true, true),
        PixelFormat::Xrgb2101010 => wide(true, false),
        PixelFormat::Abgr2101010 => wide(false, true),
        PixelFormat::Xbgr2101010 => wide(false, false),
        PixelFormat::Unknown(_) => None,
    }
}

impl Convert for ConvertPacked8 {
    fn unpack(&self, pixel: &[u8]) -> Argb8 {
        Argb8 {
            a: self.a.map(|a| pixel[a]).unwrap_or(255),
            r: pixel[self.r],
            g: pixel[self.g],
            b: pixel[self.b],
        }
    }
}

impl Convert for Convert2101010 {
    fn unpack(&self, pixel: &[u8]) -> Argb8 {
        let value = u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]]);
        let (high, low) = (convert10_to_8(value >> 20), convert10_to_8(value));
        let (r, b) = if self.red_high {
            (high, low)
        } else {
            (low, high)
        };
        Argb8 {
            a: if self.alpha {
                ((value >> 30) * 85) as u8
            } else {
                255
            },
            r,
            g: convert10_to_8(value >> 10),
            b,
        }
    }
}
