use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A rectangle in pixel space. A box with zero area denotes "no region".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeoBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected geometry in the form WIDTHxHEIGHT+X+Y, got {0:?}")]
    Malformed(String),
    #[error("invalid {field} {value:?} in geometry")]
    InvalidNumber { field: &'static str, value: String },
}

impl GeoBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlap of two boxes, `None` unless it has a non-zero area.
    pub fn intersection(&self, other: &GeoBox) -> Option<GeoBox> {
        let x1 = (self.x as i64).max(other.x as i64);
        let y1 = (self.y as i64).max(other.y as i64);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(GeoBox {
            x: x1 as i32,
            y: y1 as i32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }

    pub fn intersects(&self, other: &GeoBox) -> bool {
        self.intersection(other).is_some()
    }

    pub fn contains(&self, other: &GeoBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Minimal box covering every input box. Yields the all-zero box for an empty input.
pub fn extents<'a>(boxes: impl IntoIterator<Item = &'a GeoBox>) -> GeoBox {
    let mut iter = boxes.into_iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return GeoBox::default(),
    };

    let (mut x1, mut y1) = (first.x as i64, first.y as i64);
    let (mut x2, mut y2) = (first.right(), first.bottom());
    for b in iter {
        x1 = x1.min(b.x as i64);
        y1 = y1.min(b.y as i64);
        x2 = x2.max(b.right());
        y2 = y2.max(b.bottom());
    }

    GeoBox {
        x: x1 as i32,
        y: y1 as i32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    }
}

fn parse_dimension(field: &'static str, value: &str) -> Result<u32, ParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidNumber {
            field,
            value: value.into(),
        });
    }
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.into(),
    })
}

fn parse_offset(field: &'static str, value: &str) -> Result<i32, ParseError> {
    let digits = value.strip_prefix('-').unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidNumber {
            field,
            value: value.into(),
        });
    }
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.into(),
    })
}

impl FromStr for GeoBox {
    type Err = ParseError;

    /// Parse `WIDTHxHEIGHT+X+Y`. The offsets are optional and default to 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, rest) = s
            .split_once('x')
            .ok_or_else(|| ParseError::Malformed(s.into()))?;

        let mut parts = rest.split('+');
        let height = parts.next().unwrap_or_default();
        let (x, y) = match (parts.next(), parts.next(), parts.next()) {
            (None, None, None) => (0, 0),
            (Some(x), Some(y), None) => (parse_offset("x", x)?, parse_offset("y", y)?),
            _ => return Err(ParseError::Malformed(s.into())),
        };

        Ok(GeoBox {
            x,
            y,
            width: parse_dimension("width", width)?,
            height: parse_dimension("height", height)?,
        })
    }
}

impl fmt::Display for GeoBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}
