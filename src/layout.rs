use log::{debug, warn};
use thiserror::Error;

use crate::geometry::{extents, GeoBox};
use crate::record::OutputCaptureRecord;

/// Relative difference between the horizontal and vertical scale we put up with.
const SCALE_DRIFT_TOLERANCE: f64 = 0.01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("output {output} reported a logical size of {width}x{height}")]
    DegenerateLogicalSize {
        output: String,
        width: u32,
        height: u32,
    },
    #[error("unknown output '{0}'")]
    UnknownOutput(String),
}

/// Assume a 1:1 mapping between logical and physical pixels. Used when the compositor does not
/// tell us the logical layout.
pub fn guess_logical_geometry(record: &mut OutputCaptureRecord) {
    record.logical_geometry = record.physical_geometry;
    record.logical_scale = 1.0;
}

/// Derive the logical scale from the logical size the compositor sent.
pub fn resolve_logical_scale(record: &mut OutputCaptureRecord) -> Result<(), LayoutError> {
    let logical = record.logical_geometry;
    if logical.is_empty() {
        return Err(LayoutError::DegenerateLogicalSize {
            output: record.to_string(),
            width: logical.width,
            height: logical.height,
        });
    }

    let (width, height) = record.transform.apply_to_dimensions(
        record.physical_geometry.width,
        record.physical_geometry.height,
    );
    let scale_x = width as f64 / logical.width as f64;
    let scale_y = height as f64 / logical.height as f64;
    if (scale_x - scale_y).abs() > scale_x * SCALE_DRIFT_TOLERANCE {
        warn!(
            "Output {} has a horizontal scale of {} but a vertical scale of {}",
            record, scale_x, scale_y
        );
    }

    debug!("Output {} has a logical scale of {}", record, scale_x);
    record.logical_scale = scale_x;
    Ok(())
}

/// Bounding box of every ready output. This is what gets captured without a region.
pub fn layout_extents(records: &[OutputCaptureRecord]) -> GeoBox {
    extents(
        records
            .iter()
            .filter(|record| record.is_ready())
            .map(|record| &record.logical_geometry),
    )
}

/// Logical geometry of the output called `name`.
pub fn find_output(records: &[OutputCaptureRecord], name: &str) -> Result<GeoBox, LayoutError> {
    records
        .iter()
        .find(|record| record.name.as_deref() == Some(name))
        .map(|record| record.logical_geometry)
        .ok_or_else(|| LayoutError::UnknownOutput(name.into()))
}

/// Records whose logical geometry overlaps `region`, every record without one.
pub fn intersecting<'a>(
    records: &'a [OutputCaptureRecord],
    region: Option<GeoBox>,
) -> impl Iterator<Item = (usize, &'a OutputCaptureRecord)> + 'a {
    records.iter().enumerate().filter(move |(_, record)| {
        region
            .map(|region| region.intersects(&record.logical_geometry))
            .unwrap_or(true)
    })
}

/// The largest logical scale among the outputs touched by `region`, but at least 1. Capturing at
/// this scale loses no detail on any of them.
pub fn greatest_logical_scale(records: &[OutputCaptureRecord], region: Option<GeoBox>) -> f64 {
    intersecting(records, region)
        .map(|(_, record)| record.logical_scale)
        .fold(1.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Transform;

    fn record(physical: GeoBox, logical: GeoBox, transform: Transform) -> OutputCaptureRecord {
        let mut record = OutputCaptureRecord::new();
        record.physical_geometry = physical;
        record.logical_geometry = logical;
        record.transform = transform;
        record
    }

    #[test]
    fn hidpi_output_has_scale_two() {
        let mut r = record(
            GeoBox::new(0, 0, 3840, 2160),
            GeoBox::new(0, 0, 1920, 1080),
            Transform::Normal,
        );
        resolve_logical_scale(&mut r).unwrap();
        assert_eq!(r.logical_scale, 2.0);
    }

    #[test]
    fn rotated_output_compares_matching_axes() {
        let mut r = record(
            GeoBox::new(0, 0, 2560, 1440),
            GeoBox::new(0, 0, 960, 1706),
            Transform::Rot90,
        );
        resolve_logical_scale(&mut r).unwrap();
        assert_eq!(r.logical_scale, 1.5);
    }

    #[test]
    fn empty_logical_size_is_rejected() {
        let mut r = record(GeoBox::new(0, 0, 100, 100), GeoBox::default(), Transform::Normal);
        assert!(matches!(
            resolve_logical_scale(&mut r),
            Err(LayoutError::DegenerateLogicalSize { .. })
        ));
    }

    #[test]
    fn guess_copies_physical_geometry() {
        let mut r = record(GeoBox::new(1920, 0, 1280, 1024), GeoBox::default(), Transform::Normal);
        r.logical_scale = 3.0;
        guess_logical_geometry(&mut r);
        assert_eq!(r.logical_geometry, GeoBox::new(1920, 0, 1280, 1024));
        assert_eq!(r.logical_scale, 1.0);
    }

    #[test]
    fn finds_outputs_by_name() {
        let mut r = record(GeoBox::default(), GeoBox::new(10, 20, 30, 40), Transform::Normal);
        r.name = Some("HDMI-A-1".into());
        let records = [r];
        assert_eq!(find_output(&records, "HDMI-A-1"), Ok(GeoBox::new(10, 20, 30, 40)));
        assert_eq!(
            find_output(&records, "DP-9"),
            Err(LayoutError::UnknownOutput("DP-9".into()))
        );
    }

    #[test]
    fn greatest_scale_only_counts_touched_outputs() {
        let mut low = record(GeoBox::default(), GeoBox::new(0, 0, 100, 100), Transform::Normal);
        low.logical_scale = 1.0;
        let mut high = record(GeoBox::default(), GeoBox::new(100, 0, 100, 100), Transform::Normal);
        high.logical_scale = 2.0;
        let records = [low, high];

        assert_eq!(greatest_logical_scale(&records, None), 2.0);
        assert_eq!(
            greatest_logical_scale(&records, Some(GeoBox::new(0, 0, 50, 50))),
            1.0
        );
        assert_eq!(greatest_logical_scale(&[], None), 1.0);
    }

    #[test]
    fn extents_skip_outputs_that_were_not_captured() {
        let records = [record(
            GeoBox::default(),
            GeoBox::new(0, 0, 100, 100),
            Transform::Normal,
        )];
        assert_eq!(layout_extents(&records), GeoBox::default());
    }
}
