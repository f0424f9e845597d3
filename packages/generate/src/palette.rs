//! Linear `YlOrRd` colour scale for choropleth fills.

use bdgd_map_generate_models::ValueRange;

/// ColorBrewer `YlOrRd` with nine classes, light to dark.
const YL_OR_RD_9: [[u8; 3]; 9] = [
    [0xff, 0xff, 0xcc],
    [0xff, 0xed, 0xa0],
    [0xfe, 0xd9, 0x76],
    [0xfe, 0xb2, 0x4c],
    [0xfd, 0x8d, 0x3c],
    [0xfc, 0x4e, 0x2a],
    [0xe3, 0x1a, 0x1c],
    [0xbd, 0x00, 0x26],
    [0x80, 0x00, 0x26],
];

/// Fill for cells with no positive value.
pub const EMPTY_FILL: &str = "#D3D3D3";

/// Fill colour for a value.
///
/// Non-positive values, and every value when there is no range, get
/// [`EMPTY_FILL`]. Values outside the range are clamped to its ends.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn fill_color(value: f64, range: Option<ValueRange>) -> String {
    let Some(range) = range else {
        return EMPTY_FILL.to_string();
    };
    if !value.is_finite() || value <= 0.0 {
        return EMPTY_FILL.to_string();
    }

    let span = range.max - range.min;
    let t = if span > 0.0 {
        ((value - range.min) / span).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let steps = (YL_OR_RD_9.len() - 1) as f64;
    let position = t * steps;
    let lower = (position.floor() as usize).min(YL_OR_RD_9.len() - 2);
    let frac = position - lower as f64;

    let a = YL_OR_RD_9[lower];
    let b = YL_OR_RD_9[lower + 1];
    let channel = |i: usize| {
        let v = (f64::from(b[i]) - f64::from(a[i])).mul_add(frac, f64::from(a[i]));
        v.round().clamp(0.0, 255.0) as u8
    };

    format!("#{:02x}{:02x}{:02x}", channel(0), channel(1), channel(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: ValueRange = ValueRange {
        min: 0.0,
        max: 80.0,
    };

    #[test]
    fn ends_of_range_use_end_colours() {
        assert_eq!(fill_color(80.0, Some(RANGE)), "#800026");
        assert_eq!(
            fill_color(1e-9, Some(ValueRange { min: 1e-9, max: 1.0 })),
            "#ffffcc"
        );
    }

    #[test]
    fn class_boundaries_hit_palette_entries() {
        assert_eq!(fill_color(10.0, Some(RANGE)), "#ffeda0");
        assert_eq!(fill_color(40.0, Some(RANGE)), "#fd8d3c");
    }

    #[test]
    fn values_between_classes_are_interpolated() {
        assert_eq!(fill_color(5.0, Some(RANGE)), "#fff6b6");
    }

    #[test]
    fn non_positive_and_missing_range_are_grey() {
        assert_eq!(fill_color(0.0, Some(RANGE)), EMPTY_FILL);
        assert_eq!(fill_color(-3.0, Some(RANGE)), EMPTY_FILL);
        assert_eq!(fill_color(12.0, None), EMPTY_FILL);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_eq!(fill_color(500.0, Some(RANGE)), "#800026");
        assert_eq!(
            fill_color(1.0, Some(ValueRange { min: 45.0, max: 50.0 })),
            "#ffffcc"
        );
    }
}
