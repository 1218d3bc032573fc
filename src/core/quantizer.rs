//! 8-bit gain/offset encoding of floating point fields.
//!
//! Defined values are spread over codes 1..=255, code 0 is left for undetect.

use ndarray::{Array2, ArrayView2, Zip};

/// Gain of validity rasters
pub const VALIDITY_GAIN: f64 = 1.0 / 255.0;

/// Validity code of a defined cell (decodes to 1.0)
pub const VALID_CODE: u8 = 255;

/// Validity code of an undefined cell
pub const INVALID_CODE: u8 = 0;

/// An encoded field with its scaling and validity raster
#[derive(Debug, Clone)]
pub struct QuantizedField {
    pub data: Array2<u8>,
    pub gain: f64,
    pub offset: f64,
    pub validity: Array2<u8>,
}

/// Gain and offset covering the defined values of a field
pub fn scaling(field: ArrayView2<f64>) -> (f64, f64) {
    let (min, max) = field
        .iter()
        .filter(|v| !v.is_nan())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    if min > max {
        return (1.0, 0.0);
    }

    let mut gain = (max - min) / 254.0;
    if gain == 0.0 {
        gain = 1.0;
    }
    let offset = (254.0 * min - max) / 253.0;
    (gain, offset)
}

/// Encode one defined value
pub fn encode(value: f64, gain: f64, offset: f64) -> u8 {
    ((value - offset + 0.5 * gain) / gain).floor().clamp(0.0, 255.0) as u8
}

/// Encode a field; undefined cells get `nodata`
pub fn quantize(field: ArrayView2<f64>, nodata: u8) -> QuantizedField {
    let (gain, offset) = scaling(field);

    let data = field.map(|&v| if v.is_nan() { nodata } else { encode(v, gain, offset) });
    let validity = field.map(|v| if v.is_nan() { INVALID_CODE } else { VALID_CODE });

    QuantizedField {
        data,
        gain,
        offset,
        validity,
    }
}

/// Decode a raster; codes listed in `undefined` become NaN
pub fn decode(raw: ArrayView2<u8>, gain: f64, offset: f64, undefined: &[u8]) -> Array2<f64> {
    let mut values = Array2::from_elem(raw.dim(), f64::NAN);
    Zip::from(&mut values).and(&raw).for_each(|v, &code| {
        if !undefined.contains(&code) {
            *v = gain * code as f64 + offset;
        }
    });
    values
}

/// Raw code of a no-data/undetect attribute value, if it fits in 8 bits
pub fn sentinel_code(value: f64) -> Option<u8> {
    if value.is_finite() && value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}
