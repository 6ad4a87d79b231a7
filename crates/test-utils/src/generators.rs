//! Synthetic band generators.
//!
//! These create predictable patterns whose index values can be worked out
//! by hand, so tests can assert exact output codes.

/// A band holding one value everywhere.
pub fn constant_band(width: usize, height: usize, value: f32) -> Vec<f32> {
    vec![value; width * height]
}

/// Replace the value at every `(col, row)` with `value`.
pub fn punch_holes(data: &mut [f32], width: usize, holes: &[(usize, usize)], value: f32) {
    for &(col, row) in holes {
        data[row * width + col] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punch_holes() {
        let mut band = constant_band(4, 4, 1.0);
        punch_holes(&mut band, 4, &[(1, 2)], -9999.0);
        assert_eq!(band[9], -9999.0);
        assert_eq!(band.iter().filter(|&&v| v == 1.0).count(), 15);
    }
}
