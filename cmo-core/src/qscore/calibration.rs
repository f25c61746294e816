use serde::{Deserialize, Serialize};

use crate::DecisionError;

/// One calibration bin: raw scores in `[min, max]` map onto `calibrated`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    /// Inclusive lower edge.
    pub min: f64,
    /// Inclusive upper edge.
    pub max: f64,
    /// Calibrated score for raw values inside the bin.
    pub calibrated: f64,
}

/// A sorted, non-overlapping calibration lookup.
///
/// Raw values outside every bin fall back to the raw score. The table is
/// static at runtime; updates are an operator action that replaces it whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    bins: Vec<CalibrationBin>,
}

impl CalibrationTable {
    /// An empty table; every raw score passes through unchanged.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Validate and build a table. Bins must be sorted ascending by `min`,
    /// internally consistent, non-overlapping, and hold values in `[0, 1]`.
    pub fn new(bins: Vec<CalibrationBin>) -> Result<Self, DecisionError> {
        for (i, bin) in bins.iter().enumerate() {
            let in_range = |v: f64| (0.0..=1.0).contains(&v);
            if !in_range(bin.min) || !in_range(bin.max) || !in_range(bin.calibrated) {
                return Err(DecisionError::InvalidCalibration(format!(
                    "bin {i} has values outside [0, 1]"
                )));
            }
            if bin.min > bin.max {
                return Err(DecisionError::InvalidCalibration(format!(
                    "bin {i} has min > max"
                )));
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &bins[p]) {
                if bin.min <= prev.max {
                    return Err(DecisionError::InvalidCalibration(format!(
                        "bin {i} overlaps bin {}", i - 1
                    )));
                }
            }
        }
        Ok(Self { bins })
    }

    /// Map a raw score through the table; `None` when no bin covers it.
    pub fn lookup(&self, raw: f64) -> Option<f64> {
        self.bins
            .iter()
            .find(|bin| raw >= bin.min && raw <= bin.max)
            .map(|bin| bin.calibrated)
    }

    /// Calibrated score with the raw fallback applied.
    pub fn calibrate(&self, raw: f64) -> f64 {
        self.lookup(raw).unwrap_or(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibrationTable {
        CalibrationTable::new(vec![
            CalibrationBin { min: 0.0, max: 0.4, calibrated: 0.2 },
            CalibrationBin { min: 0.5, max: 0.7, calibrated: 0.65 },
            CalibrationBin { min: 0.8, max: 1.0, calibrated: 0.9 },
        ])
        .unwrap()
    }

    #[test]
    fn lookup_hits_the_covering_bin() {
        let t = table();
        assert_eq!(t.calibrate(0.3), 0.2);
        assert_eq!(t.calibrate(0.6), 0.65);
        assert_eq!(t.calibrate(1.0), 0.9);
    }

    #[test]
    fn gaps_fall_back_to_raw() {
        let t = table();
        assert_eq!(t.calibrate(0.45), 0.45);
        assert_eq!(CalibrationTable::identity().calibrate(0.77), 0.77);
    }

    #[test]
    fn overlapping_bins_rejected() {
        let err = CalibrationTable::new(vec![
            CalibrationBin { min: 0.0, max: 0.5, calibrated: 0.2 },
            CalibrationBin { min: 0.5, max: 1.0, calibrated: 0.8 },
        ])
        .unwrap_err();
        assert_eq!(err.code(), "invalid_calibration");
    }

    #[test]
    fn out_of_range_bins_rejected() {
        assert!(CalibrationTable::new(vec![CalibrationBin {
            min: -0.1,
            max: 0.5,
            calibrated: 0.2
        }])
        .is_err());
    }
}
