use anyhow::{bail, Result};

pub const DENSITY_MIN: f64 = 0.1;
pub const DENSITY_MAX: f64 = 0.9;

/// Approximate fraction of detected crystals the model is asked to recolor.
///
/// Valid range is [0.1, 0.9], matching the shell's slider. The value maps to
/// a coarse two-word descriptor used in prompt text; the split sits at 0.5.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Density(f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DensityBucket {
    Sparse,
    Dense,
}

impl DensityBucket {
    pub fn descriptor(self) -> &'static str {
        match self {
            DensityBucket::Sparse => "some",
            DensityBucket::Dense => "many",
        }
    }
}

impl Density {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || !(DENSITY_MIN..=DENSITY_MAX).contains(&value) {
            bail!("density must be between {DENSITY_MIN} and {DENSITY_MAX}, got {value}");
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn bucket(self) -> DensityBucket {
        if self.0 >= 0.5 {
            DensityBucket::Dense
        } else {
            DensityBucket::Sparse
        }
    }

    /// Whole-number coverage used in prompt text, e.g. 0.35 -> 35.
    pub fn coverage_percent(self) -> u32 {
        (self.0 * 100.0).floor() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_values_outside_slider_range() {
        assert!(Density::new(0.0).is_err());
        assert!(Density::new(0.95).is_err());
        assert!(Density::new(f64::NAN).is_err());
        assert!(Density::new(0.1).is_ok());
        assert!(Density::new(0.9).is_ok());
    }

    #[test]
    fn bucket_splits_at_half() -> Result<()> {
        assert_eq!(Density::new(0.3)?.bucket().descriptor(), "some");
        assert_eq!(Density::new(0.49)?.bucket().descriptor(), "some");
        assert_eq!(Density::new(0.5)?.bucket().descriptor(), "many");
        assert_eq!(Density::new(0.9)?.bucket().descriptor(), "many");
        Ok(())
    }

    #[test]
    fn coverage_percent_is_whole_number() -> Result<()> {
        assert_eq!(Density::new(0.5)?.coverage_percent(), 50);
        assert_eq!(Density::new(0.75)?.coverage_percent(), 75);
        assert_eq!(Density::new(0.125)?.coverage_percent(), 12);
        Ok(())
    }
}
