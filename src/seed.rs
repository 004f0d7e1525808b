//! Seeds per repeat
//!
//! Configured seeds are reused cyclically across repeats. The sentinel `-1`
//! asks for a fresh random seed, drawn when the repeat starts; the drawn value
//! is what gets logged and persisted.

use rand::Rng;

use crate::config::ConfigError;

/// Configured value that requests a random seed
pub const RANDOM_SEED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSpec {
    Fixed(u64),
    Random,
}

impl SeedSpec {
    /// Validate a configured seed. `index` is its position in the seed list.
    pub fn from_raw(index: usize, raw: i64) -> Result<Self, ConfigError> {
        match raw {
            RANDOM_SEED => Ok(Self::Random),
            v if v < 0 => Err(ConfigError::NegativeSeed { index, value: v }),
            v => Ok(Self::Fixed(v as u64)),
        }
    }

    /// Value as written in a config file
    pub fn raw(self) -> i64 {
        match self {
            Self::Fixed(seed) => seed as i64,
            Self::Random => RANDOM_SEED,
        }
    }

    pub fn is_random(self) -> bool {
        matches!(self, Self::Random)
    }

    /// Concrete seed in `[0, i64::MAX]`
    pub fn draw(self) -> u64 {
        self.draw_with(&mut rand::rng())
    }

    pub fn draw_with<R: Rng + ?Sized>(self, rng: &mut R) -> u64 {
        match self {
            Self::Fixed(seed) => seed,
            Self::Random => rng.random_range(0..=i64::MAX as u64),
        }
    }
}

/// Cyclic seed list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSchedule {
    specs: Vec<SeedSpec>,
}

impl SeedSchedule {
    /// An empty list behaves like `[-1]`.
    pub fn new(specs: Vec<SeedSpec>) -> Self {
        if specs.is_empty() {
            return Self {
                specs: vec![SeedSpec::Random],
            };
        }
        Self { specs }
    }

    pub fn from_raw(raw: &[i64]) -> Result<Self, ConfigError> {
        let specs = raw
            .iter()
            .enumerate()
            .map(|(i, &v)| SeedSpec::from_raw(i, v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(specs))
    }

    pub fn specs(&self) -> &[SeedSpec] {
        &self.specs
    }

    pub fn spec_for(&self, repeat: usize) -> SeedSpec {
        self.specs[repeat % self.specs.len()]
    }

    pub fn draw(&self, repeat: usize) -> u64 {
        self.spec_for(repeat).draw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_and_negative() {
        assert_eq!(SeedSpec::from_raw(0, -1).unwrap(), SeedSpec::Random);
        assert_eq!(SeedSpec::from_raw(0, 42).unwrap(), SeedSpec::Fixed(42));
        assert!(matches!(
            SeedSpec::from_raw(3, -7),
            Err(ConfigError::NegativeSeed { index: 3, value: -7 })
        ));
    }

    #[test]
    fn test_cyclic_reuse() {
        let seeds = SeedSchedule::from_raw(&[1, 2]).unwrap();
        assert_eq!(seeds.spec_for(0), SeedSpec::Fixed(1));
        assert_eq!(seeds.spec_for(1), SeedSpec::Fixed(2));
        assert_eq!(seeds.spec_for(4), SeedSpec::Fixed(1));
    }

    #[test]
    fn test_random_draw_is_concrete() {
        let seed = SeedSpec::Random.draw();
        assert!(seed <= i64::MAX as u64);
    }

    #[test]
    fn test_empty_list_is_random() {
        assert_eq!(SeedSchedule::new(vec![]).specs(), &[SeedSpec::Random]);
    }
}
