//! Value histogram backing the TF-enhanced scheme.
use rayon::prelude::*;

use super::{Encoding, MIN_RANGE};

pub(crate) const NUM_BINS: usize = 512;

/// Candidate positions tried for each end of the range
const NUM_CANDIDATES: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Histogram {
    min: f32,
    max: f32,
    counts: Vec<f64>,
}

impl Histogram {
    pub fn new(values: &[f32]) -> Option<Self> {
        let (min, max) = min_max(values)?;
        let mut histogram = Self {
            min,
            max: max.max(min + MIN_RANGE),
            counts: vec![0.0; NUM_BINS],
        };
        histogram.add(values);
        Some(histogram)
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    fn bin_width(&self) -> f32 {
        (self.max - self.min) / NUM_BINS as f32
    }

    fn bin_of(&self, value: f32) -> usize {
        (((value - self.min) / self.bin_width()).floor().max(0.0) as usize).min(NUM_BINS - 1)
    }

    fn centers(&self) -> impl Iterator<Item = (f32, f64)> + '_ {
        let width = self.bin_width();
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0.0)
            .map(move |(i, c)| (self.min + (i as f32 + 0.5) * width, *c))
    }

    fn add(&mut self, values: &[f32]) {
        for v in values {
            let bin = self.bin_of(*v);
            self.counts[bin] += 1.0;
        }
    }

    /// Adds values, widening the range first when they fall outside of it
    pub fn update(&mut self, values: &[f32]) {
        let Some((min, max)) = min_max(values) else {
            return;
        };
        if min < self.min || max > self.max {
            let old: Vec<_> = self.centers().collect();
            self.min = self.min.min(min);
            self.max = self.max.max(max);
            self.counts = vec![0.0; NUM_BINS];
            for (center, count) in old {
                let bin = self.bin_of(center);
                self.counts[bin] += count;
            }
        }
        self.add(values);
    }

    /// Expected squared error of quantizing the histogram with `encoding`: uniform noise
    /// inside the grid, distance to the grid end outside of it
    fn noise(&self, encoding: &Encoding) -> f64 {
        let in_range = (encoding.delta as f64).powi(2) / 12.0;
        self.centers()
            .map(|(v, count)| {
                let clipped = v.clamp(encoding.min, encoding.max);
                if clipped == v {
                    count * in_range
                } else {
                    count * ((v - clipped) as f64).powi(2)
                }
            })
            .sum()
    }

    /// The `[min, max]` among shrunk versions of the observed range giving the least noise
    pub fn optimal_range(&self, bitwidth: u8, symmetric: bool) -> (f32, f32) {
        let lo = self.min.min(0.0);
        let hi = self.max.max(0.0);
        let fraction = |i: usize| i as f32 / NUM_CANDIDATES as f32;
        let candidates: Vec<(f32, f32)> = if symmetric {
            let abs_max = lo.abs().max(hi);
            (1..=NUM_CANDIDATES)
                .map(|i| (-abs_max * fraction(i), abs_max * fraction(i)))
                .collect()
        } else {
            (1..=NUM_CANDIDATES)
                .flat_map(|i| {
                    (1..=NUM_CANDIDATES).map(move |j| (lo * fraction(i), hi * fraction(j)))
                })
                .collect()
        };
        candidates
            .into_par_iter()
            .map(|(min, max)| {
                let encoding = Encoding::from_range(min, max, bitwidth, symmetric);
                ((min, max), self.noise(&encoding))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(range, _)| range)
            .unwrap_or((lo, hi))
    }
}

fn min_max(values: &[f32]) -> Option<(f32, f32)> {
    values.iter().fold(None, |acc, v| match acc {
        None => Some((*v, *v)),
        Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
    })
}
