//! Parameter views: how callbacks read and write the live model parameters.
//!
//! [`LocalView`] exposes the whole parameter vector as one shard.
//! [`ShardedView`] partitions it into balanced contiguous shards, the layout a
//! memory-sharded strategy keeps per device; readers pull shard by shard and
//! full copies are gathered from and scattered back to the shards.

use crate::error::MlError;
use crate::model::ParameterSet;
use std::num::NonZeroUsize;
use std::ops::Range;

/// Access to live parameters in flat index space.
pub trait ParameterView {
    fn num_values(&self) -> usize;

    /// Flat ranges of each shard, in order, covering `0..num_values()`.
    fn shards(&self) -> &[Range<usize>];

    /// Copy shard `shard` into `out`.
    ///
    /// # Panics
    /// If `out` is not exactly the shard's length.
    fn pull_shard(&self, shard: usize, out: &mut [f32]);

    /// Overwrite shard `shard` from `src`.
    fn push_shard(&mut self, shard: usize, src: &[f32]);

    /// Full flat copy, assembled from every shard.
    fn gather(&self) -> Vec<f32> {
        let mut flat = vec![0.0; self.num_values()];
        for (i, range) in self.shards().iter().enumerate() {
            self.pull_shard(i, &mut flat[range.clone()]);
        }
        flat
    }

    /// Overwrite every shard from a full flat vector.
    fn scatter(&mut self, flat: &[f32]) -> Result<(), MlError> {
        if flat.len() != self.num_values() {
            return Err(MlError::training(format!(
                "cannot scatter {} values into {} parameters",
                flat.len(),
                self.num_values()
            )));
        }
        let shards = self.shards().to_vec();
        for (i, range) in shards.into_iter().enumerate() {
            self.push_shard(i, &flat[range]);
        }
        Ok(())
    }
}

/// Balanced contiguous partition of `total` values into `n` shards.
///
/// Every shard but the trailing ones holds `ceil(total / n)` values; trailing
/// shards may be short or empty.
pub fn shard_ranges(total: usize, n: NonZeroUsize) -> Vec<Range<usize>> {
    let size = total.div_ceil(n.get());
    (0..n.get())
        .map(|i| {
            let start = (i * size).min(total);
            let end = (start + size).min(total);
            start..end
        })
        .collect()
}

/// All parameters as a single shard.
#[derive(Debug)]
pub struct LocalView<'a> {
    params: &'a mut ParameterSet,
    whole: [Range<usize>; 1],
}

impl<'a> LocalView<'a> {
    pub fn new(params: &'a mut ParameterSet) -> Self {
        let n = params.num_values();
        Self {
            params,
            whole: [0..n],
        }
    }
}

impl ParameterView for LocalView<'_> {
    fn num_values(&self) -> usize {
        self.whole[0].end
    }

    fn shards(&self) -> &[Range<usize>] {
        &self.whole
    }

    fn pull_shard(&self, _shard: usize, out: &mut [f32]) {
        self.params.read_flat(0, out);
    }

    fn push_shard(&mut self, _shard: usize, src: &[f32]) {
        self.params.write_flat(0, src);
    }
}

/// Parameters partitioned into balanced contiguous shards.
#[derive(Debug)]
pub struct ShardedView<'a> {
    params: &'a mut ParameterSet,
    shards: Vec<Range<usize>>,
}

impl<'a> ShardedView<'a> {
    pub fn new(params: &'a mut ParameterSet, num_shards: NonZeroUsize) -> Self {
        let shards = shard_ranges(params.num_values(), num_shards);
        Self { params, shards }
    }
}

impl ParameterView for ShardedView<'_> {
    fn num_values(&self) -> usize {
        self.shards.last().map_or(0, |r| r.end)
    }

    fn shards(&self) -> &[Range<usize>] {
        &self.shards
    }

    fn pull_shard(&self, shard: usize, out: &mut [f32]) {
        let range = &self.shards[shard];
        assert_eq!(out.len(), range.len(), "shard buffer length mismatch");
        self.params.read_flat(range.start, out);
    }

    fn push_shard(&mut self, shard: usize, src: &[f32]) {
        let range = &self.shards[shard];
        assert_eq!(src.len(), range.len(), "shard buffer length mismatch");
        self.params.write_flat(range.start, src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameter;

    fn params() -> ParameterSet {
        ParameterSet::new(vec![
            Parameter::new("a", (0..7).map(|v| v as f32).collect()),
            Parameter::new("b", vec![70.0, 80.0, 90.0]),
        ])
    }

    #[test]
    fn test_ragged_shard_ranges() {
        let ranges = shard_ranges(105, NonZeroUsize::new(10).unwrap());
        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[0], 0..11);
        assert_eq!(ranges[9], 99..105);

        let ranges = shard_ranges(5, NonZeroUsize::new(4).unwrap());
        assert_eq!(ranges, vec![0..2, 2..4, 4..5, 5..5]);
    }

    #[test]
    fn test_sharded_gather_matches_local() {
        let mut a = params();
        let mut b = params();
        let local = LocalView::new(&mut a).gather();
        let sharded = ShardedView::new(&mut b, NonZeroUsize::new(3).unwrap()).gather();
        assert_eq!(local, sharded);
        assert_eq!(local.len(), 10);
    }

    #[test]
    fn test_scatter_writes_across_tensor_boundary() {
        let mut p = params();
        let flat: Vec<f32> = (0..10).map(|v| -(v as f32)).collect();
        ShardedView::new(&mut p, NonZeroUsize::new(4).unwrap())
            .scatter(&flat)
            .unwrap();
        assert_eq!(p.to_flat(), flat);
        assert!(LocalView::new(&mut p).scatter(&[1.0]).is_err());
    }
}
