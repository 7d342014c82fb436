use std::fmt::{Debug, Display};

use thiserror::Error;

/// Error type for [`ShardingSpec`] construction and shard layout computation.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ShardingError {
    #[error("sharding must cover at least one device")]
    EmptyDeviceSet,

    #[error("device '{device}' appears more than once in the sharding device set")]
    DuplicateDevice { device: String },

    #[error("tile count for dimension #{dimension} must be > 0")]
    InvalidTileCount { dimension: usize },

    #[error("tile counts imply {expected_device_count} device(s), but the sharding covers {actual_device_count}")]
    DeviceCountMismatch { expected_device_count: usize, actual_device_count: usize },

    #[error("tile counts have rank {tile_rank} but the array has rank {array_rank}")]
    RankMismatch { tile_rank: usize, array_rank: usize },

    #[error("invalid shard slice range [{start}, {end})")]
    InvalidShardSlice { start: usize, end: usize },
}

impl From<ShardingError> for crate::Error {
    fn from(error: ShardingError) -> Self {
        crate::Error::invalid_argument(error.to_string())
    }
}

/// Half-open slice `[start, end)` for one logical array dimension in a shard. For an untiled dimension, the slice
/// spans the full extent `[0, dim_size)`. For a tiled dimension, the slice covers the partition assigned to the
/// shard based on its position in the tile grid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardSlice {
    start: usize,
    end: usize,
}

impl ShardSlice {
    /// Creates a new shard slice.
    pub fn new(start: usize, end: usize) -> Result<Self, ShardingError> {
        if start > end {
            return Err(ShardingError::InvalidShardSlice { start, end });
        }
        Ok(Self { start, end })
    }

    /// Inclusive start index.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Exclusive end index.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length of this slice.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` iff this slice is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Placement strategy of a [`ShardingSpec`] over its device set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardingKind {
    /// Every device in the sharding device set holds a full copy of the logical array.
    Replicated,

    /// The logical array is split into a dense grid of tiles, one per device. `tile_counts` holds the number of
    /// partitions per logical dimension, ordered from the most major to the most minor dimension, and its product
    /// must equal the device count. Shards are assigned to devices in row-major tile-grid order.
    Tiled { tile_counts: Vec<usize> },
}

impl ShardingKind {
    /// Computes the per-dimension logical [`ShardSlice`]s of every shard of an array with the provided global
    /// dimension sizes, for a placement over `shard_count` devices, in shard order. Uneven tile splits assign the
    /// remainder one element at a time to the lowest-indexed partitions.
    pub fn shard_slices(
        &self,
        shard_count: usize,
        global_dims: &[usize],
    ) -> Result<Vec<Vec<ShardSlice>>, ShardingError> {
        match self {
            Self::Replicated => {
                let slices: Vec<ShardSlice> =
                    global_dims.iter().map(|size| ShardSlice { start: 0, end: *size }).collect();
                Ok(vec![slices; shard_count])
            }
            Self::Tiled { tile_counts } => {
                if tile_counts.len() != global_dims.len() {
                    return Err(ShardingError::RankMismatch {
                        tile_rank: tile_counts.len(),
                        array_rank: global_dims.len(),
                    });
                }
                for (dimension, count) in tile_counts.iter().enumerate() {
                    if *count == 0 {
                        return Err(ShardingError::InvalidTileCount { dimension });
                    }
                }
                let expected_device_count: usize = tile_counts.iter().product();
                if expected_device_count != shard_count {
                    return Err(ShardingError::DeviceCountMismatch {
                        expected_device_count,
                        actual_device_count: shard_count,
                    });
                }
                let mut shards = Vec::with_capacity(shard_count);
                for shard_index in 0..shard_count {
                    let coordinate = tile_coordinate(shard_index, tile_counts);
                    let mut slices = Vec::with_capacity(global_dims.len());
                    for (dimension, dimension_size) in global_dims.iter().copied().enumerate() {
                        slices.push(partition_slice(dimension_size, tile_counts[dimension], coordinate[dimension])?);
                    }
                    shards.push(slices);
                }
                Ok(shards)
            }
        }
    }

    /// Computes the dimension sizes of every shard of an array with the provided global dimension sizes, for a
    /// placement over `shard_count` devices, in shard order.
    pub fn shard_dims(&self, shard_count: usize, global_dims: &[usize]) -> Result<Vec<Vec<usize>>, ShardingError> {
        Ok(self
            .shard_slices(shard_count, global_dims)?
            .into_iter()
            .map(|slices| slices.into_iter().map(|slice| slice.len()).collect())
            .collect())
    }
}

/// Describes how a logical array is laid out across an ordered set of devices. This is the descriptor that sharded
/// data handles carry and that compilation consumes when annotating program inputs and outputs.
///
/// The device set is ordered: shard `i` of a sharded array lives on `devices()[i]` (for a replicated sharding the
/// "shard" is a full copy). The device set of a sharded handle's descriptor always matches the device set of the
/// physical array it describes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShardingSpec {
    devices: Vec<String>,
    kind: ShardingKind,
}

impl ShardingSpec {
    /// Creates a new replicated [`ShardingSpec`] over the provided ordered device set.
    pub fn replicated<S: Into<String>, I: IntoIterator<Item = S>>(devices: I) -> Result<Self, ShardingError> {
        Self::new(devices, ShardingKind::Replicated)
    }

    /// Creates a new tiled [`ShardingSpec`] over the provided ordered device set. The product of `tile_counts`
    /// must equal the device count.
    pub fn tiled<S: Into<String>, I: IntoIterator<Item = S>>(
        devices: I,
        tile_counts: Vec<usize>,
    ) -> Result<Self, ShardingError> {
        Self::new(devices, ShardingKind::Tiled { tile_counts })
    }

    fn new<S: Into<String>, I: IntoIterator<Item = S>>(devices: I, kind: ShardingKind) -> Result<Self, ShardingError> {
        let devices: Vec<String> = devices.into_iter().map(Into::into).collect();
        if devices.is_empty() {
            return Err(ShardingError::EmptyDeviceSet);
        }
        let mut seen = std::collections::HashSet::with_capacity(devices.len());
        for device in &devices {
            if !seen.insert(device.as_str()) {
                return Err(ShardingError::DuplicateDevice { device: device.clone() });
            }
        }
        if let ShardingKind::Tiled { tile_counts } = &kind {
            for (dimension, count) in tile_counts.iter().enumerate() {
                if *count == 0 {
                    return Err(ShardingError::InvalidTileCount { dimension });
                }
            }
            let expected_device_count: usize = tile_counts.iter().product();
            if expected_device_count != devices.len() {
                return Err(ShardingError::DeviceCountMismatch {
                    expected_device_count,
                    actual_device_count: devices.len(),
                });
            }
        }
        Ok(Self { devices, kind })
    }

    /// Returns the ordered device set of this [`ShardingSpec`].
    pub fn devices(&self) -> &[String] {
        self.devices.as_slice()
    }

    /// Returns the [`ShardingKind`] of this [`ShardingSpec`].
    pub fn kind(&self) -> &ShardingKind {
        &self.kind
    }

    /// Returns `true` iff every device holds a full copy of the logical array.
    pub fn is_replicated(&self) -> bool {
        matches!(self.kind, ShardingKind::Replicated)
    }

    /// Returns the number of shards, which always equals the device count.
    pub fn shard_count(&self) -> usize {
        self.devices.len()
    }

    /// Computes the per-dimension logical [`ShardSlice`]s of every shard of an array with the provided global
    /// dimension sizes, in shard order. Uneven tile splits assign the remainder one element at a time to the
    /// lowest-indexed partitions.
    pub fn shard_slices(&self, global_dims: &[usize]) -> Result<Vec<Vec<ShardSlice>>, ShardingError> {
        self.kind.shard_slices(self.devices.len(), global_dims)
    }

    /// Computes the dimension sizes of every shard of an array with the provided global dimension sizes,
    /// in shard order.
    pub fn shard_dims(&self, global_dims: &[usize]) -> Result<Vec<Vec<usize>>, ShardingError> {
        self.kind.shard_dims(self.devices.len(), global_dims)
    }
}

impl Display for ShardingSpec {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ShardingKind::Replicated => formatter.write_str("replicated")?,
            ShardingKind::Tiled { tile_counts } => {
                formatter.write_str("tiled[")?;
                let mut counts = tile_counts.iter();
                if let Some(first_count) = counts.next() {
                    write!(formatter, "{first_count}")?;
                    counts.try_for_each(|count| write!(formatter, ", {count}"))?;
                }
                formatter.write_str("]")?;
            }
        }
        write!(formatter, "{{{}}}", self.devices.join(", "))
    }
}

impl Debug for ShardingSpec {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "ShardingSpec[{self}]")
    }
}

/// Converts a row-major shard index into its coordinate in the tile grid.
fn tile_coordinate(shard_index: usize, tile_counts: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0; tile_counts.len()];
    let mut remainder = shard_index;
    for (dimension, count) in tile_counts.iter().enumerate().rev() {
        coordinate[dimension] = remainder % count;
        remainder /= count;
    }
    coordinate
}

fn partition_slice(
    dimension_size: usize,
    partition_count: usize,
    partition_index: usize,
) -> Result<ShardSlice, ShardingError> {
    let base_size = dimension_size / partition_count;
    let remainder = dimension_size % partition_count;
    let extra_before = partition_index.min(remainder);
    let start = partition_index * base_size + extra_before;
    let size = base_size + usize::from(partition_index < remainder);
    ShardSlice::new(start, start + size)
}
