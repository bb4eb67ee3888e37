//! Core data types: voxel element types, layer kinds and voxel boxes

use crate::error::{PipelineError, Result};
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// Voxel data types supported by a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 | DataType::F32 => 4,
            DataType::U64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Name used in the `info` document
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content stored in a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Image,
    Segmentation,
    Affinities,
}

/// A scalar voxel type that can be stored in a chunk.
pub trait Element:
    Copy + Default + PartialOrd + NumCast + ToPrimitive + fmt::Debug + Send + Sync + 'static
{
    const DATA_TYPE: DataType;

    /// Decode one value from exactly `size_of::<Self>()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Append the little-endian bytes of this value.
    fn write_le(self, out: &mut Vec<u8>);

    /// Accumulator able to sum many values without losing precision
    type Sum: Copy + Default + std::ops::AddAssign + Send + Sync;

    fn widen(self) -> Self::Sum;

    /// Mean of `count` values summed into `sum`, truncated toward zero for
    /// integer types
    fn mean(sum: Self::Sum, count: usize) -> Self;
}

/// Integer voxel types usable as segment labels.
pub trait Label: Element + Ord + Eq + Hash {}

macro_rules! impl_le_bytes {
    ($t:ty) => {
        fn read_le(bytes: &[u8]) -> Self {
            let mut buf = [0u8; std::mem::size_of::<$t>()];
            buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
            <$t>::from_le_bytes(buf)
        }

        fn write_le(self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.to_le_bytes());
        }
    };
}

macro_rules! impl_integer_element {
    ($t:ty, $dt:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = $dt;
            type Sum = u128;

            impl_le_bytes!($t);

            fn widen(self) -> u128 {
                <u128 as From<$t>>::from(self)
            }

            fn mean(sum: u128, count: usize) -> Self {
                let mean = sum / (count.max(1) as u128);
                <$t>::try_from(mean).unwrap_or(<$t>::MAX)
            }
        }
    };
}

macro_rules! impl_float_element {
    ($t:ty, $dt:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = $dt;
            type Sum = f64;

            impl_le_bytes!($t);

            fn widen(self) -> f64 {
                <f64 as From<$t>>::from(self)
            }

            fn mean(sum: f64, count: usize) -> Self {
                (sum / count.max(1) as f64) as $t
            }
        }
    };
}

impl_integer_element!(u8, DataType::U8);
impl_integer_element!(u16, DataType::U16);
impl_integer_element!(u32, DataType::U32);
impl_integer_element!(u64, DataType::U64);
impl_float_element!(f32, DataType::F32);
impl_float_element!(f64, DataType::F64);

impl Label for u8 {}
impl Label for u16 {}
impl Label for u32 {}
impl Label for u64 {}

/// Run `$body` with `$t` bound to the Rust type of a [`DataType`].
#[macro_export]
macro_rules! dispatch_data_type {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::types::DataType::U8 => {
                type $t = u8;
                $body
            }
            $crate::types::DataType::U16 => {
                type $t = u16;
                $body
            }
            $crate::types::DataType::U32 => {
                type $t = u32;
                $body
            }
            $crate::types::DataType::U64 => {
                type $t = u64;
                $body
            }
            $crate::types::DataType::F32 => {
                type $t = f32;
                $body
            }
            $crate::types::DataType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Like [`dispatch_data_type!`] but only for integer label types; float
/// types evaluate `$fallback`.
#[macro_export]
macro_rules! dispatch_label_type {
    ($dtype:expr, $t:ident => $body:expr, else $fallback:expr) => {
        match $dtype {
            $crate::types::DataType::U8 => {
                type $t = u8;
                $body
            }
            $crate::types::DataType::U16 => {
                type $t = u16;
                $body
            }
            $crate::types::DataType::U32 => {
                type $t = u32;
                $body
            }
            $crate::types::DataType::U64 => {
                type $t = u64;
                $body
            }
            $crate::types::DataType::F32 | $crate::types::DataType::F64 => $fallback,
        }
    };
}

/// Axis-aligned voxel box, half-open on every axis (x, y, z).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bbox {
    pub min: [i64; 3],
    pub max: [i64; 3],
}

impl Bbox {
    pub fn new(min: [i64; 3], max: [i64; 3]) -> Self {
        Self { min, max }
    }

    /// Box of `shape` voxels starting at `offset`
    pub fn from_shape(offset: [i64; 3], shape: [usize; 3]) -> Self {
        let mut max = offset;
        for i in 0..3 {
            max[i] += shape[i] as i64;
        }
        Self { min: offset, max }
    }

    /// Extent along each axis (zero for inverted axes)
    pub fn size(&self) -> [usize; 3] {
        let mut size = [0usize; 3];
        for (i, s) in size.iter_mut().enumerate() {
            *s = (self.max[i] - self.min[i]).max(0) as usize;
        }
        size
    }

    /// Number of voxels in the box
    pub fn volume(&self) -> usize {
        self.size().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.max[i] <= self.min[i])
    }

    pub fn contains_box(&self, other: &Bbox) -> bool {
        (0..3).all(|i| other.min[i] >= self.min[i] && other.max[i] <= self.max[i])
    }

    /// Overlap of two boxes, `None` when they are disjoint
    pub fn intersection(&self, other: &Bbox) -> Option<Bbox> {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = self.min[i].max(other.min[i]);
            out.max[i] = self.max[i].min(other.max[i]);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Shift so that coordinates become relative to `origin`
    pub fn relative_to(&self, origin: [i64; 3]) -> Bbox {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] -= origin[i];
            out.max[i] -= origin[i];
        }
        out
    }

    /// Index ranges usable for `ndarray` slicing, relative to `origin`
    pub fn ranges_from(&self, origin: [i64; 3]) -> [std::ops::Range<usize>; 3] {
        let rel = self.relative_to(origin);
        [
            rel.min[0] as usize..rel.max[0] as usize,
            rel.min[1] as usize..rel.max[1] as usize,
            rel.min[2] as usize..rel.max[2] as usize,
        ]
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}_{}-{}_{}-{}",
            self.min[0], self.max[0], self.min[1], self.max[1], self.min[2], self.max[2]
        )
    }
}

impl FromStr for Bbox {
    type Err = PipelineError;

    /// Parse `"x0-x1_y0-y1_z0-z1"`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PipelineError::InvalidFormat(format!("Invalid bounding box: {}", s));
        let axes: Vec<&str> = s.split('_').collect();
        if axes.len() != 3 {
            return Err(invalid());
        }

        let mut bbox = Bbox::new([0; 3], [0; 3]);
        for (i, axis) in axes.iter().enumerate() {
            // Leading '-' would be a negative minimum
            let split = axis
                .char_indices()
                .skip(1)
                .find(|&(_, c)| c == '-')
                .map(|(idx, _)| idx)
                .ok_or_else(invalid)?;
            bbox.min[i] = axis[..split].parse().map_err(|_| invalid())?;
            bbox.max[i] = axis[split + 1..].parse().map_err(|_| invalid())?;
        }
        Ok(bbox)
    }
}

impl Serialize for BboxString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BboxString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map(BboxString).map_err(serde::de::Error::custom)
    }
}

/// A [`Bbox`] serialized as its `"x0-x1_y0-y1_z0-z1"` string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BboxString(pub Bbox);

impl From<Bbox> for BboxString {
    fn from(bbox: Bbox) -> Self {
        BboxString(bbox)
    }
}
