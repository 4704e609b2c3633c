//! Seed projection and locality keys.
//!
//! A projector maps every seed to a point in 4-D space and every point to a 128-bit
//! space-filling-curve key. Points and keys drive range and proximity scans only; identity is
//! always the content hash.

use serde::{Deserialize, Serialize};

use crate::hash::{composite_hash, leaf_hash, ContentHash};
use crate::node::{Relation, Seed};

/// Bits per axis of the Hilbert curve.
const AXIS_BITS: u32 = 32;

/// A quantised point in 4-D space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point4D {
    /// First axis
    pub x: u32,
    /// Second axis
    pub y: u32,
    /// Third axis
    pub z: u32,
    /// Fourth axis
    pub w: u32,
}

impl Point4D {
    /// Build a point from its coordinates.
    pub fn new(x: u32, y: u32, z: u32, w: u32) -> Self {
        Self { x, y, z, w }
    }

    fn axes(&self) -> [u32; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

/// 128-bit locality key, ordered as `(high, low)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LocalityKey {
    /// Upper 64 bits
    pub high: u64,
    /// Lower 64 bits
    pub low: u64,
}

impl LocalityKey {
    /// Smallest key.
    pub const MIN: LocalityKey = LocalityKey { high: 0, low: 0 };
    /// Largest key.
    pub const MAX: LocalityKey = LocalityKey {
        high: u64::MAX,
        low: u64::MAX,
    };

    /// The key as one 128-bit integer.
    pub fn as_u128(&self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    /// Split a 128-bit integer into a key.
    pub fn from_u128(value: u128) -> Self {
        Self {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }
}

/// Pure, deterministic seed projection plus the content hashing primitives.
///
/// Implementations must be stateless: the same input always yields the same output.
pub trait Projector: Send + Sync {
    /// Map a seed to a point.
    fn project(&self, seed: &Seed) -> Point4D;

    /// Space-filling-curve index of a point.
    fn locality_key(&self, point: &Point4D) -> LocalityKey {
        hilbert_index(point)
    }

    /// Content hash of a leaf.
    fn content_hash(&self, seed: &Seed) -> ContentHash {
        leaf_hash(seed)
    }

    /// Content hash of a composite.
    fn composite_hash(&self, relations: &[Relation]) -> ContentHash {
        composite_hash(relations)
    }

    /// Multiplicity-weighted centroid of child points.
    fn centroid(&self, children: &[(Point4D, u32)]) -> Point4D {
        centroid(children)
    }
}

/// Projects seeds onto the unit 3-sphere using Hopf coordinates driven by low-discrepancy
/// sequences, then quantises each axis to `u32`. Neighbouring seed values land far apart on
/// the sphere but deterministically so.
#[derive(Debug, Clone, Copy, Default)]
pub struct SphereProjector;

impl Projector for SphereProjector {
    fn project(&self, seed: &Seed) -> Point4D {
        // Kind offsets keep equal values of different kinds on different orbits.
        let t = seed.value as f64 + seed.kind.tag() as f64 * 0.318_309_886_183_790_7;
        let eta = frac(t * 0.618_033_988_749_894_8) * std::f64::consts::FRAC_PI_2;
        let xi1 = frac(t * 0.754_877_666_246_692_8) * std::f64::consts::TAU;
        let xi2 = frac(t * 0.569_840_290_998_053_2) * std::f64::consts::TAU;
        Point4D {
            x: quantise(eta.sin() * xi1.cos()),
            y: quantise(eta.sin() * xi1.sin()),
            z: quantise(eta.cos() * xi2.cos()),
            w: quantise(eta.cos() * xi2.sin()),
        }
    }
}

fn frac(v: f64) -> f64 {
    v - v.floor()
}

/// Map `[-1, 1]` onto the full `u32` range.
fn quantise(v: f64) -> u32 {
    let unit = ((v.clamp(-1.0, 1.0) + 1.0) / 2.0) * u32::MAX as f64;
    unit.round() as u32
}

/// Multiplicity-weighted mean of points. Empty input yields the origin.
pub fn centroid(children: &[(Point4D, u32)]) -> Point4D {
    let mut sums = [0u128; 4];
    let mut weight: u128 = 0;
    for (point, multiplicity) in children {
        let m = *multiplicity as u128;
        for (sum, axis) in sums.iter_mut().zip(point.axes()) {
            *sum += axis as u128 * m;
        }
        weight += m;
    }
    if weight == 0 {
        return Point4D::default();
    }
    Point4D {
        x: (sums[0] / weight) as u32,
        y: (sums[1] / weight) as u32,
        z: (sums[2] / weight) as u32,
        w: (sums[3] / weight) as u32,
    }
}

/// 4-D Hilbert index with 32 bits per axis (Skilling's transpose algorithm), interleaved
/// most-significant bit first into 128 bits.
pub fn hilbert_index(point: &Point4D) -> LocalityKey {
    let mut x = point.axes();
    let n = x.len();
    let m: u32 = 1 << (AXIS_BITS - 1);

    // Inverse undo excess work
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u32;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for axis in x.iter_mut() {
        *axis ^= t;
    }

    let mut index: u128 = 0;
    for bit in (0..AXIS_BITS).rev() {
        for axis in x {
            index = (index << 1) | ((axis >> bit) & 1) as u128;
        }
    }
    LocalityKey::from_u128(index)
}
