use image::{imageops::FilterType, DynamicImage, GenericImageView};
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Side of the square every region is resized to before perceptual hashing.
const HASH_CANONICAL_SIDE: u32 = 64;

/// Perceptual hash of an image region, compared by Hamming distance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashFingerprint(ImageHash);

impl HashFingerprint {
    /// Builds a fingerprint from raw hash bytes (8 bits per byte).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        ImageHash::from_bytes(bytes).ok().map(Self)
    }

    pub fn bit_len(&self) -> usize {
        self.0.as_bytes().len() * 8
    }

    /// Hamming distance, or `None` when the two hashes have different lengths
    /// and are therefore incomparable.
    pub fn distance(&self, other: &Self) -> Option<u32> {
        if self.0.as_bytes().len() != other.0.as_bytes().len() {
            return None;
        }
        Some(self.0.dist(&other.0))
    }

    /// True when comparable and at most `tolerance` bits apart.
    pub fn within(&self, other: &Self, tolerance: u32) -> bool {
        self.distance(other)
            .map(|distance| distance <= tolerance)
            .unwrap_or(false)
    }

    pub fn to_base64(&self) -> String {
        self.0.to_base64()
    }
}

/// Coarse grid of average block colors used for continuous similarity scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    cols: u32,
    rows: u32,
    cells: Vec<[u8; 3]>,
}

impl BlockDescriptor {
    pub fn from_cells(cols: u32, rows: u32, cells: Vec<[u8; 3]>) -> Option<Self> {
        if cols == 0 || rows == 0 || cells.len() != (cols * rows) as usize {
            return None;
        }
        Some(Self { cols, rows, cells })
    }

    pub fn grid(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    pub fn cells(&self) -> &[[u8; 3]] {
        &self.cells
    }

    /// Fraction of corresponding blocks whose RGB distance is within
    /// `max_distance`. Descriptors of different grids score 0.0.
    pub fn similarity(&self, other: &Self, max_distance: f64) -> f64 {
        if self.grid() != other.grid() || self.cells.is_empty() {
            return 0.0;
        }

        let matching = self
            .cells
            .iter()
            .zip(&other.cells)
            .filter(|(lhs, rhs)| color_distance(lhs, rhs) <= max_distance)
            .count();

        matching as f64 / self.cells.len() as f64
    }
}

fn color_distance(lhs: &[u8; 3], rhs: &[u8; 3]) -> f64 {
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| {
            let delta = f64::from(*a) - f64::from(*b);
            delta * delta
        })
        .sum::<f64>()
        .sqrt()
}

/// Computes both descriptor kinds. Holds only geometry, no image state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintEngine {
    hash_size: u32,
    canonical: (u32, u32),
    grid: (u32, u32),
}

impl FingerprintEngine {
    pub fn new(hash_size: u32, canonical: (u32, u32), grid: (u32, u32)) -> Self {
        Self {
            hash_size: hash_size.max(1),
            canonical: (canonical.0.max(1), canonical.1.max(1)),
            grid: (grid.0.max(1), grid.1.max(1)),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.hash_size,
            (settings.resize_width, settings.resize_height),
            (settings.block_grid_cols, settings.block_grid_rows),
        )
    }

    /// DCT mean hash of the region resized to a canonical square.
    pub fn hash(&self, image: &DynamicImage) -> HashFingerprint {
        let canonical =
            image.resize_exact(HASH_CANONICAL_SIDE, HASH_CANONICAL_SIDE, FilterType::Lanczos3);
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .hash_size(self.hash_size, self.hash_size)
            .to_hasher();

        HashFingerprint(hasher.hash_image(&canonical))
    }

    /// Average color per grid block of the region resized to the canonical size.
    pub fn blocks(&self, image: &DynamicImage) -> BlockDescriptor {
        let (width, height) = self.canonical;
        let rgb = if image.dimensions() == self.canonical {
            image.to_rgb8()
        } else {
            image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
        };

        let (cols, rows) = self.grid;
        let block_w = (width / cols).max(1);
        let block_h = (height / rows).max(1);

        let mut cells = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let left = (col * block_w).min(width - 1);
                let top = (row * block_h).min(height - 1);
                let right = (left + block_w).min(width);
                let bottom = (top + block_h).min(height);

                let mut sum = [0u64; 3];
                let mut count = 0u64;
                for y in top..bottom {
                    for x in left..right {
                        let pixel = rgb.get_pixel(x, y).0;
                        for (acc, channel) in sum.iter_mut().zip(pixel) {
                            *acc += u64::from(channel);
                        }
                        count += 1;
                    }
                }

                cells.push(if count == 0 {
                    [0, 0, 0]
                } else {
                    [
                        (sum[0] / count) as u8,
                        (sum[1] / count) as u8,
                        (sum[2] / count) as u8,
                    ]
                });
            }
        }

        BlockDescriptor { cols, rows, cells }
    }
}
