//! Perceptual hashing
//!
//! 64-bit mean hash: grayscale, downsample to 8x8, threshold on the mean.
//! Compared by Hamming distance; visually identical frames land within a
//! couple of bits of each other while any real content change is far away.

use image::imageops::FilterType;

use super::source::CaptureError;

/// Hash grid side length (8x8 = 64 bits)
const HASH_SIZE: u32 = 8;

/// Compute the 64-bit perceptual hash of an encoded image
pub fn phash(bytes: &[u8]) -> Result<u64, CaptureError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| CaptureError::Platform(format!("image decode failed: {e}")))?;
    Ok(phash_of(&img))
}

/// Compute the hash of an already decoded image
pub fn phash_of(img: &image::DynamicImage) -> u64 {
    let small = img
        .resize_exact(HASH_SIZE, HASH_SIZE, FilterType::Triangle)
        .to_luma8();

    let total: u64 = small.pixels().map(|p| p.0[0] as u64).sum();
    let mean = total / (HASH_SIZE * HASH_SIZE) as u64;

    let mut hash = 0u64;
    for (i, pixel) in small.pixels().enumerate() {
        if pixel.0[0] as u64 > mean {
            hash |= 1 << i;
        }
    }
    hash
}

/// Hamming distance between two hashes
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(rgba)))
    }

    fn half_split(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        for y in 0..height {
            for x in 0..width / 2 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_identical_images_identical_hash() {
        let a = phash_of(&half_split(64, 64));
        let b = phash_of(&half_split(64, 64));
        assert_eq!(a, b);
    }

    #[test]
    fn test_resolution_invariance() {
        // Same content at different sizes hashes close together
        let a = phash_of(&half_split(64, 64));
        let b = phash_of(&half_split(128, 128));
        assert!(hamming(a, b) <= 2, "distance was {}", hamming(a, b));
    }

    #[test]
    fn test_different_content_is_far() {
        let a = phash_of(&half_split(64, 64));
        let mut img = RgbaImage::from_pixel(64, 64, Rgba([255, 255, 255, 255]));
        for y in 0..32 {
            for x in 0..64 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let b = phash_of(&DynamicImage::ImageRgba8(img));
        assert!(hamming(a, b) > 8, "distance was {}", hamming(a, b));
    }

    #[test]
    fn test_solid_image_hash_is_stable() {
        // A flat image thresholds everything to zero
        let a = phash_of(&solid(32, 32, [128, 128, 128, 255]));
        let b = phash_of(&solid(32, 32, [128, 128, 128, 255]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hamming() {
        assert_eq!(hamming(0, 0), 0);
        assert_eq!(hamming(0b1011, 0b1000), 2);
        assert_eq!(hamming(u64::MAX, 0), 64);
    }

    #[test]
    fn test_phash_from_encoded_bytes() {
        let img = half_split(32, 32);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let from_bytes = phash(&bytes).unwrap();
        assert_eq!(from_bytes, phash_of(&img));
    }

    #[test]
    fn test_phash_rejects_garbage() {
        assert!(phash(&[0u8; 16]).is_err());
    }
}
