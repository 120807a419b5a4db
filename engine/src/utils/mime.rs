//! MIME type detection for capture files

use std::path::Path;

/// Infer the MIME type of a screenshot file from its extension,
/// defaulting to PNG (the capture adapters write PNG unless told otherwise).
pub fn mime_from_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("image/png")
        .to_string()
}

/// Detect MIME type from the leading bytes of an image file.
///
/// Returns `Some(mime_type)` for recognized signatures, `None` otherwise.
/// Used as a fallback when a capture adapter hands over extensionless files.
pub fn detect_image_mime(data: &[u8]) -> Option<&'static str> {
    if data.len() < 4 {
        return None;
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if data.starts_with(b"RIFF") && data.len() >= 12 && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.starts_with(b"BM") && data.len() >= 6 {
        return Some("image/bmp");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_path() {
        assert_eq!(mime_from_path(Path::new("shot.png")), "image/png");
        assert_eq!(mime_from_path(Path::new("shot.jpg")), "image/jpeg");
        assert_eq!(mime_from_path(Path::new("shot.webp")), "image/webp");
        // Unknown extensions fall back to PNG
        assert_eq!(mime_from_path(Path::new("shot.dat")), "image/png");
    }

    #[test]
    fn test_detect_image_mime() {
        assert_eq!(
            detect_image_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
            Some("image/png")
        );
        assert_eq!(
            detect_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some("image/jpeg")
        );
        assert_eq!(detect_image_mime(b"RIFFxxxxWEBP"), Some("image/webp"));
        assert_eq!(detect_image_mime(&[0x00, 0x01]), None);
    }
}
