//! Source image loading and description.
//!
//! Chains operate on in-memory images; this module is where files enter
//! the system. Load failures are ordinary [`StageError`]s so a missing or
//! corrupt scan surfaces as a per-page failure result instead of tearing
//! down the batch.

use image::RgbaImage;

use recto_pipeline::{Dimensions, ImageId, PageId, PageInfo, StageError, source_fingerprint};

/// Load a scan's source frame as RGBA.
///
/// # Errors
///
/// Returns [`StageError::SourceLoad`] when the file cannot be read or
/// decoded.
pub fn load_source(image_id: &ImageId) -> Result<RgbaImage, StageError> {
    let path = image_id.path();
    let bytes = std::fs::read(path).map_err(|err| StageError::SourceLoad {
        path: path.to_path_buf(),
        source: image::ImageError::IoError(err),
    })?;
    let decoded = image::load_from_memory(&bytes).map_err(|source| StageError::SourceLoad {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.to_rgba8())
}

/// Describe a page for the pipeline: read its source file once to learn
/// dimensions and content fingerprint.
///
/// # Errors
///
/// Returns [`StageError::SourceLoad`] when the file cannot be read or
/// decoded.
pub fn describe_page(page_id: PageId) -> Result<PageInfo, StageError> {
    let path = page_id.image_id().path().to_path_buf();
    let bytes = std::fs::read(&path).map_err(|err| StageError::SourceLoad {
        path: path.clone(),
        source: image::ImageError::IoError(err),
    })?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|source| StageError::SourceLoad { path, source })?;
    let size = Dimensions::new(decoded.width(), decoded.height());
    Ok(PageInfo::new(page_id, size, source_fingerprint(&bytes)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use recto_pipeline::SubPage;

    fn write_png(dir: &std::path::Path, name: &str, width: u32, height: u32) -> ImageId {
        let path = dir.join(name);
        let img = RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
        img.save(&path).unwrap();
        ImageId::new(path, 0)
    }

    #[test]
    fn load_source_decodes_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_png(dir.path(), "scan.png", 12, 34);
        let image = load_source(&id).unwrap();
        assert_eq!((image.width(), image.height()), (12, 34));
    }

    #[test]
    fn missing_file_is_a_stage_error() {
        let id = ImageId::new("/nonexistent/scan.png", 0);
        assert!(matches!(
            load_source(&id),
            Err(StageError::SourceLoad { .. }),
        ));
    }

    #[test]
    fn corrupt_file_is_a_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"not an image").unwrap();
        let id = ImageId::new(path, 0);
        assert!(matches!(
            load_source(&id),
            Err(StageError::SourceLoad { .. }),
        ));
    }

    #[test]
    fn describe_page_reports_size_and_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_png(dir.path(), "scan.png", 20, 10);
        let page = PageId::new(id, SubPage::Single);
        let info = describe_page(page.clone()).unwrap();
        assert_eq!(info.id(), &page);
        assert_eq!(info.source_size(), Dimensions::new(20, 10));

        // Identical content fingerprints identically.
        let again = describe_page(info.id().clone()).unwrap();
        assert_eq!(info.source_fingerprint(), again.source_fingerprint());
    }
}
