use image::DynamicImage;

/// A decoded camera frame.
///
/// Produced by exactly one capture worker and published into its
/// [`FrameSurface`](crate::surface::FrameSurface); readers observe it
/// through a shared `Arc` and must not assume any particular colour layout
/// beyond what [`image::DynamicImage`] guarantees.
///
/// # Example
/// ```rust
/// use camgrid_core::prelude::*;
/// use image::{DynamicImage, RgbaImage};
///
/// let frame = Frame::new(DynamicImage::ImageRgba8(RgbaImage::new(4, 2)));
/// assert_eq!(frame.width(), 4);
/// assert_eq!(frame.height(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    image: DynamicImage,
}

impl Frame {
    /// Wrap a decoded image, capturing its dimensions.
    pub fn new(image: DynamicImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            image,
        }
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Borrow the decoded pixels.
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }
}

impl From<DynamicImage> for Frame {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}
