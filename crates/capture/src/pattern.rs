//! Synthetic frames for when the decoder cannot deliver.
//!
//! Workers that lose their camera keep publishing recognisable scenes so
//! the display shows motion instead of a frozen last frame. The scene is
//! keyed by camera number so neighbouring slots stay distinguishable.

use std::time::{SystemTime, UNIX_EPOCH};

use camgrid_core::frame::Frame;
use image::{DynamicImage, Rgba, RgbaImage};

/// Render one synthetic frame for the given camera slot.
pub fn test_pattern(camera_number: u32, frame_num: u64, width: u32, height: u32) -> Frame {
    let width = width.max(1);
    let height = height.max(1);
    let mut img = RgbaImage::new(width, height);

    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let tick = (seconds % 60) as u32;
    let n = frame_num as u32;

    // Primary capture nodes are even numbered, so the scenes key on 0 and
    // 2; everything else gets the colour cycle.
    for y in 0..height {
        for x in 0..width {
            let px = match camera_number {
                0 => sky(x, y, height, tick),
                2 => urban(x, y, tick),
                _ => cycle(x, y, n),
            };
            img.put_pixel(x, y, px);
        }
    }

    // White corner block that flips on and off so a frozen feed is obvious.
    if seconds % 100 < 50 {
        for y in 0..20.min(height) {
            for x in 0..50.min(width) {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
    }

    Frame::new(DynamicImage::ImageRgba8(img))
}

/// Blue gradient sky with drifting cloud blocks.
fn sky(x: u32, y: u32, height: u32, tick: u32) -> Rgba<u8> {
    let gradient = f64::from(y) / f64::from(height);
    let mut px = Rgba([
        (135.0 * (1.0 - gradient)) as u8,
        (206.0 * (1.0 - gradient)) as u8,
        (250.0 * (1.0 - gradient)) as u8,
        255,
    ]);
    if x % 80 < 20 && y % 60 < 15 {
        let white = 200u8.saturating_add(((15 * tick) % 55) as u8);
        px = Rgba([white, white, white, 255]);
    }
    px
}

/// Grey blocks with window-like highlights.
fn urban(x: u32, y: u32, tick: u32) -> Rgba<u8> {
    if (x % 40 < 5 || y % 30 < 3) && x + y > 200 {
        return Rgba([180, 180, 200, 255]);
    }
    let grey = (128 + (50 * tick) % 80) as u8;
    Rgba([grey, grey, grey, 255])
}

/// Frame-indexed colour cycle for slots without a dedicated scene.
fn cycle(x: u32, y: u32, n: u32) -> Rgba<u8> {
    Rgba([
        ((x + n) % 256) as u8,
        ((y + n / 2) % 256) as u8,
        ((x + y + n / 3) % 256) as u8,
        255,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_requested_dimensions() {
        let frame = test_pattern(0, 7, 320, 240);
        assert_eq!(frame.width(), 320);
        assert_eq!(frame.height(), 240);
    }

    #[test]
    fn zero_dimensions_are_clamped() {
        let frame = test_pattern(1, 0, 0, 0);
        assert_eq!(frame.width(), 1);
        assert_eq!(frame.height(), 1);
    }

    #[test]
    fn camera_two_renders_the_grey_urban_scene() {
        // Sample a pixel outside the blinking overlay block and away from
        // the window highlights: urban is grey (r == g == b), the colour
        // cycle is not.
        let urban = test_pattern(2, 9, 320, 240);
        let px = urban.image().as_rgba8().unwrap().get_pixel(60, 40);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);

        let cycle = test_pattern(4, 9, 320, 240);
        let px = cycle.image().as_rgba8().unwrap().get_pixel(60, 40);
        assert_ne!(px[0], px[1]);
    }
}
