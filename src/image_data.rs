use std::cmp;

use image::{imageops, GrayImage, Luma};

/// Resizes `img` to the canvas height keeping its aspect ratio, clamps the
/// width to the canvas width and pads the right side with black.
pub fn fit_to_canvas(img: &GrayImage, height: u32, width: u32) -> GrayImage {
    let [origin_height, origin_width] = [img.height().max(1), img.width().max(1)];
    let new_width = cmp::min(
        width,
        (height as f64 * (origin_width as f64) / (origin_height as f64)).round() as u32,
    )
    .max(1);
    let resized = imageops::resize(img, new_width, height, imageops::FilterType::Lanczos3);

    if new_width < width {
        let mut padded = GrayImage::from_pixel(width, height, Luma([0]));
        imageops::overlay(&mut padded, &resized, 0, 0);
        padded
    } else {
        resized
    }
}

/// Appends the pixels of `img` to `buf`, mapped from `[0, 255]` to `[-1.0, 1.0]`.
pub fn extend_normalized(buf: &mut Vec<f32>, img: &GrayImage) {
    buf.extend(img.as_raw().iter().map(|&px| (px as f32 - 127.5) / 127.5));
}

/// Places `images` side by side after scaling each of them to `height`.
pub fn concat_horizontally(images: &[&GrayImage], height: u32) -> GrayImage {
    let scaled: Vec<GrayImage> = images
        .iter()
        .map(|img| {
            let width = (height as f64 * img.width() as f64 / img.height().max(1) as f64)
                .round()
                .max(1.0) as u32;
            imageops::resize(*img, width, height, imageops::FilterType::Triangle)
        })
        .collect();

    let total_width = scaled.iter().map(|img| img.width()).sum::<u32>().max(1);
    let mut canvas = GrayImage::from_pixel(total_width, height, Luma([0]));
    let mut offset = 0i64;
    for img in &scaled {
        imageops::overlay(&mut canvas, img, offset, 0);
        offset += img.width() as i64;
    }

    canvas
}
