use image::{imageops, DynamicImage, GrayImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Integer pixel rectangle, always inside the image it was clipped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// Clip a float rectangle to `img_w x img_h`. `None` when nothing is left.
    pub fn clipped(x: f32, y: f32, w: f32, h: f32, img_w: u32, img_h: u32) -> Option<Self> {
        if !(x.is_finite() && y.is_finite() && w.is_finite() && h.is_finite()) {
            return None;
        }
        let x0 = x.max(0.0).floor();
        let y0 = y.max(0.0).floor();
        let x1 = (x + w).min(img_w as f32).ceil();
        let y1 = (y + h).min(img_h as f32).ceil();
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Bring any decoded image to 3-channel RGB (gray is expanded, alpha dropped).
pub fn normalize_channels(img: &DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        other => other.to_rgb8(),
    }
}

pub fn to_gray(img: &RgbImage) -> GrayImage {
    imageops::grayscale(img)
}

pub fn crop_rgb(img: &RgbImage, rect: PixelRect) -> RgbImage {
    imageops::crop_imm(img, rect.x, rect.y, rect.width, rect.height).to_image()
}

pub fn resize_rgb(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    imageops::resize(img, width, height, imageops::FilterType::Triangle)
}

#[inline]
fn get_rgb(src: &RgbImage, x: i32, y: i32, fill: [u8; 3]) -> [f32; 3] {
    if x < 0 || y < 0 || x >= src.width() as i32 || y >= src.height() as i32 {
        return fill.map(f32::from);
    }
    src.get_pixel(x as u32, y as u32).0.map(f32::from)
}

/// Bilinear sample; pixels outside the image read as `fill`.
#[inline]
pub fn sample_bilinear_rgb(src: &RgbImage, x: f32, y: f32, fill: [u8; 3]) -> Rgb<u8> {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_rgb(src, x0, y0, fill);
    let p10 = get_rgb(src, x0 + 1, y0, fill);
    let p01 = get_rgb(src, x0, y0 + 1, fill);
    let p11 = get_rgb(src, x0 + 1, y0 + 1, fill);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let a = p00[c] + fx * (p10[c] - p00[c]);
        let b = p01[c] + fx * (p11[c] - p01[c]);
        out[c] = (a + fy * (b - a)).clamp(0.0, 255.0).round() as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, LumaA, Rgba};

    #[test]
    fn channel_normalization_handles_gray_and_rgba() {
        let gray = DynamicImage::ImageLumaA8(ImageBuffer::from_pixel(3, 2, LumaA([77u8, 10])));
        let rgb = normalize_channels(&gray);
        assert_eq!(rgb.dimensions(), (3, 2));
        assert_eq!(rgb.get_pixel(1, 1).0, [77, 77, 77]);

        let rgba = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(2, 2, Rgba([1u8, 2, 3, 0])));
        assert_eq!(normalize_channels(&rgba).get_pixel(0, 0).0, [1, 2, 3]);
    }

    #[test]
    fn bilinear_interpolates_and_fills_outside() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([200, 100, 50]));
        assert_eq!(sample_bilinear_rgb(&img, 0.5, 0.0, [0; 3]).0, [100, 50, 25]);
        assert_eq!(sample_bilinear_rgb(&img, -5.0, -5.0, [255; 3]).0, [255, 255, 255]);
    }

    #[test]
    fn clipping_rounds_outward_and_rejects_empty() {
        let r = PixelRect::clipped(-3.0, 2.5, 10.0, 4.0, 5, 5).expect("visible");
        assert_eq!(r, PixelRect { x: 0, y: 2, width: 5, height: 3 });
        assert!(PixelRect::clipped(10.0, 0.0, 5.0, 5.0, 5, 5).is_none());
        assert!(PixelRect::clipped(0.0, 0.0, 0.0, 5.0, 5, 5).is_none());
    }
}
