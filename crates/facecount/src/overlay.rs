//! Overlay drawing onto `image::RgbImage` through `embedded-graphics`.

use embedded_graphics::{
    mono_font::{ascii::FONT_10X20, MonoTextStyle},
    pixelcolor::Rgb888,
    prelude::*,
    primitives::{PrimitiveStyle, PrimitiveStyleBuilder, Rectangle, StrokeAlignment},
    text::{Baseline, Text},
};
use facecount_core::Rect;
use image::RgbImage;
use std::convert::Infallible;

pub const BOX_COLOR: Rgb888 = Rgb888::GREEN;
pub const BANNER_TEXT_COLOR: Rgb888 = Rgb888::WHITE;
pub const BANNER_FILL_COLOR: Rgb888 = Rgb888::BLACK;

const BOX_THICKNESS: u32 = 2;
/// Vertical space between a face box and the bottom of its label.
const LABEL_GAP: i32 = 10;
const BANNER_PADDING: i32 = 10;

/// Draw target over an RGB image. Pixels outside the image are dropped.
struct Target<'a>(&'a mut RgbImage);

impl OriginDimensions for Target<'_> {
    fn size(&self) -> Size {
        Size::new(self.0.width(), self.0.height())
    }
}

impl DrawTarget for Target<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.0.dimensions();
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 && (point.x as u32) < width && (point.y as u32) < height {
                self.0
                    .put_pixel(point.x as u32, point.y as u32, image::Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

fn draw<D: Drawable<Color = Rgb888>>(image: &mut RgbImage, item: &D) {
    match item.draw(&mut Target(image)) {
        Ok(_) => {}
        Err(infallible) => match infallible {},
    }
}

/// Outline `rect` from the inside and put `label` just above it.
pub fn face_box(image: &mut RgbImage, rect: &Rect, label: &str) {
    let outline = PrimitiveStyleBuilder::new()
        .stroke_color(BOX_COLOR)
        .stroke_width(BOX_THICKNESS)
        .stroke_alignment(StrokeAlignment::Inside)
        .build();
    let area = Rectangle::new(
        Point::new(rect.x, rect.y),
        Size::new(rect.width.max(0) as u32, rect.height.max(0) as u32),
    );
    draw(image, &area.into_styled(outline));

    let style = MonoTextStyle::new(&FONT_10X20, BOX_COLOR);
    let text = Text::with_baseline(label, Point::new(rect.x, rect.y - LABEL_GAP), style, Baseline::Bottom);
    draw(image, &text);
}

/// Filled banner with its top-left corner at `origin`, holding `text`.
pub fn banner(image: &mut RgbImage, origin: (i32, i32), text: &str) {
    let style = MonoTextStyle::new(&FONT_10X20, BANNER_TEXT_COLOR);
    let text = Text::with_baseline(
        text,
        Point::new(origin.0 + BANNER_PADDING, origin.1 + BANNER_PADDING),
        style,
        Baseline::Top,
    );
    let background = text
        .bounding_box()
        .offset(BANNER_PADDING)
        .into_styled(PrimitiveStyle::with_fill(BANNER_FILL_COLOR));

    draw(image, &background);
    draw(image, &text);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(c: Rgb888) -> image::Rgb<u8> {
        image::Rgb([c.r(), c.g(), c.b()])
    }

    fn count(image: &RgbImage, x: std::ops::Range<u32>, y: std::ops::Range<u32>, color: Rgb888) -> usize {
        y.flat_map(|py| x.clone().map(move |px| (px, py)))
            .filter(|&(px, py)| *image.get_pixel(px, py) == rgb(color))
            .count()
    }

    #[test]
    fn test_face_box_outline_is_inside_rect() {
        let mut img = RgbImage::new(50, 50);
        face_box(&mut img, &Rect::new(10, 30, 20, 15), "Face");
        assert_eq!(*img.get_pixel(10, 30), rgb(BOX_COLOR));
        assert_eq!(*img.get_pixel(29, 44), rgb(BOX_COLOR));
        assert_eq!(*img.get_pixel(20, 37), image::Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(30, 45), image::Rgb([0, 0, 0]));
    }

    #[test]
    fn test_label_sits_above_box() {
        let mut img = RgbImage::new(200, 200);
        face_box(&mut img, &Rect::new(100, 100, 60, 60), "Face");
        assert!(count(&img, 100..150, 60..90, BOX_COLOR) > 0);
    }

    #[test]
    fn test_banner_fills_background_and_draws_text() {
        let mut img = RgbImage::from_pixel(400, 100, image::Rgb([128, 128, 128]));
        banner(&mut img, (10, 10), "People detected: 7");
        assert_eq!(*img.get_pixel(10, 10), rgb(BANNER_FILL_COLOR));
        assert_eq!(*img.get_pixel(5, 5), image::Rgb([128, 128, 128]));
        assert!(count(&img, 20..400, 20..40, BANNER_TEXT_COLOR) > 0);
    }

    #[test]
    fn test_drawing_off_image_is_clipped() {
        let mut img = RgbImage::new(10, 10);
        face_box(&mut img, &Rect::new(-5, -5, 30, 30), "Face");
        banner(&mut img, (8, 8), "People detected: 123");
        assert_eq!(img.dimensions(), (10, 10));
    }
}
