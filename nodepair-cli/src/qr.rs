//! Tokens as QR codes: rendering for display, and reading them back from
//! an image file.

use std::path::Path;

use anyhow::Context;
use image::{DynamicImage, Luma};
use qrcode::QrCode;
use qrcode::render::unicode;
use rqrr::PreparedImage;
use tracing::debug;

use nodepair_core::TokenReader;

/// Reads the token from a QR code in the image at the hint path.
///
/// If the hint is not a readable image, or the image holds no QR code, the
/// hint is returned unchanged, so a literal token given where an image was
/// expected still works.
#[derive(Debug, Clone, Copy, Default)]
pub struct QrImageReader;

impl TokenReader for QrImageReader {
    fn read_token(&self, hint: &str) -> String {
        match decode_qr_file(Path::new(hint)) {
            Ok(Some(token)) => {
                debug!(image = %hint, "Token read from QR code");
                token
            }
            Ok(None) => {
                debug!(image = %hint, "No QR code in image, using hint as token");
                hint.to_owned()
            }
            Err(e) => {
                debug!(hint = %hint, error = %e, "Hint is not an image, using it as token");
                hint.to_owned()
            }
        }
    }
}

/// Decodes the first QR code found in `image`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // pixel coordinates come from u32 dimensions
pub fn decode_qr(image: &DynamicImage) -> Option<String> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let mut prepared = PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
        gray.get_pixel(x as u32, y as u32).0[0]
    });

    prepared
        .detect_grids()
        .into_iter()
        .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
}

/// Opens the image at `path` and decodes the first QR code in it.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or is not an image.
pub fn decode_qr_file(path: &Path) -> anyhow::Result<Option<String>> {
    let image =
        image::open(path).with_context(|| format!("failed to open image {}", path.display()))?;
    Ok(decode_qr(&image))
}

/// Renders `text` as a QR code drawn with unicode half blocks, two modules
/// per character cell, light on dark so it scans from a dark terminal.
///
/// # Errors
///
/// Returns an error if `text` does not fit in a QR code.
pub fn render_terminal(text: &str) -> anyhow::Result<String> {
    let code = QrCode::new(text.as_bytes()).context("token does not fit in a QR code")?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// Writes `text` as a QR code PNG to `path`.
///
/// # Errors
///
/// Returns an error if `text` does not fit in a QR code or the file cannot
/// be written.
pub fn save_png(text: &str, path: &Path) -> anyhow::Result<()> {
    let code = QrCode::new(text.as_bytes()).context("token does not fit in a QR code")?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(256, 256)
        .module_dimensions(8, 8)
        .build();
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use nodepair_core::generate_token;

    use super::*;

    #[test]
    fn given_png_qr_when_read_then_token_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.png");
        let token = generate_token();

        save_png(&token, &path).unwrap();

        assert_eq!(QrImageReader.read_token(path.to_str().unwrap()), token);
    }

    #[test]
    fn given_literal_token_when_read_then_returned_unchanged() {
        assert_eq!(QrImageReader.read_token("ABC123"), "ABC123");
    }

    #[test]
    fn given_image_without_qr_when_read_then_hint_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.png");
        image::GrayImage::from_pixel(64, 64, Luma([255u8]))
            .save(&path)
            .unwrap();

        let hint = path.to_str().unwrap();
        assert_eq!(QrImageReader.read_token(hint), hint);
        assert_eq!(decode_qr_file(&path).unwrap(), None);
    }

    #[test]
    fn given_non_image_file_when_decoded_then_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "not an image").unwrap();

        assert!(decode_qr_file(&path).is_err());
    }

    #[test]
    fn when_rendered_for_terminal_expect_multiline_blocks() {
        let rendered = render_terminal("ABC123").unwrap();
        assert!(rendered.lines().count() > 10);
        assert!(rendered.contains('█') || rendered.contains('▀') || rendered.contains('▄'));
    }
}
