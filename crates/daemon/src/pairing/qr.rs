//! QR code rendering for pairing tokens.
//!
//! This module provides QR code generation for session pairing, supporting
//! PNG data URLs for the HTTP surface, terminal display using Unicode block
//! characters, and PNG file output.

use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{ImageBuffer, Luma};
use qrcode::QrCode;

/// Prefix of every rendered pairing code payload.
pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// QR code module size in pixels for PNG output.
const PNG_MODULE_SIZE: u32 = 8;

/// Quiet zone (border) size in modules for PNG output.
const PNG_QUIET_ZONE: u32 = 4;

/// Quiet zone width in terminal columns.
const TERMINAL_QUIET_ZONE: usize = 4;

fn encode(token: &str) -> anyhow::Result<QrCode> {
    if token.is_empty() {
        anyhow::bail!("pairing token is empty");
    }
    QrCode::new(token.as_bytes()).context("Failed to encode pairing token as QR code")
}

/// Draws the QR modules into a grayscale image with a white quiet zone.
fn render_image(code: &QrCode) -> ImageBuffer<Luma<u8>, Vec<u8>> {
    let modules = code.to_colors();
    let qr_width = code.width();

    let quiet_zone_pixels = PNG_QUIET_ZONE * PNG_MODULE_SIZE;
    let qr_pixels = qr_width as u32 * PNG_MODULE_SIZE;
    let image_size = qr_pixels + 2 * quiet_zone_pixels;

    let mut img: ImageBuffer<Luma<u8>, Vec<u8>> =
        ImageBuffer::from_pixel(image_size, image_size, Luma([255u8]));

    for (idx, color) in modules.iter().enumerate() {
        if *color != qrcode::Color::Dark {
            continue;
        }
        let row = (idx / qr_width) as u32;
        let col = (idx % qr_width) as u32;

        let x_start = quiet_zone_pixels + col * PNG_MODULE_SIZE;
        let y_start = quiet_zone_pixels + row * PNG_MODULE_SIZE;

        for dy in 0..PNG_MODULE_SIZE {
            for dx in 0..PNG_MODULE_SIZE {
                img.put_pixel(x_start + dx, y_start + dy, Luma([0u8]));
            }
        }
    }

    img
}

/// Generates a PNG QR code for a pairing token and returns it as bytes.
///
/// # Errors
/// Returns an error if the token is empty, too long for a QR code, or the
/// image cannot be encoded.
pub fn generate_png_qr_bytes(token: &str) -> anyhow::Result<Vec<u8>> {
    let code = encode(token)?;
    let img = render_image(&code);

    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    img.write_to(&mut cursor, image::ImageFormat::Png)
        .context("Failed to encode QR image as PNG")?;

    Ok(bytes)
}

/// Renders a pairing token as a `data:image/png;base64,...` URL.
///
/// This is the payload cached on session records and carried by `code`
/// events and stream frames.
pub fn render_data_url(token: &str) -> anyhow::Result<String> {
    let bytes = generate_png_qr_bytes(token)?;
    Ok(format!("{}{}", DATA_URL_PREFIX, BASE64.encode(bytes)))
}

/// Generates a PNG QR code and saves it to the specified path.
pub fn generate_png_qr(token: &str, path: &Path) -> anyhow::Result<()> {
    let code = encode(token)?;
    render_image(&code)
        .save(path)
        .with_context(|| format!("Failed to write QR image: {}", path.display()))?;
    Ok(())
}

/// Generates a terminal-displayable QR code using Unicode block characters.
///
/// Two module rows are packed into each text line:
/// - Upper half block (U+2580): dark on top, light below
/// - Lower half block (U+2584): light on top, dark below
/// - Full block (U+2588): both dark
/// - Space: both light
pub fn generate_terminal_qr(token: &str) -> anyhow::Result<String> {
    let code = encode(token)?;
    let modules = code.to_colors();
    let width = code.width();
    let height = modules.len() / width;
    let full_width = width + 2 * TERMINAL_QUIET_ZONE;
    let margin = " ".repeat(TERMINAL_QUIET_ZONE);

    let mut output = String::new();
    for _ in 0..TERMINAL_QUIET_ZONE / 2 {
        output.push_str(&" ".repeat(full_width));
        output.push('\n');
    }

    let mut row = 0;
    while row < height {
        output.push_str(&margin);
        for col in 0..width {
            let top_dark = modules[row * width + col] == qrcode::Color::Dark;
            let bottom_dark =
                row + 1 < height && modules[(row + 1) * width + col] == qrcode::Color::Dark;

            let ch = match (top_dark, bottom_dark) {
                (true, true) => '\u{2588}',
                (true, false) => '\u{2580}',
                (false, true) => '\u{2584}',
                (false, false) => ' ',
            };
            output.push(ch);
        }
        output.push_str(&margin);
        output.push('\n');
        row += 2;
    }

    for _ in 0..TERMINAL_QUIET_ZONE / 2 {
        output.push_str(&" ".repeat(full_width));
        output.push('\n');
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

    #[test]
    fn test_png_qr_bytes_generation() {
        let bytes = generate_png_qr_bytes("2@abc,def,ghi").expect("Failed to generate PNG bytes");
        assert!(!bytes.is_empty(), "PNG bytes should have content");
        assert!(bytes.starts_with(&PNG_HEADER), "Bytes should have PNG header");
    }

    #[test]
    fn test_data_url_roundtrips_to_png() {
        let url = render_data_url("XYZ").expect("Failed to render data URL");
        assert!(url.starts_with(DATA_URL_PREFIX));

        let payload = BASE64
            .decode(&url[DATA_URL_PREFIX.len()..])
            .expect("payload should be base64");
        assert!(payload.starts_with(&PNG_HEADER));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        assert_eq!(
            render_data_url("XYZ").unwrap(),
            render_data_url("XYZ").unwrap()
        );
        assert_ne!(
            render_data_url("XYZ").unwrap(),
            render_data_url("XYZ2").unwrap()
        );
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(render_data_url("").is_err());
        assert!(generate_terminal_qr("").is_err());
    }

    #[test]
    fn test_oversized_token_rejected() {
        let token = "x".repeat(8000);
        assert!(generate_png_qr_bytes(&token).is_err());
    }

    #[test]
    fn test_terminal_qr_generation() {
        let qr = generate_terminal_qr("pairing-token").expect("Failed to generate terminal QR");

        let lines: Vec<&str> = qr.lines().collect();
        assert!(lines.len() > 10, "QR code should have multiple rows");
        assert!(
            qr.contains('\u{2588}') || qr.contains('\u{2580}') || qr.contains('\u{2584}'),
            "QR code should contain Unicode block characters"
        );

        let widths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]), "rows must be aligned");
    }

    #[test]
    fn test_png_qr_file_generation() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("pairing.png");

        generate_png_qr("file-token", &path).expect("Failed to generate PNG QR");

        let file_bytes = std::fs::read(&path).expect("Failed to read file");
        assert!(file_bytes.starts_with(&PNG_HEADER));
    }
}
