//! Pairing code rendering.
//!
//! Engines hand over raw pairing tokens; this module turns them into
//! something a human can scan: a PNG data URL for browsers and streams, or
//! Unicode block art for the terminal.

pub mod qr;

pub use qr::{
    generate_png_qr, generate_png_qr_bytes, generate_terminal_qr, render_data_url,
    DATA_URL_PREFIX,
};
