// Linkwatch Engine — QR Challenge Handler
// QrChallenge (capture / current / clear), encode_challenge
//
// The platform hands us a raw pairing token; subscribers get a self-contained
// `data:image/svg+xml;base64,…` URI they can drop straight into an <img>.
// Only the latest challenge is kept since platform challenges expire.

use crate::atoms::error::{EngineError, EngineResult};
use qrcode::render::svg;
use qrcode::QrCode;

const DATA_URI_PREFIX: &str = "data:image/svg+xml;base64,";

/// Minimum rendered edge in pixels.
const MIN_DIMENSION: u32 = 256;

#[derive(Debug, Default)]
pub struct QrChallenge {
    encoded: Option<String>,
}

impl QrChallenge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the transport encoding of `raw`, replacing any previous
    /// challenge. On encode failure the handler is left empty.
    pub fn capture(&mut self, raw: &str) -> EngineResult<String> {
        self.clear();
        let encoded = encode_challenge(raw)?;
        self.encoded = Some(encoded.clone());
        Ok(encoded)
    }

    /// Last captured encoding.
    pub fn current(&self) -> Option<&str> {
        self.encoded.as_deref()
    }

    pub fn clear(&mut self) {
        self.encoded = None;
    }
}

/// Render `raw` as a QR code and wrap the SVG in a base64 data URI.
pub fn encode_challenge(raw: &str) -> EngineResult<String> {
    if raw.trim().is_empty() {
        return Err(EngineError::Challenge("empty challenge token".into()));
    }

    let code = QrCode::new(raw.as_bytes())
        .map_err(|e| EngineError::Challenge(format!("QR generation failed: {}", e)))?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .build();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, image.as_bytes());
    Ok(format!("{}{}", DATA_URI_PREFIX, b64))
}
