//! Item identifiers: short opaque tokens drawn from the OS random source.

use base64::Engine;

/// Random bytes per id; encodes to 16 url-safe base64 characters.
const ID_BYTES: usize = 12;

/// Generate a fresh item id. Fails only if the OS random source is unavailable.
pub fn generate_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; ID_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}
