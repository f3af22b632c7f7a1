//! Raw-row content hashing.
//!
//! The hash covers the source text exactly as fetched. `"100"` and `"100.0"`
//! normalise to the same decimal but fingerprint differently.

use sha2::{Digest, Sha256};

/// Cell separator. U+001F (unit separator) does not occur in sheet text.
pub const CELL_SEPARATOR: char = '\u{1f}';

/// Lower-case hex SHA-256 of the cells joined by [`CELL_SEPARATOR`].
pub fn fingerprint(cells: &[String]) -> String {
    let mut h = Sha256::new();
    let mut buf = [0u8; 4];
    let sep = CELL_SEPARATOR.encode_utf8(&mut buf).as_bytes();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            h.update(sep);
        }
        h.update(cell.as_bytes());
    }
    hex::encode(h.finalize())
}

/// True when every cell is empty or whitespace, or there are no cells.
pub fn is_blank(cells: &[String]) -> bool {
    cells.iter().all(|cell| cell.trim().is_empty())
}
