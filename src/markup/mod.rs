pub mod normalize;
pub mod parse;

use anyhow::Result;
use serde_json::Value;

/// Raw page markup → cleaned text → generic parsed tree.
pub fn parse_page(raw: &str) -> Result<Value> {
    let cleaned = normalize::normalize(raw);
    parse::parse_fragment(&cleaned)
}
