// Environment-derived configuration, resolved once at startup.

use anyhow::{Context, Result};
use std::env;

// Use lazy_static to initialize static variables safely.
lazy_static::lazy_static! {
    pub static ref GEMINI_BASE_URL: String = env::var("GEMINI_BASE_URL")
        .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
    pub static ref GEMINI_MODEL: String = env::var("GEMINI_MODEL")
        .unwrap_or_else(|_| "gemini-1.5-flash".to_string());
    pub static ref SENSEX_QUOTE_URL: String = env::var("SENSEX_QUOTE_URL")
        .unwrap_or_else(|_| "https://api.bseindia.com/RealTimeBseIndiaAPI/api/GetSensexData/w".to_string());
}

/// Fallback timezone for `get_current_local_time` when the model supplies none.
pub const DEFAULT_TIMEZONE: &str = "Asia/Kolkata";

/// Fetch the Gemini API key from the environment.
///
/// A missing key is a fatal startup condition; callers must bail before any
/// network call is attempted.
pub fn require_api_key() -> Result<String> {
    env::var("GOOGLE_API_KEY").context(
        "GOOGLE_API_KEY environment variable not set. \
         Please set your API key before running, e.g. export GOOGLE_API_KEY='your_api_key_here'",
    )
}
