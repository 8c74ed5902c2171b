use std::fmt;
use uuid::Uuid;

/// Correlation token tying a published request to its eventual response.
///
/// Minted once per request at ingress as a UUID v4, so tokens stay unique
/// across every request outstanding at the same time, no matter how many
/// connections arrive within the same millisecond. On the broker the token
/// travels as message metadata (key and header); the bridge never looks
/// inside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    // ---

    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        // ---
        Self(Uuid::new_v4().to_string())
    }

    /// Recover a token from raw broker metadata (header value or key).
    ///
    /// Returns `None` for empty or non UTF-8 metadata; such a message can
    /// never match a request minted here.
    pub fn from_metadata(raw: &[u8]) -> Option<Self> {
        // ---
        let text = std::str::from_utf8(raw).ok()?.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self(text.to_string()))
    }

    /// Borrow the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Borrow the token as raw bytes, the form carried in broker metadata.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
