// src/headers.rs
use arrayvec::{ArrayString, ArrayVec};
use thiserror::Error;

pub const MAX_HEADER_NAME: usize = 64;
pub const MAX_HEADER_VALUE: usize = 256;
/// Fixed slots stored inline in every request/response.
pub const INLINE_HEADERS: usize = 32;
/// Hard cap across inline slots plus the spill buffer.
pub const MAX_HEADERS: usize = 128;

pub type HeaderName = ArrayString<MAX_HEADER_NAME>;
pub type HeaderValue = ArrayString<MAX_HEADER_VALUE>;

#[derive(Debug, Clone, Default)]
pub struct Header {
    pub name: HeaderName,
    pub value: HeaderValue,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header name exceeds {MAX_HEADER_NAME} bytes")]
    NameTooLong,
    #[error("header value exceeds {MAX_HEADER_VALUE} bytes")]
    ValueTooLong,
    #[error("more than {MAX_HEADERS} headers")]
    TooMany,
}

/// Ordered name→value header container.
///
/// The first 32 entries live in a fixed inline array; further entries go to
/// a spill buffer whose capacity doubles on demand up to `MAX_HEADERS`.
/// Lookup is case-insensitive and returns the first-inserted value; `append`
/// never replaces, so header multiplicity is preserved in insertion order.
/// Existing entries never move once written, except that clearing resets
/// both regions.
#[derive(Debug, Default)]
pub struct HeaderMap {
    inline: ArrayVec<Header, INLINE_HEADERS>,
    spill: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inline.len() + self.spill.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inline.is_empty() && self.spill.is_empty()
    }

    /// Append a header, preserving insertion order.
    pub fn append(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        if name.len() > MAX_HEADER_NAME {
            return Err(HeaderError::NameTooLong);
        }
        if value.len() > MAX_HEADER_VALUE {
            return Err(HeaderError::ValueTooLong);
        }
        let entry = Header {
            name: HeaderName::from(name).expect("length checked"),
            value: HeaderValue::from(value).expect("length checked"),
        };
        if self.inline.len() < INLINE_HEADERS {
            self.inline.push(entry);
            return Ok(());
        }
        // Inline region full: spill, doubling capacity up to the hard cap.
        if self.len() >= MAX_HEADERS {
            return Err(HeaderError::TooMany);
        }
        if self.spill.len() == self.spill.capacity() {
            let grown = if self.spill.capacity() == 0 {
                INLINE_HEADERS
            } else {
                self.spill.capacity() * 2
            };
            let grown = grown.min(MAX_HEADERS - INLINE_HEADERS);
            self.spill.reserve_exact(grown - self.spill.len());
        }
        self.spill.push(entry);
        Ok(())
    }

    /// First-inserted value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with a single entry, or append if absent.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        self.remove(name);
        self.append(name, value)
    }

    /// Remove every entry named `name`, case-insensitive.
    pub fn remove(&mut self, name: &str) {
        self.inline.retain(|h| !h.name.eq_ignore_ascii_case(name));
        self.spill.retain(|h| !h.name.eq_ignore_ascii_case(name));
        // Refill vacated inline slots from the spill head so the inline
        // region stays the front of the insertion order.
        while self.inline.len() < INLINE_HEADERS && !self.spill.is_empty() {
            self.inline.push(self.spill.remove(0));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.inline.iter().chain(self.spill.iter())
    }

    /// Drop all entries; spill capacity is kept for reuse.
    pub fn clear(&mut self) {
        self.inline.clear();
        self.spill.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_and_multiplicity() {
        let mut h = HeaderMap::new();
        h.append("Accept", "text/html").unwrap();
        h.append("accept", "application/json").unwrap();
        h.append("Host", "example.com").unwrap();

        // Lookup is case-insensitive and returns the first-inserted value.
        assert_eq!(h.get("ACCEPT"), Some("text/html"));
        let all: Vec<&str> = h.get_all("accept").collect();
        assert_eq!(all, vec!["text/html", "application/json"]);

        let names: Vec<&str> = h.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Accept", "accept", "Host"]);
    }

    #[test]
    fn test_spill_boundary() {
        let mut h = HeaderMap::new();
        for i in 0..INLINE_HEADERS {
            h.append(&format!("X-H{}", i), "v").unwrap();
        }
        assert_eq!(h.len(), INLINE_HEADERS);
        // The 33rd entry crosses into the spill buffer.
        h.append("X-Spill", "first").unwrap();
        assert_eq!(h.len(), INLINE_HEADERS + 1);
        assert_eq!(h.get("x-spill"), Some("first"));
        assert_eq!(h.get("X-H0"), Some("v"));
    }

    #[test]
    fn test_hard_cap() {
        let mut h = HeaderMap::new();
        for i in 0..MAX_HEADERS {
            h.append(&format!("X-H{}", i), "v").unwrap();
        }
        assert_eq!(h.append("X-Over", "v"), Err(HeaderError::TooMany));
        assert_eq!(h.len(), MAX_HEADERS);
    }

    #[test]
    fn test_length_limits() {
        let mut h = HeaderMap::new();
        let name64 = "N".repeat(MAX_HEADER_NAME);
        let value256 = "v".repeat(MAX_HEADER_VALUE);
        h.append(&name64, &value256).unwrap();

        let name65 = "N".repeat(MAX_HEADER_NAME + 1);
        assert_eq!(h.append(&name65, "v"), Err(HeaderError::NameTooLong));
        let value257 = "v".repeat(MAX_HEADER_VALUE + 1);
        assert_eq!(h.append("X", &value257), Err(HeaderError::ValueTooLong));
    }

    #[test]
    fn test_set_replaces() {
        let mut h = HeaderMap::new();
        h.append("Vary", "Accept").unwrap();
        h.set("Vary", "Accept, Origin").unwrap();
        assert_eq!(h.get("vary"), Some("Accept, Origin"));
        assert_eq!(h.get_all("vary").count(), 1);

        h.set("Server", "uvhttp").unwrap();
        assert_eq!(h.get("server"), Some("uvhttp"));
    }

    #[test]
    fn test_clear_reuses() {
        let mut h = HeaderMap::new();
        for i in 0..40 {
            h.append(&format!("X-H{}", i), "v").unwrap();
        }
        h.clear();
        assert!(h.is_empty());
        h.append("Host", "x").unwrap();
        assert_eq!(h.get("host"), Some("x"));
    }
}
