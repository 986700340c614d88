//! Heuristic detection of fake, placeholder or synthetic API keys.
//!
//! Users paste provider keys into the app; a key copied from documentation or
//! typed as filler should be caught before it is stored or spent against a
//! metered provider. Rules run in order and the first match wins:
//!
//! 1. **Placeholder**: contains a known filler marker (`test`, `demo`,
//!    `example`, ...), is all zeros, or is a short all-digit string
//! 2. **Repeated characters**: one character makes up more than half the key
//! 3. **Low entropy**: Shannon entropy of the character distribution is below
//!    the threshold (`abcabcabc...`)
//!
//! Empty and single-character inputs are never flagged. Real provider keys
//! (20-90+ mixed-case alphanumerics, vendor prefix or not) sit well above every
//! threshold.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Case-insensitive substrings that mark a key as filler.
pub const PLACEHOLDER_MARKERS: &[&str] = &[
    "test",
    "demo",
    "sample",
    "example",
    "dummy",
    "fake",
    "placeholder",
    "your_api_key",
    "your-api-key",
    "yourapikey",
    "changeme",
    "xxxx",
];

/// Why a key was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    Placeholder,
    RepeatedChars,
    LowEntropy,
}

impl SuspicionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SuspicionReason::Placeholder => "placeholder",
            SuspicionReason::RepeatedChars => "repeated_chars",
            SuspicionReason::LowEntropy => "low_entropy",
        }
    }
}

impl fmt::Display for SuspicionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector output, serialized as `{"isSuspicious": bool, "reason"?: "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousKeyVerdict {
    pub is_suspicious: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SuspicionReason>,
}

impl SuspiciousKeyVerdict {
    pub const CLEAN: Self = Self {
        is_suspicious: false,
        reason: None,
    };

    pub fn flagged(reason: SuspicionReason) -> Self {
        Self {
            is_suspicious: true,
            reason: Some(reason),
        }
    }
}

/// Tunable thresholds. `Default` holds the production values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyDetector {
    /// All-digit keys shorter than this are placeholders.
    pub numeric_placeholder_len: usize,
    /// Share of the most frequent character above which the key is "repeated".
    pub dominant_char_ratio: f64,
    /// Minimum Shannon entropy in bits per character.
    pub min_entropy_bits: f64,
}

impl Default for KeyDetector {
    fn default() -> Self {
        Self {
            numeric_placeholder_len: 20,
            dominant_char_ratio: 0.5,
            min_entropy_bits: 3.0,
        }
    }
}

impl KeyDetector {
    pub fn detect(&self, key: &str) -> SuspiciousKeyVerdict {
        let len = key.chars().count();
        if len < 2 {
            return SuspiciousKeyVerdict::CLEAN;
        }

        if self.is_placeholder(key, len) {
            return SuspiciousKeyVerdict::flagged(SuspicionReason::Placeholder);
        }

        let frequencies = char_frequencies(key);
        let dominant = frequencies.values().copied().max().unwrap_or(0);
        if dominant as f64 / len as f64 > self.dominant_char_ratio {
            return SuspiciousKeyVerdict::flagged(SuspicionReason::RepeatedChars);
        }

        if shannon_entropy(&frequencies, len) < self.min_entropy_bits {
            return SuspiciousKeyVerdict::flagged(SuspicionReason::LowEntropy);
        }

        SuspiciousKeyVerdict::CLEAN
    }

    fn is_placeholder(&self, key: &str, len: usize) -> bool {
        let lowered = key.to_ascii_lowercase();
        if PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
            return true;
        }
        if key.chars().all(|c| c == '0') {
            return true;
        }
        len < self.numeric_placeholder_len && key.chars().all(|c| c.is_ascii_digit())
    }
}

/// Run the default detector.
pub fn detect_suspicious_api_key(key: &str) -> SuspiciousKeyVerdict {
    KeyDetector::default().detect(key)
}

fn char_frequencies(key: &str) -> HashMap<char, usize> {
    let mut counts = HashMap::new();
    for c in key.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    counts
}

/// Shannon entropy, bits per character.
pub fn shannon_entropy(frequencies: &HashMap<char, usize>, len: usize) -> f64 {
    if len == 0 {
        return 0.0;
    }
    let total = len as f64;
    frequencies
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Render a key for logs: first and last four characters only.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "****".to_string();
    }
    let head: String = chars.iter().take(4).collect();
    let tail: String = chars.iter().skip(chars.len() - 4).collect();
    format!("{head}…{tail}")
}
