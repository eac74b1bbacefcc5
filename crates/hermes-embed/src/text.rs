//! Embedding-input normalization and content hashing.
//!
//! The token-strip rules here are part of the embedding-version contract:
//! [`NORM_TAG`] is baked into every version string, so changing the rules (or
//! the noise list) forces a full re-embed instead of silently corrupting hash
//! comparisons.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use once_cell::sync::Lazy;
use std::collections::HashSet;

type Blake2b128 = Blake2b<U16>;

/// Normalization contract tag. Bump when [`NOISE_TOKENS`] or the rules in
/// [`normalize`] change.
pub const NORM_TAG: &str = "norm1";

/// Release-name noise dropped before hashing and embedding: resolutions,
/// codecs, containers, rip tags.
const NOISE_TOKENS: &[&str] = &[
    "2160p", "1440p", "1080p", "720p", "576p", "480p", "360p", "4k", "uhd", "hdr", "hdr10",
    "dolby", "vision", "10bit", "8bit", "x264", "x265", "h264", "h265", "hevc", "avc", "av1",
    "aac", "ac3", "eac3", "dts", "truehd", "flac", "mp3", "opus", "bluray", "blu-ray", "bdrip",
    "brrip", "webrip", "web-dl", "webdl", "hdtv", "hdrip", "dvdrip", "dvd", "camrip", "hdcam",
    "remux", "proper", "repack", "mkv", "mp4", "avi", "wmv", "xvid", "divx",
];

static NOISE_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| NOISE_TOKENS.iter().copied().collect());

/// Compose the embedding version for a model at a dimension.
///
/// The tag ties three things together: the model identity, the vector
/// dimension, and the normalization contract. Any change to one of them makes
/// stored hashes incomparable, which is exactly what forces a re-embed.
pub fn embedding_version(model: &str, dim: usize) -> String {
    format!("{model}@{dim}+{NORM_TAG}")
}

/// Normalize an embedding input.
///
/// Lowercases, breaks release-name punctuation into spaces, drops noise
/// tokens, and collapses whitespace. Pure: equal inputs give equal outputs.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let broken: String = lowered
        .chars()
        .map(|c| match c {
            '.' | '_' | '[' | ']' | '(' | ')' | '{' | '}' | '+' => ' ',
            _ => c,
        })
        .collect();

    broken
        .split_whitespace()
        .filter(|token| !NOISE_SET.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// BLAKE2b-128 hex digest of the normalized text.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize(text);
    let mut hasher = Blake2b128::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}
