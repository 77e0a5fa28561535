use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

pub const NAME_MAX_LEN: usize = 100;
const SLUG_MAX_LEN: usize = 60;
const HASH_LEN: usize = 8;
const TIMESTAMP_DIGITS: i64 = 10_000_000_000;
const FALLBACK_SLUG: &str = "tpl";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_]*$").expect("valid name regex"));

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len().min(SLUG_MAX_LEN * 2));
    for ch in text.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if (ch.is_whitespace() || ch == '_' || ch == '-') && !slug.ends_with('_') {
            slug.push('_');
        }
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug.to_string()
    }
}

/// Builds a provider-safe template name. Two calls never return the same name,
/// even for identical text and seed.
pub fn generate_name(text: &str, seed: DateTime<Utc>) -> String {
    let slug = slugify(text);

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(seed.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let digest = hex::encode(hasher.finalize());

    let stamp = seed.timestamp_millis().rem_euclid(TIMESTAMP_DIGITS);
    let name = format!("{slug}_{}_{stamp}", &digest[..HASH_LEN]);
    if name.len() > NAME_MAX_LEN {
        name[..NAME_MAX_LEN].to_string()
    } else {
        name
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX_LEN && NAME_RE.is_match(name)
}
