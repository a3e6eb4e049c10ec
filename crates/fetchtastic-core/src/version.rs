use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

static PLAIN_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)*$").unwrap());
static PRERELEASE_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d+(?:\.\d+)*)[.\-]?(rc|dev|alpha|beta|a|b)\.?(\d*)$").unwrap()
});
static LOCAL_PLUS_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)*)\+([A-Za-z0-9][A-Za-z0-9.\-]*)$").unwrap());
static HASH_SUFFIX_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)*)\.([A-Za-z0-9][A-Za-z0-9.\-]*)$").unwrap());
static VERSION_BASE_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)*)").unwrap());
static NAT_PART_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|[A-Za-z]+").unwrap());

/// Prerelease phase. Ordering follows PEP 440: dev < alpha < beta < rc, and
/// any prerelease sorts before the plain release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreKind {
    Dev,
    Alpha,
    Beta,
    Rc,
}

/// A version parsed into comparable parts. `release` compares
/// lexicographically, so a shorter version is lesser when all leading
/// components are equal. A hash suffix becomes a local segment and orders
/// after the same release without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVersion {
    pub release: Vec<u64>,
    pub pre: Option<(PreKind, u64)>,
    pub local: Option<String>,
}

impl Ord for NormalizedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release
            .cmp(&other.release)
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
            .then_with(|| match (&self.local, &other.local) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => local_key(a).cmp(&local_key(b)),
            })
    }
}

impl PartialOrd for NormalizedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Digit runs compare as integers and outrank alphabetic runs; alphabetic
/// runs compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum NatPart {
    Alpha(String),
    Num(u64),
}

fn natural_key(value: &str) -> Vec<NatPart> {
    NAT_PART_RX
        .find_iter(&value.to_lowercase())
        .map(|m| {
            let part = m.as_str();
            match part.parse::<u64>() {
                Ok(n) => NatPart::Num(n),
                Err(_) => NatPart::Alpha(part.to_string()),
            }
        })
        .collect()
}

fn local_key(local: &str) -> Vec<NatPart> {
    local
        .split(['.', '-', '_'])
        .map(|segment| match segment.parse::<u64>() {
            Ok(n) => NatPart::Num(n),
            Err(_) => NatPart::Alpha(segment.to_lowercase()),
        })
        .collect()
}

fn parse_components(s: &str) -> Vec<u64> {
    s.split('.').filter_map(|p| p.parse().ok()).collect()
}

fn pre_kind(label: &str) -> PreKind {
    match label.to_lowercase().as_str() {
        "dev" => PreKind::Dev,
        "a" | "alpha" => PreKind::Alpha,
        "b" | "beta" => PreKind::Beta,
        _ => PreKind::Rc,
    }
}

fn strip_v(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.len() > 1 && (trimmed.starts_with('v') || trimmed.starts_with('V')) {
        &trimmed[1..]
    } else {
        trimmed
    }
}

/// Normalize a repository-style version string: strips an optional leading
/// `v`, recognizes prerelease words with an optional numeric tail, and
/// converts trailing dot-hash segments into local identifiers
/// (`1.2.3.abc` parses as `1.2.3+abc`). Returns `None` for unparsable input.
pub fn normalize(version: &str) -> Option<NormalizedVersion> {
    let trimmed = strip_v(version);
    if trimmed.is_empty() {
        return None;
    }

    if PLAIN_RX.is_match(trimmed) {
        return Some(NormalizedVersion {
            release: parse_components(trimmed),
            pre: None,
            local: None,
        });
    }

    if let Some(caps) = PRERELEASE_RX.captures(trimmed) {
        let num = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        return Some(NormalizedVersion {
            release: parse_components(&caps[1]),
            pre: Some((pre_kind(&caps[2]), num.parse().unwrap_or(0))),
            local: None,
        });
    }

    if let Some(caps) = LOCAL_PLUS_RX.captures(trimmed) {
        return Some(NormalizedVersion {
            release: parse_components(&caps[1]),
            pre: None,
            local: Some(caps[2].to_lowercase()),
        });
    }

    if let Some(caps) = HASH_SUFFIX_RX.captures(trimmed) {
        return Some(NormalizedVersion {
            release: parse_components(&caps[1]),
            pre: None,
            local: Some(caps[2].to_lowercase()),
        });
    }

    None
}

/// Numeric release components, preferring the longest parse between the base
/// regex and the normalized form.
pub fn release_tuple(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return None;
    }

    let base = VERSION_BASE_RX
        .captures(strip_v(trimmed))
        .map(|caps| parse_components(&caps[1]));
    let normalized = normalize(trimmed).map(|v| v.release);

    match (base, normalized) {
        (Some(b), Some(n)) => Some(if b.len() > n.len() { b } else { n }),
        (b, n) => b.or(n),
    }
}

/// Total comparison: PEP-440-style ordering when both sides parse, otherwise
/// a natural-sort fallback over digit/alpha runs.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (normalize(a), normalize(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => natural_key(a).cmp(&natural_key(b)),
    }
}

pub fn ensure_v_prefix(version: &str) -> String {
    let trimmed = version.trim();
    if trimmed.is_empty() || trimmed.starts_with('v') || trimmed.starts_with('V') {
        trimmed.to_string()
    } else {
        format!("v{trimmed}")
    }
}

/// Keep only the first three dotted components and re-add the `v` prefix:
/// `v2.7.13.abcdef` becomes `v2.7.13`.
pub fn extract_clean_version(version: &str) -> Option<String> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return None;
    }

    let bare = trimmed.trim_start_matches(['v', 'V']);
    let parts: Vec<&str> = bare.split('.').collect();
    if parts.len() >= 3 {
        return Some(format!("v{}", parts[..3].join(".")));
    }
    Some(ensure_v_prefix(trimmed))
}

/// The base version expected for the next prerelease window: patch + 1,
/// without a `v` prefix (`v2.7.13` yields `2.7.14`).
pub fn expected_next_patch(release_version: &str) -> Option<String> {
    let tuple = release_tuple(release_version)?;
    if tuple.len() < 3 {
        return None;
    }
    Some(format!("{}.{}.{}", tuple[0], tuple[1], tuple[2] + 1))
}
