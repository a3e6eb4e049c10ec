use once_cell::sync::Lazy;
use regex::Regex;

/// Version tokens embedded in asset filenames, e.g. the `2.7.13.abcdef12` in
/// `firmware-rak4631-2.7.13.abcdef12.uf2`. Stripped before include matching
/// so patterns keep working across releases.
static VERSION_TOKEN_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[vV]?\d+\.\d+\.\d+(?:\.[0-9a-fA-F]{4,})?").unwrap());

pub fn strip_version_tokens(name: &str) -> String {
    VERSION_TOKEN_RX.replace_all(name, "").into_owned()
}

/// Case-insensitive substring match with a simple `*` anchor at either end.
/// The literal `*` accepts everything.
fn pattern_matches(haystack: &str, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        if haystack.starts_with(prefix) {
            return true;
        }
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if haystack.ends_with(suffix) {
            return true;
        }
    }
    haystack.contains(&pattern)
}

/// Include matching happens on the filename with version tokens stripped; an
/// empty pattern list accepts everything.
pub fn matches_include(filename: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let stripped = strip_version_tokens(filename).to_lowercase();
    patterns.iter().any(|p| pattern_matches(&stripped, p))
}

/// Exclude matching happens on the raw filename; an empty list excludes
/// nothing.
pub fn matches_exclude(filename: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let haystack = filename.to_lowercase();
    patterns.iter().any(|p| pattern_matches(&haystack, p))
}

/// Selection rule shared by all downloaders: pass when the include set
/// accepts the name and no exclude pattern matches.
pub fn passes(filename: &str, include: &[String], exclude: &[String]) -> bool {
    matches_include(filename, include) && !matches_exclude(filename, exclude)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn version_tokens_are_stripped() {
        assert_eq!(
            strip_version_tokens("firmware-rak4631-2.7.13.abcdef12.uf2"),
            "firmware-rak4631-.uf2"
        );
        assert_eq!(strip_version_tokens("app-fdroid-release.apk"), "app-fdroid-release.apk");
        assert_eq!(strip_version_tokens("meshtastic-v2.7.13.zip"), "meshtastic-.zip");
    }

    #[test]
    fn include_matches_across_versions() {
        let include = patterns(&["rak4631-"]);
        assert!(matches_include("firmware-rak4631-2.7.13.abcdef12.uf2", &include));
        assert!(matches_include("firmware-rak4631-2.8.0.123456ab.uf2", &include));
        assert!(!matches_include("firmware-tbeam-2.7.13.abcdef12.uf2", &include));
    }

    #[test]
    fn empty_include_accepts_everything() {
        assert!(matches_include("anything.bin", &[]));
    }

    #[test]
    fn star_accepts_everything() {
        assert!(matches_include("anything.bin", &patterns(&["*"])));
    }

    #[test]
    fn anchored_globs_match_at_either_end() {
        assert!(matches_include("firmware-rak.uf2", &patterns(&["firmware-*"])));
        assert!(matches_include("firmware-rak.uf2", &patterns(&["*.uf2"])));
        assert!(!matches_include("firmware-rak.bin", &patterns(&["*.uf2"])));
    }

    #[test]
    fn exclude_is_case_insensitive_substring() {
        let exclude = patterns(&["debug"]);
        assert!(matches_exclude("firmware-DEBUG-build.zip", &exclude));
        assert!(!matches_exclude("firmware-release.zip", &exclude));
        assert!(!matches_exclude("firmware-release.zip", &[]));
    }

    #[test]
    fn selection_combines_include_and_exclude() {
        let include = patterns(&["fdroid"]);
        let exclude = patterns(&["debug"]);
        assert!(passes("app-fdroid-release.apk", &include, &exclude));
        assert!(!passes("app-fdroid-debug.apk", &include, &exclude));
        assert!(!passes("app-google-release.apk", &include, &exclude));
    }
}
