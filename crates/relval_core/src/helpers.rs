//! Small text utilities shared by the row resolver, result parser, and
//! event ordering.

use crate::config::TcmsConfig;
use crate::error::{TcmsError, TcmsResult};

/// Make string matches less brittle: lower-case and drop whitespace and
/// the `- _ .` punctuation that people type inconsistently.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|ch| !ch.is_whitespace() && !matches!(ch, '-' | '_' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Extract bug IDs from `{{bz|NNNNNN}}` template calls in a chunk of text.
/// IDs are returned in order of appearance, duplicates included.
pub fn find_bugs(text: &str) -> Vec<String> {
    let mut bugs = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("{{bz") {
        rest = &rest[pos + 4..];
        let Some(end) = rest.find("}}") else {
            break;
        };
        let body = &rest[..end];
        rest = &rest[end + 2..];
        let Some(params) = body.strip_prefix('|') else {
            continue;
        };
        let id = params.split('|').next().unwrap_or("").trim();
        if !id.is_empty() && id.chars().all(|ch| ch.is_ascii_digit()) {
            bugs.push(id.to_string());
        }
    }
    bugs
}

/// Rank a milestone for version ordering. Unknown milestones sort between
/// the nightly streams and the named pre-release stages.
fn milestone_rank(milestone: &str) -> u32 {
    match milestone.to_ascii_lowercase().as_str() {
        "rawhide" => 0,
        "branched" => 1,
        "" => 2,
        "alpha" => 10,
        "basic" => 11,
        "beta" => 20,
        "final" | "rc" => 30,
        _ => 5,
    }
}

/// Deterministic ordering key for a (release, milestone, compose) triplet.
/// Release sorts numerically (non-numeric releases sort first), milestones
/// by stage, and composes lexically after zero-padding numeric runs so that
/// `RC10` orders after `RC9` and dates order chronologically.
pub fn triplet_sort(release: &str, milestone: &str, compose: &str) -> (u32, u32, String) {
    let relnum = release.trim().parse::<u32>().unwrap_or(0);
    (relnum, milestone_rank(milestone), pad_numbers(compose))
}

fn pad_numbers(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut digits = String::new();
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        flush_padded(&mut out, &mut digits);
        out.extend(ch.to_lowercase());
    }
    flush_padded(&mut out, &mut digits);
    out
}

fn flush_padded(out: &mut String, digits: &mut String) {
    if digits.is_empty() {
        return;
    }
    for _ in digits.len()..10 {
        out.push('0');
    }
    out.push_str(digits);
    digits.clear();
}

/// Check a dist name against the configured dist streams.
pub fn validate_dist<'a>(dist: &'a str, config: &TcmsConfig) -> TcmsResult<&'a str> {
    if config.tcms.dists.iter().any(|known| known == dist) {
        return Ok(dist);
    }
    Err(TcmsError::NotFound(format!(
        "dist {dist} is not a known compose stream (configured: {})",
        config.tcms.dists.join(", ")
    )))
}

/// The dist with the primary-product prefix removed: used in template and
/// redirect names, where the main stream contributes no extra token.
pub fn short_dist(dist: &str) -> &str {
    dist.strip_prefix("Fedora-")
        .or_else(|| dist.strip_prefix("Fedora"))
        .unwrap_or(dist)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_and_punctuation() {
        assert_eq!(normalize("QA:Testcase_base_startup"), "qa:testcasebasestartup");
        assert_eq!(normalize("Release-blocking desktops"), "releaseblockingdesktops");
        assert_eq!(normalize("x86_64 BIOS"), "x8664bios");
    }

    #[test]
    fn normalize_of_distinct_sections_stays_distinct() {
        assert_ne!(
            normalize("Release-blocking desktops"),
            normalize("Non release-blocking desktops")
        );
    }

    #[test]
    fn find_bugs_extracts_bz_templates() {
        let text = "broken <ref>{{bz|517926}}</ref> and {{bz|533420}} again";
        assert_eq!(find_bugs(text), vec!["517926", "533420"]);
    }

    #[test]
    fn find_bugs_skips_non_numeric_ids() {
        assert!(find_bugs("{{bz|CVE-2020-1}}").is_empty());
        assert!(find_bugs("{{bzzz|123}}").is_empty());
    }

    #[test]
    fn triplet_sort_orders_milestones_and_composes() {
        let beta_rc1 = triplet_sort("32", "Beta", "RC1");
        let final_rc1 = triplet_sort("32", "Final", "RC1");
        let final_rc10 = triplet_sort("32", "RC", "RC10");
        let final_rc9 = triplet_sort("32", "RC", "RC9");
        assert!(beta_rc1 < final_rc1);
        assert!(final_rc9 < final_rc10);
        assert!(triplet_sort("31", "Final", "RC1") < beta_rc1);
        assert!(triplet_sort("32", "Rawhide", "20200101.n.0") < beta_rc1);
    }

    #[test]
    fn short_dist_strips_primary_prefix() {
        assert_eq!(short_dist("Fedora"), "");
        assert_eq!(short_dist("Fedora-IoT"), "IoT");
    }
}
