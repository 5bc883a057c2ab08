//! Dotted version comparison.
//!
//! Versions are compared segment by segment as unsigned integers. The
//! shorter version is padded with zero segments, and any segment that is
//! not a plain number counts as `0`, so `"1.2"`, `"1.2.0"` and `"1.2.x"`
//! are all equal. A leading `v` is ignored.

use std::cmp::Ordering;

fn segments(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    trimmed
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// Total order over dotted version strings.
pub fn version_ordering(a: &str, b: &str) -> Ordering {
    let av = segments(a);
    let bv = segments(b);
    let len = av.len().max(bv.len());

    for i in 0..len {
        let x = av.get(i).copied().unwrap_or(0);
        let y = bv.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compare two versions, returning `-1`, `0` or `1`.
pub fn compare_versions(a: &str, b: &str) -> i32 {
    version_ordering(a, b) as i32
}

/// True when `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    version_ordering(candidate, current) == Ordering::Greater
}
