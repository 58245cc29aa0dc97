//! Render-engine version ordering
//!
//! Version strings look like `0.13.1`. They are compared component by
//! component from the left, numerically; a missing trailing component counts
//! as `0`, so `0.13` and `0.13.0` are the same version. This is the single
//! comparator used everywhere versions get ordered.

use std::cmp::Ordering;

/// Split a version string into its numeric components.
///
/// A leading `v` is ignored. Components that do not start with a digit
/// count as `0`; trailing non-digit characters of a component are dropped
/// (`1-rc` reads as `1`).
pub fn components(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Vec::new();
    }

    trimmed
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compare two versions. `Ordering::Greater` means `a` is the newer one.
pub fn compare(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);

    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Whether two strings name the same version once normalized.
pub fn same(a: &str, b: &str) -> bool {
    compare(a, b) == Ordering::Equal
}

/// Canonical textual form: components joined by `.`, trailing zeros beyond
/// the third component removed.
pub fn normalize(version: &str) -> String {
    let mut parts = components(version);
    while parts.len() > 3 && parts.last() == Some(&0) {
        parts.pop();
    }
    parts
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Sort newest first. The sort is stable, so equal versions keep their
/// relative input order.
pub fn sort_descending<S: AsRef<str>>(versions: &mut [S]) {
    versions.sort_by(|a, b| compare(b.as_ref(), a.as_ref()));
}

/// The newest version of the iterator, if any. On ties the first one wins.
pub fn highest<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<&'a str> = None;
    for candidate in versions {
        match best {
            Some(current) if compare(candidate, current) != Ordering::Greater => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Remove repeated versions, keeping the first occurrence of each.
pub fn dedupe(versions: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(versions.len());
    for version in versions {
        if !unique.iter().any(|seen| same(seen, version)) {
            unique.push(version.clone());
        }
    }
    unique
}
