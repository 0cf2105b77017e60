use std::cmp::Ordering;

/// Version tags are opaque upstream strings; the only structure we impose is
/// this normalized comparison: leading `v` stripped, split on `.` and `-`,
/// numeric segments compared numerically, the rest lexicographically, and
/// missing trailing segments imputed as `0`.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = segments(a);
    let b = segments(b);
    let len = a.len().max(b.len());
    for i in 0..len {
        let zero = Segment::Num(0);
        let sa = a.get(i).unwrap_or(&zero);
        let sb = b.get(i).unwrap_or(&zero);
        match sa.cmp(sb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub fn eq(a: &str, b: &str) -> bool {
    compare(a, b) == Ordering::Equal
}

/// Directory-safe form of a version tag: leading `v` removed, `/` replaced
/// by `_`.
pub fn sanitize(version: &str) -> String {
    let stripped = version.strip_prefix('v').unwrap_or(version);
    stripped.replace('/', "_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Num(u64),
    Text(String),
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Num(a), Segment::Num(b)) => a.cmp(b),
            // Mixed segments fall back to their string forms.
            (Segment::Num(a), Segment::Text(b)) => a.to_string().cmp(b),
            (Segment::Text(a), Segment::Num(b)) => a.cmp(&b.to_string()),
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn segments(version: &str) -> Vec<Segment> {
    let stripped = version.trim().strip_prefix('v').unwrap_or(version.trim());
    stripped
        .split(['.', '-'])
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Num(n),
            Err(_) => Segment::Text(s.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ordering() {
        assert_eq!(compare("1.2.3", "1.2.4"), Ordering::Less);
        assert_eq!(compare("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare("2.0", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn leading_v_is_ignored() {
        assert_eq!(compare("v1.2.3", "1.2.3"), Ordering::Equal);
        assert!(eq("v0.5.0", "0.5.0"));
    }

    #[test]
    fn text_segments_compare_lexicographically() {
        assert_eq!(compare("1.2.3-alpha", "1.2.3-beta"), Ordering::Less);
        assert_eq!(compare("nightly", "nightly"), Ordering::Equal);
    }

    #[test]
    fn antisymmetry_over_samples() {
        let samples = [
            "v1.2.3", "1.2.3", "1.2.4", "2024.05", "1.2.3-rc1", "0.1", "10",
            "1.2.3-rc2", "nightly-2", "v2.0.0",
        ];
        for a in samples {
            for b in samples {
                assert_eq!(compare(a, b), compare(b, a).reverse(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn sanitize_strips_v_and_slashes() {
        assert_eq!(sanitize("v1.2.3"), "1.2.3");
        assert_eq!(sanitize("release/2024"), "release_2024");
        assert_eq!(sanitize("1.0"), "1.0");
    }
}
