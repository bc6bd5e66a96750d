/// Levenshtein edit distance using the two-row O(min(m,n)) space algorithm.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let a = s1.as_bytes();
    let b = s2.as_bytes();
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Keep the shorter string in the inner loop to minimise allocation.
    let (a, b, m, n) = if m <= n { (a, b, m, n) } else { (b, a, n, m) };

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Edit-distance similarity in [0.0, 1.0]; two empty strings are identical.
pub fn similarity(s1: &str, s2: &str) -> f64 {
    let max_len = s1.len().max(s2.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein_distance(s1, s2) as f64 / max_len as f64)
}

/// Lowercase alphanumeric words joined by single spaces.
pub fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word containment of `needle` in `haystack`, both already normalised.
pub fn contains_phrase(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    format!(" {haystack} ").contains(&format!(" {needle} "))
}

/// Rounds to two decimals and clamps into [0, 100].
pub fn clamp_score(score: f64) -> f64 {
    ((score * 100.0).round() / 100.0).clamp(0.0, 100.0)
}
