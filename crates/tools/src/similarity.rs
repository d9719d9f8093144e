//! Name similarity scoring and the closed parameter-synonym table.
//!
//! Scoring is a pure function with explicit weights; the synonym table is
//! data, decoupled from the scoring. Extending the table means editing it
//! here, nowhere else.

/// Offer a candidate only above this score.
pub const SUGGESTION_THRESHOLD: f64 = 0.5;

/// Weighted similarity in `[0, 1]`:
/// exact match 1.0; case-insensitive containment 0.7–0.8 (scaled by length
/// ratio); otherwise the better of normalized Levenshtein × 0.5 and shared
/// prefix ratio × 0.3.
///
/// The weighted components combine by max (a candidate scores as its
/// strongest signal), not by sum.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let la = a.to_lowercase();
    let lb = b.to_lowercase();
    if la == lb {
        return 1.0;
    }

    if la.contains(&lb) || lb.contains(&la) {
        let shorter = la.len().min(lb.len()) as f64;
        let longer = la.len().max(lb.len()) as f64;
        return 0.7 + 0.1 * (shorter / longer);
    }

    let distance = levenshtein(&la, &lb) as f64;
    let longer = la.len().max(lb.len()).max(1) as f64;
    let lev_score = (1.0 - distance / longer) * 0.5;

    let prefix = la
        .bytes()
        .zip(lb.bytes())
        .take_while(|(x, y)| x == y)
        .count() as f64;
    let prefix_score = (prefix / longer) * 0.3;

    lev_score.max(prefix_score)
}

/// Best candidate above the suggestion threshold.
pub fn best_match<'a>(target: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<(&'a str, f64)> {
    candidates
        .into_iter()
        .map(|candidate| (candidate, similarity(target, candidate)))
        .filter(|(_, score)| *score > SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

// ── Synonym table ────────────────────────────────────────────────────────────

/// Authoritative and closed: the canonical key first, then its accepted
/// stand-ins. camelCase/snake_case variants are folded before lookup.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["path", "file", "filename", "filepath", "location", "destination"],
    &["url", "link", "address", "uri", "href"],
    &["content", "text", "data", "body", "value", "message"],
    &["selector", "element", "target", "locator", "query"],
    &["command", "cmd", "script", "exec", "run"],
];

/// Fold camelCase to snake_case for table lookups.
fn fold_case(key: &str) -> String {
    let mut folded = String::with_capacity(key.len() + 4);
    for (index, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                folded.push('_');
            }
            folded.push(ch.to_ascii_lowercase());
        } else {
            folded.push(ch);
        }
    }
    folded
}

/// True when `required` and `provided` name the same thing per the table
/// (directly, or after case folding, or by membership in one synonym group).
pub fn synonym_equivalent(required: &str, provided: &str) -> bool {
    let required = fold_case(required);
    let provided = fold_case(provided);
    if required == provided {
        return true;
    }
    SYNONYM_GROUPS.iter().any(|group| {
        group.contains(&required.as_str()) && group.contains(&provided.as_str())
    })
}
