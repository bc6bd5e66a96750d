use std::sync::OnceLock;

use matchbook_core::VendorAlias;
use regex::Regex;

use crate::config::MatchingConfig;
use crate::util::{contains_phrase, normalize, similarity};

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Card processors prepend their own tag: "SQ *BLUE BOTTLE", "PAYPAL *NETFLIX".
re!(
    re_processor_prefix,
    r"(?i)^\s*(?:paypal\s*\*?|(?:sq|tst|dnh|dmi|py|sp|pp|ckcd)\s*\*)\s*"
);
re!(re_store_number, r"#\s*\d+");

const NOISE_WORDS: &[&str] = &["the", "inc", "llc", "ltd", "co", "corp", "store"];

/// Significant words kept in a vendor pattern.
const PATTERN_WORDS: usize = 2;

/// Reduces raw vendor or bank text to the pattern used for alias lookup and
/// vendor scoring: processor prefixes, store numbers, numeric tokens and
/// legal suffixes removed, first two significant words kept.
pub fn vendor_pattern(text: &str) -> String {
    let stripped = re_processor_prefix().replace(text, "");
    let stripped = re_store_number().replace_all(&stripped, " ");
    normalize(&stripped)
        .split(' ')
        .filter(|w| !w.is_empty())
        .filter(|w| !w.chars().any(|c| c.is_ascii_digit()))
        .filter(|w| !NOISE_WORDS.contains(w))
        .take(PATTERN_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorMatchKind {
    Exact,
    Alias,
    Pattern,
    Similar,
    Mismatch,
}

impl VendorMatchKind {
    pub fn describe(self) -> &'static str {
        match self {
            VendorMatchKind::Exact => "exact vendor match",
            VendorMatchKind::Alias => "vendor alias match",
            VendorMatchKind::Pattern => "vendor pattern match",
            VendorMatchKind::Similar => "similar vendor",
            VendorMatchKind::Mismatch => "vendor mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VendorMatch {
    /// 0–100.
    pub score: f64,
    pub kind: VendorMatchKind,
}

/// An alias paired with its precomputed display-name key.
struct IndexedAlias {
    alias: VendorAlias,
    display_key: String,
}

/// Lookup over a user's learned vendor aliases.
pub struct AliasIndex {
    aliases: Vec<IndexedAlias>,
}

impl AliasIndex {
    pub fn new(aliases: Vec<VendorAlias>) -> Self {
        let mut indexed: Vec<IndexedAlias> = aliases
            .into_iter()
            .filter(|a| !a.pattern.is_empty())
            .map(|alias| {
                let display_key = normalize(&alias.display_name);
                IndexedAlias { alias, display_key }
            })
            .collect();
        // Longest (most specific) pattern first; ties by pattern text for stable lookups.
        indexed.sort_by(|a, b| {
            b.alias
                .pattern
                .len()
                .cmp(&a.alias.pattern.len())
                .then_with(|| a.alias.pattern.cmp(&b.alias.pattern))
        });
        Self { aliases: indexed }
    }

    pub fn empty() -> Self {
        Self { aliases: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Most specific alias whose pattern occurs in `text`.
    pub fn find_for_text(&self, text: &str) -> Option<&VendorAlias> {
        let norm = normalize(text);
        let pattern = vendor_pattern(text);
        self.aliases
            .iter()
            .find(|ia| ia.alias.pattern == pattern || contains_phrase(&norm, &ia.alias.pattern))
            .map(|ia| &ia.alias)
    }

    /// Resolves receipt vendor text by pattern, or by the alias display name
    /// (receipts often carry the canonical name rather than the bank text).
    pub fn resolve_vendor(&self, vendor: &str) -> Option<&VendorAlias> {
        self.find_for_text(vendor).or_else(|| {
            let key = normalize(vendor);
            self.aliases
                .iter()
                .find(|ia| !key.is_empty() && ia.display_key == key)
                .map(|ia| &ia.alias)
        })
    }
}

/// Compares receipt vendor text against the texts describing a candidate
/// (merchant name, description) and keeps the best result.
pub fn compare_vendors(
    receipt_vendor: &str,
    candidate_texts: &[&str],
    aliases: &AliasIndex,
    config: &MatchingConfig,
) -> VendorMatch {
    let receipt_pattern = vendor_pattern(receipt_vendor);
    let receipt_norm = normalize(receipt_vendor);
    let receipt_alias = aliases.resolve_vendor(receipt_vendor);

    candidate_texts
        .iter()
        .map(|text| {
            let mut result = compare_one(&receipt_pattern, &receipt_norm, text, config);
            // Aliases only bridge texts the patterns do not already link, so
            // learning from a confirmation never rescores that same pair.
            let linked = matches!(result.kind, VendorMatchKind::Exact | VendorMatchKind::Pattern);
            if let Some(ra) = receipt_alias.filter(|_| !linked) {
                let same_alias = aliases
                    .find_for_text(text)
                    .is_some_and(|ca| ca.pattern == ra.pattern);
                if same_alias && result.score < config.alias_floor {
                    result = VendorMatch {
                        score: config.alias_floor,
                        kind: VendorMatchKind::Alias,
                    };
                }
            }
            result
        })
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .unwrap_or(VendorMatch {
            score: 0.0,
            kind: VendorMatchKind::Mismatch,
        })
}

fn compare_one(
    receipt_pattern: &str,
    receipt_norm: &str,
    text: &str,
    config: &MatchingConfig,
) -> VendorMatch {
    let pattern = vendor_pattern(text);
    let norm = normalize(text);

    if receipt_pattern.is_empty() || pattern.is_empty() {
        return VendorMatch {
            score: 0.0,
            kind: VendorMatchKind::Mismatch,
        };
    }
    if receipt_pattern == pattern {
        return VendorMatch {
            score: 100.0,
            kind: VendorMatchKind::Exact,
        };
    }
    if contains_phrase(&norm, receipt_pattern) || contains_phrase(receipt_norm, &pattern) {
        return VendorMatch {
            score: config.substring_floor,
            kind: VendorMatchKind::Pattern,
        };
    }

    let score = similarity(receipt_pattern, &pattern) * 100.0;
    let kind = if score >= config.similar_vendor_threshold {
        VendorMatchKind::Similar
    } else {
        VendorMatchKind::Mismatch
    };
    VendorMatch { score, kind }
}
