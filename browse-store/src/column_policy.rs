//! Column sizing for browse values and sort keys.
//!
//! Lengths are counted in `char`s and every cut lands on a `char` boundary, so a
//! multi-byte code point is never split.

use std::borrow::Cow;

use crate::StoreError;

pub const DEFAULT_OMISSION_MARK: &str = "...";

/// Cut `value` to at most `limit` chars, ending in `omission` when there is room for it.
///
/// `limit <= 0` means unlimited.
pub fn truncate_value<'a>(value: &'a str, limit: i64, omission: &str) -> Cow<'a, str> {
    if limit <= 0 {
        return Cow::Borrowed(value);
    }
    let limit = limit as usize;
    if value.chars().count() <= limit {
        return Cow::Borrowed(value);
    }
    let mark_len = omission.chars().count();
    if limit <= mark_len {
        return Cow::Owned(value.chars().take(limit).collect());
    }
    let mut out: String = value.chars().take(limit - mark_len).collect();
    out.push_str(omission);
    Cow::Owned(out)
}

/// Same rules as [`truncate_value`], for sort columns.
pub fn truncate_sort_value<'a>(value: &'a str, limit: i64, omission: &str) -> Cow<'a, str> {
    truncate_value(value, limit, omission)
}

/// Hard per-column ceilings declared by a backend. `None` is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCeilings {
    pub value_chars: Option<usize>,
    pub sort_chars: Option<usize>,
}

impl StoreCeilings {
    pub const UNLIMITED: StoreCeilings = StoreCeilings { value_chars: None, sort_chars: None };
}

/// Resolved limits for one store instance. `0` is unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLimits {
    max_value_chars: i64,
    max_sort_chars: i64,
    omission_mark: String,
}

impl Default for ColumnLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl ColumnLimits {
    pub fn unlimited() -> Self {
        Self { max_value_chars: 0, max_sort_chars: 0, omission_mark: DEFAULT_OMISSION_MARK.to_string() }
    }

    /// Combine configured limits with a backend's ceilings.
    ///
    /// `-1` and `0` mean unlimited; anything lower is rejected. A ceiling wins
    /// when the configured value is unlimited or larger.
    pub fn resolve(
        configured_value: i64,
        configured_sort: i64,
        omission_mark: &str,
        ceilings: StoreCeilings,
    ) -> Result<Self, StoreError> {
        let max_value_chars = resolve_one("value", configured_value, ceilings.value_chars)?;
        let max_sort_chars = resolve_one("sort", configured_sort, ceilings.sort_chars)?;
        Ok(Self { max_value_chars, max_sort_chars, omission_mark: omission_mark.to_string() })
    }

    pub fn max_value_chars(&self) -> i64 { self.max_value_chars }
    pub fn max_sort_chars(&self) -> i64 { self.max_sort_chars }
    pub fn omission_mark(&self) -> &str { &self.omission_mark }

    pub fn truncate_value<'a>(&self, value: &'a str) -> Cow<'a, str> {
        truncate_value(value, self.max_value_chars, &self.omission_mark)
    }

    pub fn truncate_sort_value<'a>(&self, value: &'a str) -> Cow<'a, str> {
        truncate_sort_value(value, self.max_sort_chars, &self.omission_mark)
    }
}

fn resolve_one(column: &str, configured: i64, ceiling: Option<usize>) -> Result<i64, StoreError> {
    if configured < -1 {
        return Err(StoreError::Configuration(format!(
            "{column} column limit must be -1, 0 or positive, got {configured}"
        )));
    }
    let configured = configured.max(0);
    Ok(match ceiling {
        Some(c) if configured == 0 || configured > c as i64 => c as i64,
        _ => configured,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "",
        "a",
        "abc",
        "Proceedings of the Conference",
        "日本語のタイトルです",
        "emoji 😀😀😀 sort key",
        "e\u{301}e\u{301}e\u{301}",
    ];

    #[test]
    fn proceedings_scenario() {
        let out = truncate_value("Proceedings of the Conference", 10, "...");
        assert_eq!(out, "Proceed...");
        assert_eq!(out.chars().count(), 10);
    }

    #[test]
    fn unlimited_is_noop() {
        for v in SAMPLES {
            assert_eq!(truncate_value(v, 0, "..."), *v);
            assert_eq!(truncate_value(v, -1, "..."), *v);
            assert!(matches!(truncate_sort_value(v, 0, "..."), Cow::Borrowed(_)));
        }
    }

    #[test]
    fn never_exceeds_limit_and_is_idempotent() {
        for v in SAMPLES {
            for n in 1..12 {
                for mark in ["...", "", "…", "[more]"] {
                    let once = truncate_value(v, n, mark);
                    assert!(once.chars().count() <= n as usize, "{v:?} n={n} mark={mark:?}");
                    let twice = truncate_value(&once, n, mark);
                    assert_eq!(once, twice, "{v:?} n={n} mark={mark:?}");
                }
            }
        }
    }

    #[test]
    fn short_limit_hard_truncates_without_mark() {
        assert_eq!(truncate_value("abcdef", 3, "..."), "abc");
        assert_eq!(truncate_value("abcdef", 2, "..."), "ab");
        assert_eq!(truncate_value("abcdef", 4, "..."), "a...");
    }

    #[test]
    fn multibyte_cut_stays_on_char_boundary() {
        let out = truncate_sort_value("😀😀😀😀😀", 4, "...");
        assert_eq!(out, "😀...");
        let out = truncate_sort_value("日本語のタイトル", 3, "...");
        assert_eq!(out, "日本語");
    }

    #[test]
    fn resolution_order() {
        let none = StoreCeilings::UNLIMITED;
        let capped = StoreCeilings { value_chars: Some(2000), sort_chars: Some(2000) };

        let l = ColumnLimits::resolve(0, -1, "...", none).unwrap();
        assert_eq!((l.max_value_chars(), l.max_sort_chars()), (0, 0));

        let l = ColumnLimits::resolve(100, 50, "...", none).unwrap();
        assert_eq!((l.max_value_chars(), l.max_sort_chars()), (100, 50));

        let l = ColumnLimits::resolve(0, 5000, "...", capped).unwrap();
        assert_eq!((l.max_value_chars(), l.max_sort_chars()), (2000, 2000));

        let l = ColumnLimits::resolve(300, 400, "...", capped).unwrap();
        assert_eq!((l.max_value_chars(), l.max_sort_chars()), (300, 400));

        assert!(matches!(ColumnLimits::resolve(-2, 0, "...", none), Err(StoreError::Configuration(_))));
    }

    #[test]
    fn limits_apply_their_own_mark() {
        let l = ColumnLimits::resolve(6, 4, "~", StoreCeilings::UNLIMITED).unwrap();
        assert_eq!(l.truncate_value("abcdefgh"), "abcde~");
        assert_eq!(l.truncate_sort_value("abcdefgh"), "abc~");
    }
}
