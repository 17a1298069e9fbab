//! Path skip and mask patterns.
//!
//! Both pattern lists use the same minimal glob dialect: everything before
//! the first `*` is a literal prefix.
//!
//! - **Skip patterns** match a pathname exactly, or by prefix when the
//!   pattern contains a wildcard. `/admin/*` skips `/admin/users` but not
//!   `/administration`.
//! - **Mask patterns** replace the dynamic part of a pathname with a literal
//!   `*` before it leaves the page. A single `*` keeps anything after the next
//!   `/`; a `**` swallows the rest of the path.
//!
//! # Example
//!
//! ```
//! use databuddy_tracker::patterns::{mask_path, matching_skip_pattern};
//!
//! let masks = vec!["/user/*".to_string()];
//! assert_eq!(mask_path("/user/42/profile", &masks), "/user/*/profile");
//!
//! let skips = vec!["/admin/*".to_string()];
//! assert!(matching_skip_pattern("/admin/users", &skips).is_some());
//! ```

/// Literal marker that replaces masked path segments.
pub const MASK_MARKER: &str = "*";

/// Returns the first skip pattern that matches `pathname`, if any.
#[must_use]
pub fn matching_skip_pattern<'a>(pathname: &str, patterns: &'a [String]) -> Option<&'a str> {
    patterns
        .iter()
        .find(|pattern| {
            if pattern.as_str() == pathname {
                return true;
            }
            match pattern.find('*') {
                Some(star) => pathname.starts_with(&pattern[..star]),
                None => false,
            }
        })
        .map(String::as_str)
}

/// Masks `pathname` with the first wildcard pattern whose prefix matches.
///
/// Patterns without a wildcard are ignored. Returns the pathname unchanged
/// when nothing matches.
#[must_use]
pub fn mask_path(pathname: &str, patterns: &[String]) -> String {
    for pattern in patterns {
        let Some(star) = pattern.find('*') else {
            continue;
        };

        let prefix = &pattern[..star];
        if !pathname.starts_with(prefix) {
            continue;
        }

        if pattern[star..].starts_with("**") {
            return format!("{prefix}{MASK_MARKER}");
        }

        let remainder = &pathname[prefix.len()..];
        let after_star = remainder.find('/').map_or("", |slash| &remainder[slash..]);
        return format!("{prefix}{MASK_MARKER}{after_star}");
    }

    pathname.to_string()
}
