//! Name validation shared by rooms and users.

/// Maximum length of a room or user name.
pub const MAX_NAME_LEN: usize = 64;

/// Check a room or user name against the allowed character set.
///
/// Names are non-empty, at most [`MAX_NAME_LEN`] bytes, and restricted to
/// ASCII alphanumerics plus `-` and `_`. The same rule applies to both kinds
/// of name so list entries and room keys can never collide with separator
/// characters used in backend key derivation.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
