//! Title normalisation for record file names.
//!
//! Record ids are built from a type prefix and a slug of the title, so the
//! slug must be stable: the same title always produces the same slug.

/// Generate a slug from a title.
///
/// Lowercases the title, drops every character that is not alphanumeric,
/// whitespace or a hyphen, and turns runs of whitespace/hyphens into a
/// single hyphen. Leading and trailing hyphens are trimmed.
///
/// # Example
/// ```
/// use mnemo_storage::slug::slugify;
/// assert_eq!(slugify("Hello World!"), "hello-world");
/// assert_eq!(slugify("Don't Repeat Yourself"), "dont-repeat-yourself");
/// ```
pub fn slugify(title: &str) -> String {
    let mut result = String::with_capacity(title.len());
    let mut prev_hyphen = true; // Start true to skip leading hyphens

    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() {
            result.push(c);
            prev_hyphen = false;
        } else if c.is_whitespace() || c == '-' {
            if !prev_hyphen {
                result.push('-');
            }
            prev_hyphen = true;
        }
    }

    if result.ends_with('-') {
        result.pop();
    }

    result
}
