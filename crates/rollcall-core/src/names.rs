//! Student name normalization.
//!
//! The classifier stores labels in a normalized form (lowercase words joined
//! by `_`), while the database keeps names as typed. Every comparison between
//! the two goes through [`label_for`].

/// Normalize a student name into a classifier label: `"  Divy  Tank "` → `"divy_tank"`.
///
/// Underscores are treated as word separators, so labels are fixed points.
pub fn label_for(name: &str) -> String {
    name.split(|c: char| c.is_whitespace() || c == '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Human-readable form of a label: `"divy_tank"` → `"Divy Tank"`.
pub fn display_name(label: &str) -> String {
    label
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether two names refer to the same student (case- and whitespace-insensitive).
pub fn same_student(a: &str, b: &str) -> bool {
    let a = label_for(a);
    !a.is_empty() && a == label_for(b)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
