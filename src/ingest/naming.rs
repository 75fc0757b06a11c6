use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::db::rows::unique_column_names;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NON_IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_]").unwrap());

/// Table name for a data file: the lowercased stem, whitespace runs joined
/// with `_`, anything outside `[a-zA-Z0-9_]` dropped. `None` if nothing is left.
pub fn table_name_for(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let lowered = stem.trim().to_lowercase();
    let joined = WHITESPACE.replace_all(&lowered, "_");
    let name = NON_IDENT.replace_all(&joined, "").into_owned();

    (!name.is_empty()).then_some(name)
}

/// Lowercased, trimmed, whitespace runs joined with `_`.
pub fn column_name(raw: &str) -> String {
    WHITESPACE
        .replace_all(&raw.trim().to_lowercase(), "_")
        .into_owned()
}

/// Normalizes a header row. Blank names become `column{n}` and clashes get
/// numeric suffixes.
pub fn column_names<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let names = raw
        .into_iter()
        .enumerate()
        .map(|(i, name)| match column_name(name) {
            n if n.is_empty() => format!("column{}", i),
            n => n,
        })
        .collect();
    unique_column_names(names)
}
