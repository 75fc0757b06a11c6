//! Lexical helpers for generated SQL: statement splitting and the leading verb.
//!
//! Only quotes and comments are understood; this is not a SQL parser. The
//! quoting forms follow DuckDB: `'...'`, `"..."`, `E'...'` with backslash
//! escapes, and dollar quotes (`$$...$$`, `$tag$...$tag$`).

/// Splits `sql` on `;` outside string literals, quoted identifiers and
/// comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let escapes = c == '\'' && is_escape_string(&chars, i);
                // Doubled quotes close and immediately reopen, which is equivalent.
                let end = quoted_end(&chars, i, escapes);
                current.extend(&chars[i..end]);
                i = end;
            }
            '$' => match dollar_tag_len(&chars, i) {
                Some(tag_len) => {
                    let end = dollar_quoted_end(&chars, i, tag_len);
                    current.extend(&chars[i..end]);
                    i = end;
                }
                None => {
                    current.push(c);
                    i += 1;
                }
            },
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                current.push(' ');
            }
            ';' => {
                push_statement(&mut statements, &current);
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &current);

    statements
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// `E'...'` (or `e'...'`) where the `E` starts a token.
fn is_escape_string(chars: &[char], quote: usize) -> bool {
    match quote.checked_sub(1).map(|i| (i, chars[i])) {
        Some((i, 'E' | 'e')) => i == 0 || !is_identifier_char(chars[i - 1]),
        _ => false,
    }
}

/// Index one past the closing quote, or the end of input if unterminated.
fn quoted_end(chars: &[char], start: usize, escapes: bool) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if escapes && chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Length of a `$tag$` opener at `start`, if there is one. Positional
/// parameters (`$1`) and `$` inside identifiers are not openers.
fn dollar_tag_len(chars: &[char], start: usize) -> Option<usize> {
    if start > 0 && is_identifier_char(chars[start - 1]) {
        return None;
    }
    let mut i = start + 1;
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    let tag_starts_with_digit = chars.get(start + 1).is_some_and(|c| c.is_ascii_digit());
    if chars.get(i) == Some(&'$') && !tag_starts_with_digit {
        Some(i + 1 - start)
    } else {
        None
    }
}

fn dollar_quoted_end(chars: &[char], start: usize, tag_len: usize) -> usize {
    let tag = &chars[start..start + tag_len];
    let mut i = start + tag_len;
    while i + tag_len <= chars.len() {
        if &chars[i..i + tag_len] == tag {
            return i + tag_len;
        }
        i += 1;
    }
    chars.len()
}

fn push_statement(statements: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// The first keyword of a statement, uppercased, skipping comments and
/// opening parentheses.
pub fn leading_verb(sql: &str) -> Option<String> {
    let statement = split_statements(sql).into_iter().next()?;
    let word: String = statement
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();

    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}
