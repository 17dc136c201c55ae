//! Shell-glob to regex compiler used by `keys()` on the in-process cache.
//!
//! Supported syntax matches what the remote backend understands natively:
//! `*`, `?`, `[abc]`, `[a-z]`, `[!abc]` / `[^abc]`, and backslash escapes for
//! any of those. An unterminated `[` is taken literally.

use regex::Regex;

use super::CacheError;

/// Compiles `pattern` into a regex anchored at both ends.
pub fn compile(pattern: &str) -> Result<Regex, CacheError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => match chars.get(i + 1) {
                Some(&escaped) => {
                    push_literal(&mut out, escaped);
                    i += 2;
                }
                None => {
                    push_literal(&mut out, '\\');
                    i += 1;
                }
            },
            '*' => {
                out.push_str(".*");
                i += 1;
            }
            '?' => {
                out.push('.');
                i += 1;
            }
            '[' => match compile_class(&chars, i) {
                Some((class, next)) => {
                    out.push_str(&class);
                    i = next;
                }
                None => {
                    push_literal(&mut out, '[');
                    i += 1;
                }
            },
            c => {
                push_literal(&mut out, c);
                i += 1;
            }
        }
    }
    out.push('$');

    Regex::new(&out).map_err(|e| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn push_class_literal(class: &mut String, c: char) {
    if matches!(c, '\\' | '[' | ']' | '^' | '-' | '&' | '~') {
        class.push('\\');
    }
    class.push(c);
}

/// Translates the bracket expression starting at `chars[start] == '['`.
///
/// Returns the regex class and the index just past the closing `]`, or `None`
/// when the bracket is never closed.
fn compile_class(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut i = start + 1;
    let mut class = String::from("[");
    if matches!(chars.get(i), Some('!') | Some('^')) {
        class.push('^');
        i += 1;
    }

    let body_start = i;
    while i < chars.len() {
        match chars[i] {
            // A `]` right after the opening bracket is a member, not the end.
            ']' if i > body_start => {
                class.push(']');
                return Some((class, i + 1));
            }
            '\\' => {
                let escaped = *chars.get(i + 1)?;
                push_class_literal(&mut class, escaped);
                i += 2;
            }
            '-' if i > body_start && chars.get(i + 1).is_some_and(|next| *next != ']') => {
                class.push('-');
                i += 1;
            }
            c => {
                push_class_literal(&mut class, c);
                i += 1;
            }
        }
    }
    None
}
