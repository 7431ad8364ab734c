//! GAP's printed list/record syntax, which is the only interchange format the
//! census data files use.

mod subgroup;
mod value;

pub use subgroup::{read_bucket_indices, write_bucket_assignments, write_record_list, ListTarget, SubgroupRecord};
pub use value::{parse_assignments, strip_continuations, GapValue};

/// Given the byte index of an opening `[` or `(`, returns the byte index of
/// its matching closer. Brackets inside strings and `#` comments are ignored.
/// Returns `None` for a truncated block.
pub fn match_bracket(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    match bytes.get(start) {
        Some(b'[') | Some(b'(') => {}
        _ => return None,
    }
    let mut depth = 0_usize;
    let mut ix = start;
    let mut in_string = false;
    let mut in_comment = false;
    while ix < bytes.len() {
        let b = bytes[ix];
        if in_comment {
            if b == b'\n' {
                in_comment = false;
            }
        } else if in_string {
            if b == b'\\' {
                ix += 1;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'#' => in_comment = true,
                b'[' | b'(' => depth += 1,
                b']' | b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(ix);
                    }
                }
                _ => {}
            }
        }
        ix += 1;
    }
    None
}

/// Every top-level `rec( ... )` block of `text`, in order. A list that is
/// still being written (no closing `];`) yields the blocks that are complete;
/// a half-written trailing block is dropped.
pub fn rec_blocks(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut ix = 0;
    let mut in_string = false;
    let mut in_comment = false;
    while ix < bytes.len() {
        let b = bytes[ix];
        if in_comment {
            if b == b'\n' {
                in_comment = false;
            }
            ix += 1;
            continue;
        }
        if in_string {
            if b == b'\\' {
                ix += 1;
            } else if b == b'"' {
                in_string = false;
            }
            ix += 1;
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'#' => in_comment = true,
            b'r' if text[ix..].starts_with("rec")
                && (ix == 0 || !is_ident_byte(bytes[ix - 1])) =>
            {
                let mut open = ix + 3;
                while open < bytes.len() && bytes[open].is_ascii_whitespace() {
                    open += 1;
                }
                if bytes.get(open) == Some(&b'(') {
                    match match_bracket(text, open) {
                        Some(close) => {
                            out.push(&text[ix..=close]);
                            ix = close + 1;
                            continue;
                        }
                        None => break,
                    }
                }
            }
            _ => {}
        }
        ix += 1;
    }
    out
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Extracts the value of `name := [ ... ];` from a file without parsing
/// the rest of it.
pub fn find_list<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(found) = text[search_from..].find(name) {
        let at = search_from + found;
        search_from = at + name.len();
        if at > 0 && is_ident_byte(text.as_bytes()[at - 1]) {
            continue;
        }
        let rest = text[search_from..].trim_start();
        let Some(after_assign) = rest.strip_prefix(":=") else {
            continue;
        };
        let value = after_assign.trim_start();
        if !value.starts_with('[') {
            return None;
        }
        let open = text.len() - value.len();
        let close = match_bracket(text, open)?;
        return Some(&text[open..=close]);
    }
    None
}
