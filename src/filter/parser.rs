// Recursive-descent parser for RFC 2254 / RFC 4515 filter strings

use super::{Filter, MAX_DEPTH};
use crate::error::{LdapError, Result};

const EXPECTED: &str = "Expected `(`, `&`, `|`, `!` or criteria";

/// Parse a filter string such as `(&(objectClass=person)(cn~=Test))`.
///
/// The outermost parentheses are optional: `objectClass=*` and
/// `(objectClass=*)` parse to the same filter. Composites may nest up to
/// [`MAX_DEPTH`] levels.
pub fn parse(input: &str) -> Result<Filter> {
    nested(input, 1)
}

fn nested(input: &str, depth: usize) -> Result<Filter> {
    if depth > MAX_DEPTH {
        return Err(LdapError::filter(input, "Filter nested too deeply"));
    }
    let inner = strip_parens(input);
    match inner.as_bytes().first() {
        Some(b'&') => Ok(Filter::And(groups(&inner[1..], depth)?)),
        Some(b'|') => Ok(Filter::Or(groups(&inner[1..], depth)?)),
        Some(b'!') => Ok(Filter::not(nested(&inner[1..], depth + 1)?)),
        Some(_) => criteria(inner),
        None => Err(LdapError::filter(input, EXPECTED)),
    }
}

/// Remove one pair of enclosing parentheses, but only when the leading `(`
/// is closed by the trailing `)` and not by something in between.
fn strip_parens(input: &str) -> &str {
    let bytes = input.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'(' || bytes[bytes.len() - 1] != b')' {
        return input;
    }
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && i != bytes.len() - 1 {
                    return input;
                }
            }
            _ => {}
        }
    }
    &input[1..input.len() - 1]
}

/// Split `(a)(b)(c)` into its balanced groups and parse each one.
fn groups(input: &str, depth: usize) -> Result<Vec<Filter>> {
    let bytes = input.as_bytes();
    let mut filters = Vec::new();
    let mut start = 0;

    while start < bytes.len() {
        if bytes[start] != b'(' {
            return Err(LdapError::filter(&input[start..], EXPECTED));
        }
        let mut depth = 0usize;
        let mut end = None;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + offset);
                        break;
                    }
                }
                _ => {}
            }
        }
        let end = end.ok_or_else(|| LdapError::filter(&input[start..], "Unbalanced parentheses"))?;
        filters.push(nested(&input[start..=end], depth + 1)?);
        start = end + 1;
    }

    Ok(filters)
}

fn is_attribute_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b':' | b';' | b'_' | b'.' | b'-')
}

/// `attribute operator value`
fn criteria(input: &str) -> Result<Filter> {
    let head_len = input.bytes().take_while(|&b| is_attribute_char(b)).count();
    if head_len == 0 {
        return Err(LdapError::filter(input, EXPECTED));
    }
    let (head, rest) = input.split_at(head_len);

    let (op, attribute, value) = if head.ends_with(':') && rest.starts_with('=') {
        (":=", &head[..head.len() - 1], &rest[1..])
    } else if let Some(value) = rest.strip_prefix('=') {
        ("=", head, value)
    } else if rest.as_bytes().get(1) == Some(&b'=') && rest.is_char_boundary(1) {
        let op = &rest[..2];
        match op {
            "~=" | ">=" | "<=" => (op, head, &rest[2..]),
            _ => {
                return Err(LdapError::filter(
                    input,
                    format!("Unrecognized operator `{}`", op),
                ))
            }
        }
    } else {
        return Err(LdapError::filter(input, EXPECTED));
    };

    if value.is_empty() {
        return Err(LdapError::filter(input, "Missing assertion value"));
    }

    let filter = match op {
        "=" => equality_or_substring(attribute, value),
        "~=" => Filter::Approximate {
            attribute: attribute.to_string(),
            value: value.to_string(),
        },
        ">=" => Filter::GreaterOrEqual {
            attribute: attribute.to_string(),
            value: value.to_string(),
        },
        "<=" => Filter::LessOrEqual {
            attribute: attribute.to_string(),
            value: value.to_string(),
        },
        _ => extensible(input, attribute, value)?,
    };
    Ok(filter)
}

fn equality_or_substring(attribute: &str, value: &str) -> Filter {
    if value == "*" {
        return Filter::presence(attribute);
    }

    let mut pieces = split_unescaped_stars(value);
    if pieces.len() == 1 {
        return Filter::equality(attribute, value);
    }

    let final_ = pieces.pop().filter(|s| !s.is_empty());
    let initial = Some(pieces.remove(0)).filter(|s| !s.is_empty());

    Filter::Substring {
        attribute: attribute.to_string(),
        initial,
        any: pieces,
        final_,
    }
}

/// Split on every `*` that is not preceded by a backslash.
fn split_unescaped_stars(value: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut prev = None;
    for c in value.chars() {
        if c == '*' && prev != Some('\\') {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
        prev = Some(c);
    }
    pieces.push(current);
    pieces
}

/// `[attribute][:dn][:rule]:=value`
fn extensible(input: &str, head: &str, value: &str) -> Result<Filter> {
    let mut parts = head.split(':');
    let attribute = parts
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut dn_attributes = false;
    let mut next = parts.next();
    if let Some(part) = next {
        if part.eq_ignore_ascii_case("dn") {
            dn_attributes = true;
            next = parts.next();
        }
    }

    let rule = match next {
        Some("") => return Err(LdapError::filter(input, "Empty matching rule")),
        Some(rule) => Some(rule.to_string()),
        None => None,
    };

    if parts.next().is_some() {
        return Err(LdapError::filter(input, "Too many `:` in extensible match"));
    }
    if attribute.is_none() && rule.is_none() {
        return Err(LdapError::filter(
            input,
            "Extensible match needs an attribute or a matching rule",
        ));
    }

    Ok(Filter::Extensible {
        attribute,
        rule,
        value: value.to_string(),
        dn_attributes,
    })
}
