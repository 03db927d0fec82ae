//! `application/problem+xml` rendering (RFC 7807, appendix A).
//!
//! Members become child elements of `<problem xmlns="urn:ietf:rfc:7807">`.
//! Objects nest, arrays repeat their items as `<i>` elements, `null` renders
//! as an empty element.

use serde_json::Value;

use crate::{error::WriteError, problem::ProblemDetails};

pub const XML_NAMESPACE: &str = "urn:ietf:rfc:7807";

pub fn to_xml(details: &ProblemDetails) -> Result<String, WriteError> {
    let value = serde_json::to_value(details)?;
    let mut out = String::with_capacity(256);
    out.push_str(r#"<?xml version="1.0" encoding="utf-8"?>"#);
    out.push_str(&format!(r#"<problem xmlns="{XML_NAMESPACE}">"#));
    if let Value::Object(members) = &value {
        for (name, member) in members {
            write_element(&mut out, name, member)?;
        }
    }
    out.push_str("</problem>");
    Ok(out)
}

fn write_element(out: &mut String, name: &str, value: &Value) -> Result<(), WriteError> {
    if !is_valid_name(name) {
        return Err(WriteError::InvalidXmlName(name.to_owned()));
    }

    match value {
        Value::Null => {
            out.push('<');
            out.push_str(name);
            out.push_str("/>");
        }
        Value::Bool(b) => push_text(out, name, &b.to_string())?,
        Value::Number(n) => push_text(out, name, &n.to_string())?,
        Value::String(s) => push_text(out, name, s)?,
        Value::Array(items) => {
            open(out, name);
            for item in items {
                write_element(out, "i", item)?;
            }
            close(out, name);
        }
        Value::Object(members) => {
            open(out, name);
            for (child, member) in members {
                write_element(out, child, member)?;
            }
            close(out, name);
        }
    }
    Ok(())
}

fn open(out: &mut String, name: &str) {
    out.push('<');
    out.push_str(name);
    out.push('>');
}

fn close(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn push_text(out: &mut String, name: &str, text: &str) -> Result<(), WriteError> {
    open(out, name);
    for c in text.chars() {
        match c {
            // XML 1.0 has no representation for these, escaped or not.
            '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}' => {
                return Err(WriteError::InvalidXmlChar(c));
            }
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    close(out, name);
    Ok(())
}

/// A conservative subset of XML `Name`: ASCII letters or `_` first, then
/// letters, digits, `-`, `_`, `.`; no `xml` prefix.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if name.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("xml")) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
