//! Minimal XML text helpers shared by the markup exporters and the HTML flattener.

use regex::Regex;
use std::sync::OnceLock;

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // not representable in XML 1.0
            c if (c as u32) < 0x20 && c != '\n' && c != '\t' && c != '\r' => {}
            c => out.push(c),
        }
    }
    out
}

pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let Some(end) = tail.find(';').filter(|&e| e <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            e if e.starts_with("#x") || e.starts_with("#X") => {
                u32::from_str_radix(&e[2..], 16).ok().and_then(char::from_u32)
            }
            e if e.starts_with('#') => e[1..].parse::<u32>().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([\w:.-]+)\s*=\s*"([^"]*)""#).expect("static regex"))
}

/// Value of attribute `name` in a raw attribute list. Namespace prefixes
/// are ignored, so `href` also matches `l:href`.
pub fn attr(attrs: &str, name: &str) -> Option<String> {
    attr_re()
        .captures_iter(attrs)
        .find(|c| c[1].rsplit(':').next() == Some(name))
        .map(|c| decode_entities(&c[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_then_decode() {
        let s = "a < b & \"c\" 'd'\u{1}";
        assert_eq!(escape(s), "a &lt; b &amp; &quot;c&quot; &apos;d&apos;");
        assert_eq!(decode_entities(&escape("x<y&z")), "x<y&z");
    }

    #[test]
    fn unknown_entities_are_kept() {
        assert_eq!(decode_entities("&bogus; & &#x41;"), "&bogus; & A");
    }

    #[test]
    fn attributes_match_by_local_name() {
        let attrs = r##" id="v1_ch2" l:href="#img1" media-type="image/png" data-id="x""##;
        assert_eq!(attr(attrs, "id").as_deref(), Some("v1_ch2"));
        assert_eq!(attr(attrs, "href").as_deref(), Some("#img1"));
        assert_eq!(attr(attrs, "media-type").as_deref(), Some("image/png"));
        assert_eq!(attr(attrs, "type"), None);
    }
}
