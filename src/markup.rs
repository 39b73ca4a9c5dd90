use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("static tag regex"));
static IMG_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc="([^"]*)""#).expect("static img regex")
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static ws regex"));

const IMAGE_CLASS: &str = "note-image";

pub fn image_tag(url: &str) -> String {
    format!(r#"<img class="{IMAGE_CLASS}" src="{}">"#, escape(url))
}

pub fn paragraph(text: &str) -> String {
    format!("<p>{}</p>", escape(text))
}

/// Returns the new content and the cursor just past `fragment`. A cursor
/// pointing into a tag is pushed past its end.
pub fn insert_fragment(content: &str, cursor: usize, fragment: &str) -> (String, usize) {
    let at = insertion_point(content, cursor);
    let mut out = String::with_capacity(content.len() + fragment.len());
    out.push_str(&content[..at]);
    out.push_str(fragment);
    out.push_str(&content[at..]);
    (out, at + fragment.len())
}

pub fn insertion_point(content: &str, cursor: usize) -> usize {
    let mut at = cursor.min(content.len());
    while !content.is_char_boundary(at) {
        at -= 1;
    }
    let before = &content[..at];
    let inside_tag = match (before.rfind('<'), before.rfind('>')) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    };
    if inside_tag {
        at = content[at..]
            .find('>')
            .map(|idx| at + idx + 1)
            .unwrap_or(content.len());
    }
    at
}

pub fn image_sources(content: &str) -> Vec<String> {
    IMG_SRC
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|src| unescape(src.as_str()))
        .collect()
}

pub fn plain_text(markup: &str) -> String {
    let stripped = TAG.replace_all(markup, " ");
    let collapsed = WHITESPACE.replace_all(&stripped, " ");
    unescape(collapsed.trim())
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
