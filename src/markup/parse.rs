use anyhow::{bail, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

/// Parse one page's markup fragment into a generic key/value tree.
///
/// The wiki dialect is XML-shaped but not well-formed: free-text bodies carry
/// unescaped `&` and `<`, and tag casing is inconsistent. Parsing is
/// best-effort and only fails when the fragment cannot be tokenized at all.
///
/// Shape policies (callers must account for all of them):
/// - element and attribute names are lowercased
/// - text bodies are trimmed and stored under the `text` key
/// - literal `yes`/`no` values become booleans, anything else stays a string
/// - a child element occurring once is a scalar; repeats become an array,
///   so every field is effectively one-or-many
/// - attributes are merged into the element's mapping and win on name
///   collision with a child element
pub fn parse_fragment(markup: &str) -> Result<Value> {
    let wrapped = format!("<wrapper>{}</wrapper>", escape_stray_specials(markup));

    let mut reader = Reader::from_str(&wrapped);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut stack = vec![Frame::new("wrapper".into(), Vec::new())];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                let attrs = read_attrs(&e);
                stack.push(Frame::new(name, attrs));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                let frame = Frame::new(name, read_attrs(&e));
                let parent = stack.last_mut().unwrap();
                merge_child(&mut parent.children, frame.name.clone(), frame.finish());
            }
            Ok(Event::Text(e)) => {
                let chunk = match e.unescape() {
                    Ok(c) => c.into_owned(),
                    // Bad entity in a text body; keep the raw bytes as-is.
                    Err(_) => String::from_utf8_lossy(&e).into_owned(),
                };
                stack.last_mut().unwrap().text.push_str(&chunk);
            }
            Ok(Event::CData(e)) => {
                let raw = String::from_utf8_lossy(&e.into_inner()).into_owned();
                stack.last_mut().unwrap().text.push_str(&raw);
            }
            Ok(Event::End(_)) if stack.len() > 1 => {
                let frame = stack.pop().unwrap();
                let parent = stack.last_mut().unwrap();
                merge_child(&mut parent.children, frame.name.clone(), frame.finish());
            }
            // Unmatched closing tag at the root; ignore.
            Ok(Event::End(_)) => {}
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("markup cannot be tokenized: {e}"),
        }
    }

    // Implicitly close anything left open at EOF.
    while stack.len() > 1 {
        let frame = stack.pop().unwrap();
        let parent = stack.last_mut().unwrap();
        merge_child(&mut parent.children, frame.name.clone(), frame.finish());
    }

    // The tokenizer saw the synthetic <wrapper> element too, so the page
    // content sits one level down. Unwrap it so records carry the page
    // fields at top level.
    let mut root = stack.pop().unwrap().finish();
    if let Value::Object(map) = &mut root {
        if let Some(inner) = map.remove("wrapper") {
            return Ok(inner);
        }
    }
    Ok(root)
}

struct Frame {
    name: String,
    attrs: Vec<(String, Value)>,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn new(name: String, attrs: Vec<(String, Value)>) -> Self {
        Frame {
            name,
            attrs,
            children: Map::new(),
            text: String::new(),
        }
    }

    fn finish(self) -> Value {
        let text = self.text.trim().to_string();

        // Text-only elements collapse to a bare scalar.
        if self.children.is_empty() && self.attrs.is_empty() {
            return coerce(text);
        }

        let mut map = self.children;
        if !text.is_empty() {
            map.insert("text".into(), coerce(text));
        }
        for (key, value) in self.attrs {
            map.insert(key, value);
        }
        Value::Object(map)
    }
}

fn read_attrs(e: &quick_xml::events::BytesStart) -> Vec<(String, Value)> {
    let mut attrs = Vec::new();
    for attr in e.attributes().with_checks(false) {
        let Ok(attr) = attr else { continue };
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
        let value = match attr.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        attrs.push((key, coerce(value)));
    }
    attrs
}

/// First occurrence of a key inserts a scalar; repeats promote it to an array.
fn merge_child(map: &mut Map<String, Value>, name: String, value: Value) {
    match map.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = std::mem::take(existing);
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(name, value);
        }
    }
}

fn coerce(text: String) -> Value {
    match text.as_str() {
        "yes" => Value::Bool(true),
        "no" => Value::Bool(false),
        _ => Value::String(text),
    }
}

/// Escape `&` and `<` that clearly are not markup so the tokenizer survives
/// the wiki's unescaped free text.
fn escape_stray_specials(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for (i, ch) in input.char_indices() {
        match ch {
            '&' if !is_entity_start(&input[i..]) => out.push_str("&amp;"),
            '<' if !is_tag_start(&input[i..]) => out.push_str("&lt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn is_entity_start(s: &str) -> bool {
    let rest = &s[1..];
    let Some(semi) = rest.find(';') else { return false };
    if semi == 0 || semi > 10 {
        return false;
    }
    let body = &rest[..semi];
    if let Some(num) = body.strip_prefix('#') {
        !num.is_empty()
            && num
                .trim_start_matches(['x', 'X'])
                .chars()
                .all(|c| c.is_ascii_hexdigit())
    } else {
        body.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

fn is_tag_start(s: &str) -> bool {
    matches!(
        s[1..].chars().next(),
        Some(c) if c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?')
    )
}
