use std::sync::LazyLock;

use regex::Regex;

static PAGE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<page(?:\s[^>]*)?>(.*?)</page>").unwrap());

/// Clean raw wiki markup so it can be wrapped in a synthetic root element and
/// handed to the lenient parser. Always returns a string; never fails.
///
/// Two known quirks of the wiki source are neutralized here:
/// - CRLF line endings (pages are served with `\r\n`)
/// - inline `<page>...</page>` cross-reference tags inside free text, which
///   would otherwise parse as nested elements; they are flattened to their
///   inner text
pub fn normalize(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n");
    PAGE_TAG_RE.replace_all(&unified, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_to_lf() {
        assert_eq!(normalize("a\r\nb\r\nc"), "a\nb\nc");
    }

    #[test]
    fn page_tag_flattened() {
        let out = normalize("See <page>Global.print</page> for details.");
        assert_eq!(out, "See Global.print for details.");
    }

    #[test]
    fn page_tag_with_attributes() {
        let out = normalize(r#"Use <page text="print">Global.print</page> here."#);
        assert_eq!(out, "Use Global.print here.");
    }

    #[test]
    fn multiple_page_tags() {
        let out = normalize("<page>A</page> and <page>B</page>");
        assert_eq!(out, "A and B");
    }

    #[test]
    fn multiline_page_tag() {
        let out = normalize("<page>Global\r\n.print</page>");
        assert_eq!(out, "Global\n.print");
    }

    #[test]
    fn empty_input() {
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn structural_tags_untouched() {
        let markup = "<function name=\"Add\">\n<description>adds</description>\n</function>";
        assert_eq!(normalize(markup), markup);
    }
}
