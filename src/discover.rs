use std::fmt;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::fetch::WikiClient;

/// Sidebar section holding the API catalog. Everything outside it (articles,
/// tutorials) is ignored.
const SECTION_LABEL: &str = "Developer Reference";

// Marker classes the wiki puts on catalog anchors.
const MARK_FUNCTION: &str = "f";
const MARK_ENUM: &str = "e";
const MARK_SERVER: &str = "rs";
const MARK_CLIENT: &str = "rc";
const MARK_MENU: &str = "rm";

static SECTION_HEADER_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#sidebar #contents .sectionheader").unwrap());

/// Execution context a function or enum is available in. No realm tags on an
/// entity means it is shared/unscoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realm {
    Server,
    Client,
    Menu,
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Realm::Server => "Server",
            Realm::Client => "Client",
            Realm::Menu => "Menu",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Function,
    Enum,
    Other,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Function => "Function",
            EntityKind::Enum => "Enum",
            EntityKind::Other => "Other",
        })
    }
}

/// One catalog entry found on the index page.
#[derive(Debug, Clone)]
pub struct DiscoveredEntity {
    pub name: String,
    pub link: String,
    pub kind: EntityKind,
    pub realms: Vec<Realm>,
}

/// Fetch the index page and enumerate every documented function and enum.
/// The full list is materialized up front so the harvest pass can report
/// progress against a known total.
pub async fn discover(client: &WikiClient) -> Result<Vec<DiscoveredEntity>> {
    let html = client.fetch_index().await?;
    walk_contents(&html)
}

/// Walk the sidebar disclosure tree: category (`details.level1`) → optional
/// sub-category (`details.level2`) → entry anchors. Flat categories like
/// Globals keep their entries one level up, so both shapes are handled per
/// list item.
pub fn walk_contents(html: &str) -> Result<Vec<DiscoveredEntity>> {
    let doc = Html::parse_document(html);

    let header = doc
        .select(&SECTION_HEADER_SEL)
        .find(|el| el.text().collect::<String>().trim() == SECTION_LABEL)
        .with_context(|| format!("Index page has no \"{SECTION_LABEL}\" section header"))?;

    let section = header
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .filter(|el| has_class(el, "section"))
        .context("Index page layout changed: section header not followed by a .section node")?;

    let mut entities = Vec::new();

    for level1 in child_elements(section).filter(|el| has_class(el, "level1")) {
        debug!("Walking category {:?}", category_label(level1));

        for item in list_items(level1) {
            match child_elements(item).find(|el| has_class(el, "level2")) {
                Some(level2) => {
                    for leaf in list_items(level2) {
                        if let Some(entity) = classify_item(leaf)? {
                            entities.push(entity);
                        }
                    }
                }
                None => {
                    if let Some(entity) = classify_item(item)? {
                        entities.push(entity);
                    }
                }
            }
        }
    }

    info!("Discovered {} entities", entities.len());
    Ok(entities)
}

/// Classify one leaf list item. Anchors without a function/enum marker are
/// not catalog entries (category links, articles) and are skipped; a marked
/// anchor missing its text or href means the source schema drifted and the
/// whole run cannot be trusted.
fn classify_item(item: ElementRef) -> Result<Option<DiscoveredEntity>> {
    let Some(anchor) = child_elements(item).find(|el| el.value().name() == "a") else {
        return Ok(None);
    };

    let kind = match classify_anchor(&anchor) {
        EntityKind::Other => return Ok(None),
        kind => kind,
    };

    let name = own_text(anchor);
    if name.is_empty() {
        bail!("Catalog entry has no display text (linked to {:?})", anchor.value().attr("href"));
    }

    let link = match anchor.value().attr("href") {
        Some(href) if !href.is_empty() => href.to_string(),
        _ => bail!("Catalog entry \"{name}\" has no link"),
    };

    let realms = [
        (MARK_SERVER, Realm::Server),
        (MARK_CLIENT, Realm::Client),
        (MARK_MENU, Realm::Menu),
    ]
    .into_iter()
    .filter(|(mark, _)| has_class(&anchor, mark))
    .map(|(_, realm)| realm)
    .collect();

    Ok(Some(DiscoveredEntity { name, link, kind, realms }))
}

fn classify_anchor(anchor: &ElementRef) -> EntityKind {
    if has_class(anchor, MARK_FUNCTION) {
        EntityKind::Function
    } else if has_class(anchor, MARK_ENUM) {
        EntityKind::Enum
    } else {
        EntityKind::Other
    }
}

fn has_class(el: &ElementRef, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    el.children().filter_map(ElementRef::wrap)
}

/// Entries live under `<details> → <ul> → <li>`.
fn list_items<'a>(details: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    child_elements(details)
        .filter(|el| el.value().name() == "ul")
        .flat_map(|ul| child_elements(ul))
        .filter(|el| el.value().name() == "li")
}

/// Direct text of the element only, children excluded. Anchors carry realm
/// icons as child elements whose text must not leak into the name.
fn own_text(el: ElementRef) -> String {
    el.children()
        .filter_map(|node| node.value().as_text())
        .map(|text| &**text)
        .collect::<String>()
        .trim()
        .to_string()
}

fn category_label(level1: ElementRef) -> String {
    child_elements(level1)
        .find(|el| el.value().name() == "summary")
        .and_then(|summary| child_elements(summary).find(|el| el.value().name() == "div"))
        .map(own_text)
        .unwrap_or_default()
}
