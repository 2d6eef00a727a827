//! Project-document persistence.
//!
//! Stage settings are serialized into a generic structured-document model:
//! a tree of named [`Element`]s with string attributes. The whole tree
//! round-trips through serde, so the on-disk project file is ordinary
//! JSON, while stages read and write elements with typed attribute
//! extraction and named-child lookup.
//!
//! Loading is tolerant by design: a malformed numeric id, an id the
//! reader cannot resolve, or a params element missing a field skips that
//! one entry and continues with the rest. A stale or hand-edited project
//! file loses individual pages, never the whole document.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geometry::{
    Alignment, HorizontalAlignment, Margins, Rect, Rotation, VerticalAlignment,
};
use crate::ids::{ImageId, PageId};

/// One node of the structured settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    /// Element name, e.g. `"deskew"` or `"page"`.
    pub name: String,
    /// String attributes. A `BTreeMap` keeps serialized output stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    /// Child elements, in document order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    /// An element with the given name and no attributes or children.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Set a string attribute from anything displayable.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Display) {
        self.attrs.insert(key.into(), value.to_string());
    }

    /// The raw attribute value, if present.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Parse an attribute into `T`. Returns `None` when the attribute is
    /// absent or does not parse — callers skip such entries.
    #[must_use]
    pub fn parse_attr<T: FromStr>(&self, key: &str) -> Option<T> {
        self.attr(key)?.parse().ok()
    }

    /// The first child with the given name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Append a child element.
    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }
}

/// Writer-side persistence boundary: enumerates the project's pages and
/// images together with the numeric ids they are stored under.
pub trait PageEnumerator {
    /// Call `f` once per page with its resolved numeric id.
    fn for_each_page(&self, f: &mut dyn FnMut(&PageId, i32));

    /// Call `f` once per image with its resolved numeric id.
    fn for_each_image(&self, f: &mut dyn FnMut(&ImageId, i32));
}

/// Reader-side persistence boundary: resolves numeric ids back to
/// identities. `None` marks an unresolvable id; callers skip the entry.
pub trait IdResolver {
    /// The page stored under `numeric`, if any.
    fn page_id(&self, numeric: i32) -> Option<PageId>;

    /// The image stored under `numeric`, if any.
    fn image_id(&self, numeric: i32) -> Option<ImageId>;
}

/// Concrete id table over a fixed page list.
///
/// Numeric page ids are positions in the page list; image ids are
/// positions in the deduplicated image list derived from it. Used by the
/// CLI and by tests; an interactive shell would supply its own table.
#[derive(Debug, Clone, Default)]
pub struct ProjectIndex {
    pages: Vec<PageId>,
    images: Vec<ImageId>,
}

impl ProjectIndex {
    /// Build an index over `pages`, deriving the image list from them.
    #[must_use]
    pub fn new(pages: Vec<PageId>) -> Self {
        let mut images: Vec<ImageId> = Vec::new();
        for page in &pages {
            if !images.contains(page.image_id()) {
                images.push(page.image_id().clone());
            }
        }
        Self { pages, images }
    }

    /// The indexed pages, in document order.
    #[must_use]
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }
}

impl PageEnumerator for ProjectIndex {
    fn for_each_page(&self, f: &mut dyn FnMut(&PageId, i32)) {
        for (idx, page) in self.pages.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            f(page, idx as i32);
        }
    }

    fn for_each_image(&self, f: &mut dyn FnMut(&ImageId, i32)) {
        for (idx, image) in self.images.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            f(image, idx as i32);
        }
    }
}

impl IdResolver for ProjectIndex {
    fn page_id(&self, numeric: i32) -> Option<PageId> {
        usize::try_from(numeric)
            .ok()
            .and_then(|idx| self.pages.get(idx).cloned())
    }

    fn image_id(&self, numeric: i32) -> Option<ImageId> {
        usize::try_from(numeric)
            .ok()
            .and_then(|idx| self.images.get(idx).cloned())
    }
}

// ── Geometry <-> element helpers ─────────────────────────────────────

/// Serialize a rectangle as an element with x/y/width/height attributes.
#[must_use]
pub(crate) fn rect_element(name: &str, rect: Rect) -> Element {
    let mut el = Element::new(name);
    el.set_attr("x", rect.x);
    el.set_attr("y", rect.y);
    el.set_attr("width", rect.width);
    el.set_attr("height", rect.height);
    el
}

/// Inverse of [`rect_element`].
#[must_use]
pub(crate) fn rect_from_element(el: &Element) -> Option<Rect> {
    Some(Rect::new(
        el.parse_attr("x")?,
        el.parse_attr("y")?,
        el.parse_attr("width")?,
        el.parse_attr("height")?,
    ))
}

/// Serialize margins as an element with one attribute per side.
#[must_use]
pub(crate) fn margins_element(name: &str, margins: Margins) -> Element {
    let mut el = Element::new(name);
    el.set_attr("top", margins.top);
    el.set_attr("right", margins.right);
    el.set_attr("bottom", margins.bottom);
    el.set_attr("left", margins.left);
    el
}

/// Inverse of [`margins_element`].
#[must_use]
pub(crate) fn margins_from_element(el: &Element) -> Option<Margins> {
    Some(Margins {
        top: el.parse_attr("top")?,
        right: el.parse_attr("right")?,
        bottom: el.parse_attr("bottom")?,
        left: el.parse_attr("left")?,
    })
}

/// Serialize an alignment as an element with horizontal/vertical tags.
#[must_use]
pub(crate) fn alignment_element(name: &str, alignment: Alignment) -> Element {
    let mut el = Element::new(name);
    el.set_attr(
        "horizontal",
        match alignment.horizontal {
            HorizontalAlignment::Left => "left",
            HorizontalAlignment::Center => "center",
            HorizontalAlignment::Right => "right",
        },
    );
    el.set_attr(
        "vertical",
        match alignment.vertical {
            VerticalAlignment::Top => "top",
            VerticalAlignment::Center => "center",
            VerticalAlignment::Bottom => "bottom",
        },
    );
    el
}

/// Inverse of [`alignment_element`].
#[must_use]
pub(crate) fn alignment_from_element(el: &Element) -> Option<Alignment> {
    let horizontal = match el.attr("horizontal")? {
        "left" => HorizontalAlignment::Left,
        "center" => HorizontalAlignment::Center,
        "right" => HorizontalAlignment::Right,
        _ => return None,
    };
    let vertical = match el.attr("vertical")? {
        "top" => VerticalAlignment::Top,
        "center" => VerticalAlignment::Center,
        "bottom" => VerticalAlignment::Bottom,
        _ => return None,
    };
    Some(Alignment {
        horizontal,
        vertical,
    })
}

/// Parse a quarter-turn rotation attribute written as degrees.
#[must_use]
pub(crate) fn rotation_from_attr(el: &Element, key: &str) -> Option<Rotation> {
    Rotation::from_degrees(el.parse_attr(key)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ids::SubPage;

    #[test]
    fn typed_attr_parsing_handles_garbage() {
        let mut el = Element::new("page");
        el.set_attr("id", 7);
        el.set_attr("angle", "not-a-number");
        assert_eq!(el.parse_attr::<i32>("id"), Some(7));
        assert_eq!(el.parse_attr::<f64>("angle"), None);
        assert_eq!(el.parse_attr::<i32>("missing"), None);
    }

    #[test]
    fn named_child_lookup() {
        let mut root = Element::new("stages");
        root.push(Element::new("deskew"));
        root.push(Element::new("page"));
        root.push(Element::new("page"));
        assert!(root.child("deskew").is_some());
        assert!(root.child("output").is_none());
        assert_eq!(root.children_named("page").count(), 2);
    }

    #[test]
    fn element_serde_round_trip() {
        let mut el = Element::new("content");
        el.set_attr("mode", "auto");
        el.push(rect_element("rect", Rect::new(1, 2, 3, 4)));

        let json = serde_json::to_string(&el).unwrap();
        let back: Element = serde_json::from_str(&json).unwrap();
        assert_eq!(el, back);
    }

    #[test]
    fn rect_element_round_trip() {
        let rect = Rect::new(10, 20, 300, 400);
        assert_eq!(rect_from_element(&rect_element("r", rect)), Some(rect));
    }

    #[test]
    fn rect_from_element_rejects_partial_data() {
        let mut el = Element::new("r");
        el.set_attr("x", 1);
        el.set_attr("y", 2);
        assert_eq!(rect_from_element(&el), None);
    }

    #[test]
    fn margins_and_alignment_round_trip() {
        let margins = Margins {
            top: 1,
            right: 2,
            bottom: 3,
            left: 4,
        };
        assert_eq!(
            margins_from_element(&margins_element("m", margins)),
            Some(margins),
        );

        let alignment = Alignment {
            horizontal: HorizontalAlignment::Right,
            vertical: VerticalAlignment::Top,
        };
        assert_eq!(
            alignment_from_element(&alignment_element("a", alignment)),
            Some(alignment),
        );
    }

    #[test]
    fn project_index_resolves_both_directions() {
        let left = PageId::new(ImageId::new("spread.png", 0), SubPage::Left);
        let right = PageId::new(ImageId::new("spread.png", 0), SubPage::Right);
        let single = PageId::single(ImageId::new("single.png", 0));
        let index = ProjectIndex::new(vec![left.clone(), right.clone(), single.clone()]);

        // Three pages but only two distinct images.
        let mut pages = Vec::new();
        index.for_each_page(&mut |page, id| pages.push((page.clone(), id)));
        assert_eq!(pages.len(), 3);
        let mut images = Vec::new();
        index.for_each_image(&mut |image, id| images.push((image.clone(), id)));
        assert_eq!(images.len(), 2);

        assert_eq!(index.page_id(2), Some(single));
        assert_eq!(index.page_id(99), None);
        assert_eq!(index.page_id(-1), None);
        assert_eq!(index.image_id(0), Some(left.image_id().clone()));
    }
}
