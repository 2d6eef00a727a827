//! Page ordering strategies.
//!
//! The page list can be sorted by policies other than document order —
//! for example, deskew offers "largest deviation first" so the pages most
//! likely to need manual attention surface at the top. Metric strategies
//! read their numbers straight from a stage's settings store, so the
//! ordering reflects whatever processing has computed so far.
//!
//! Every strategy is a strict weak ordering: irreflexive, asymmetric,
//! transitive, with ties broken by natural document order so re-sorting
//! never shuffles the list.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::ids::PageId;
use crate::stages::{content, deskew, margins};

/// Comparator over `(page, incomplete)` pairs.
///
/// `incomplete` marks pages that do not yet have validated output;
/// metric strategies treat them as having no metric.
pub trait PageOrder {
    /// Whether page `a` sorts before page `b`.
    fn precedes(&self, a: &PageId, a_incomplete: bool, b: &PageId, b_incomplete: bool) -> bool;
}

/// One selectable ordering with its display label.
#[derive(Clone)]
pub struct OrderOption {
    label: &'static str,
    order: Arc<dyn PageOrder + Send + Sync>,
}

impl OrderOption {
    /// Bundle a strategy with its label.
    #[must_use]
    pub fn new(label: &'static str, order: Arc<dyn PageOrder + Send + Sync>) -> Self {
        Self { label, order }
    }

    /// Display label for the option.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// The strategy itself.
    #[must_use]
    pub fn order(&self) -> &Arc<dyn PageOrder + Send + Sync> {
        &self.order
    }
}

/// Sort pages with a strategy, leaving equivalent pages in natural order.
pub fn sort_pages(order: &dyn PageOrder, pages: &mut [(PageId, bool)]) {
    pages.sort_by(|(a, a_inc), (b, b_inc)| {
        if order.precedes(a, *a_inc, b, *b_inc) {
            Ordering::Less
        } else if order.precedes(b, *b_inc, a, *a_inc) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });
}

/// Natural document order: source path, frame, then left before right.
pub struct NaturalOrder;

impl PageOrder for NaturalOrder {
    fn precedes(&self, a: &PageId, _a_incomplete: bool, b: &PageId, _b_incomplete: bool) -> bool {
        a < b
    }
}

/// Shared scaffolding for metric strategies: descending by metric, pages
/// without a metric last, ties by natural order.
fn metric_precedes(
    a: &PageId,
    metric_a: Option<f64>,
    b: &PageId,
    metric_b: Option<f64>,
) -> bool {
    match (metric_a, metric_b) {
        (Some(x), Some(y)) => match x.total_cmp(&y) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => a < b,
        },
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => a < b,
    }
}

/// Largest absolute skew angle first.
pub struct OrderByDeviation {
    settings: Arc<deskew::Settings>,
}

impl OrderByDeviation {
    /// Order by the deskew store's stored angles.
    #[must_use]
    pub const fn new(settings: Arc<deskew::Settings>) -> Self {
        Self { settings }
    }

    fn metric(&self, page: &PageId, incomplete: bool) -> Option<f64> {
        if incomplete {
            return None;
        }
        self.settings
            .get(page)
            .map(|params| params.angle_degrees().abs())
    }
}

impl PageOrder for OrderByDeviation {
    fn precedes(&self, a: &PageId, a_incomplete: bool, b: &PageId, b_incomplete: bool) -> bool {
        metric_precedes(
            a,
            self.metric(a, a_incomplete),
            b,
            self.metric(b, b_incomplete),
        )
    }
}

/// Tallest output frame first.
pub struct OrderByHeight {
    content: Arc<content::Settings>,
    margins: Arc<margins::Settings>,
}

impl OrderByHeight {
    /// Order by content height plus vertical margins.
    #[must_use]
    pub const fn new(content: Arc<content::Settings>, margins: Arc<margins::Settings>) -> Self {
        Self { content, margins }
    }

    fn metric(&self, page: &PageId, incomplete: bool) -> Option<f64> {
        if incomplete {
            return None;
        }
        let content_height = self.content.get(page)?.content_box().height;
        let margin_height = self
            .margins
            .get(page)
            .map_or(0, |params| params.margins().vertical());
        Some(f64::from(content_height + margin_height))
    }
}

impl PageOrder for OrderByHeight {
    fn precedes(&self, a: &PageId, a_incomplete: bool, b: &PageId, b_incomplete: bool) -> bool {
        metric_precedes(
            a,
            self.metric(a, a_incomplete),
            b,
            self.metric(b, b_incomplete),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::defaults::DefaultBundles;
    use crate::geometry::{Rect, Rotation};
    use crate::ids::{ImageId, SubPage};
    use crate::stages::DetectionMode;

    fn page(name: &str) -> PageId {
        PageId::new(ImageId::new(format!("{name}.png"), 0), SubPage::Single)
    }

    fn deskew_store_with_angles(angles: &[(&str, f64)]) -> Arc<deskew::Settings> {
        let stage = deskew::Stage::new(&DefaultBundles::default());
        let deps = deskew::Dependencies::new(Rotation::Deg0, Rect::new(0, 0, 10, 10));
        for (name, angle) in angles {
            stage.settings().set(
                page(name),
                deskew::Params::new(*angle, DetectionMode::Auto, deps),
            );
        }
        stage.settings()
    }

    /// Check the strict-weak-ordering axioms over every pair and triple.
    fn assert_strict_weak_ordering(order: &dyn PageOrder, pages: &[(PageId, bool)]) {
        for (a, a_inc) in pages {
            assert!(!order.precedes(a, *a_inc, a, *a_inc), "irreflexive");
            for (b, b_inc) in pages {
                if order.precedes(a, *a_inc, b, *b_inc) {
                    assert!(!order.precedes(b, *b_inc, a, *a_inc), "asymmetric");
                }
                for (c, c_inc) in pages {
                    if order.precedes(a, *a_inc, b, *b_inc)
                        && order.precedes(b, *b_inc, c, *c_inc)
                    {
                        assert!(order.precedes(a, *a_inc, c, *c_inc), "transitive");
                    }
                }
            }
        }
    }

    /// Sort, then verify no adjacent pair violates the order.
    fn assert_sorted_consistently(order: &dyn PageOrder, pages: &mut [(PageId, bool)]) {
        sort_pages(order, pages);
        for window in pages.windows(2) {
            let (ref b, b_inc) = window[1];
            let (ref a, a_inc) = window[0];
            assert!(!order.precedes(b, b_inc, a, a_inc), "sort produced a cycle");
        }
    }

    #[test]
    fn natural_order_follows_page_ids() {
        let order = NaturalOrder;
        assert!(order.precedes(&page("a"), false, &page("b"), false));
        assert!(!order.precedes(&page("b"), false, &page("a"), false));
        assert!(!order.precedes(&page("a"), false, &page("a"), false));
    }

    #[test]
    fn deviation_orders_descending_with_missing_last() {
        let settings = deskew_store_with_angles(&[("a", 0.5), ("b", -3.0), ("c", 1.0)]);
        let order = OrderByDeviation::new(settings);

        // "d" has no stored params at all.
        let mut pages = vec![
            (page("a"), false),
            (page("b"), false),
            (page("c"), false),
            (page("d"), false),
        ];
        sort_pages(&order, &mut pages);
        let names: Vec<_> = pages.iter().map(|(p, _)| p.image_id().path().to_path_buf()).collect();
        assert_eq!(
            names,
            ["b.png", "c.png", "a.png", "d.png"].map(std::path::PathBuf::from),
        );
    }

    #[test]
    fn incomplete_pages_sort_as_unmetered() {
        let settings = deskew_store_with_angles(&[("a", 2.0), ("b", 1.0)]);
        let order = OrderByDeviation::new(settings);
        // "a" is incomplete, so its metric is ignored.
        assert!(order.precedes(&page("b"), false, &page("a"), true));
    }

    #[test]
    fn equal_metrics_fall_back_to_natural_order() {
        let settings = deskew_store_with_angles(&[("x", 1.0), ("y", 1.0)]);
        let order = OrderByDeviation::new(settings);
        assert!(order.precedes(&page("x"), false, &page("y"), false));
        assert!(!order.precedes(&page("y"), false, &page("x"), false));
    }

    #[test]
    fn deviation_order_is_a_strict_weak_ordering() {
        let settings = deskew_store_with_angles(&[("a", 0.5), ("b", -3.0), ("c", 0.5)]);
        let order = OrderByDeviation::new(settings);
        let mut pages = vec![
            (page("a"), false),
            (page("b"), false),
            (page("c"), true),
            (page("d"), false),
            (page("e"), true),
        ];
        assert_strict_weak_ordering(&order, &pages);
        assert_sorted_consistently(&order, &mut pages);
    }

    #[test]
    fn height_order_reads_content_and_margins() {
        let content_stage = content::Stage::new(&DefaultBundles::default());
        let margins_stage = margins::Stage::new(&DefaultBundles::default());
        let content_deps = content::Dependencies::new(Rect::new(0, 0, 100, 100), 0.0);

        // "short" has taller margins but much shorter content.
        content_stage.settings().set(
            page("tall"),
            content::Params::new(Rect::new(0, 0, 50, 90), DetectionMode::Auto, content_deps),
        );
        content_stage.settings().set(
            page("short"),
            content::Params::new(Rect::new(0, 0, 50, 20), DetectionMode::Auto, content_deps),
        );
        margins_stage.settings().set(
            page("short"),
            margins::Params::new(
                crate::geometry::Margins::uniform(10),
                crate::geometry::Alignment::default(),
                margins::Dependencies::new(Rect::new(0, 0, 50, 20)),
            ),
        );

        let order = OrderByHeight::new(content_stage.settings(), margins_stage.settings());
        assert!(order.precedes(&page("tall"), false, &page("short"), false));
    }
}
