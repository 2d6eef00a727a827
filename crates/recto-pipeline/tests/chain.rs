//! End-to-end chain scenarios: cache validity, idempotence, cancellation,
//! persistence round trips, and relinking.

#![allow(clippy::unwrap_used)]

use image::{Rgba, RgbaImage};
use recto_pipeline::stages::{orientation, split};
use recto_pipeline::{
    CancellationToken, DefaultBundles, Dimensions, ImageId, PageId, PageInfo, PagePayload,
    Presentation, ProjectIndex, Relinker, Rotation, StageKind, Stages, SubPage, Validity,
};

/// A white portrait page with a black content block at (20, 20)..(60, 60).
fn block_page() -> RgbaImage {
    RgbaImage::from_fn(100, 100, |x, y| {
        if (20..60).contains(&x) && (20..60).contains(&y) {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

fn info_for(name: &str, fingerprint: u64) -> PageInfo {
    let id = PageId::new(ImageId::new(format!("{name}.png"), 0), SubPage::Single);
    PageInfo::new(id, Dimensions::new(100, 100), fingerprint)
}

/// Run a full processing chain for the page and return its outcome image,
/// if any.
fn process(stages: &Stages, info: &PageInfo, token: &CancellationToken) -> Option<RgbaImage> {
    let chain = stages.processing_chain(info.id(), StageKind::Output, true, false);
    let outcome = chain.execute(token, PagePayload::new(info.clone(), block_page()));
    let command = outcome.command()?;
    match command.presentation() {
        Presentation::Page { image, .. } => Some(image.clone()),
        Presentation::Failure(_) => None,
    }
}

fn store_sizes(stages: &Stages) -> [usize; 6] {
    [
        stages.orientation().settings().len(),
        stages.split().settings().len(),
        stages.deskew().settings().len(),
        stages.content().settings().len(),
        stages.margins().settings().len(),
        stages.output().settings().len(),
    ]
}

#[test]
fn full_chain_populates_every_store_and_validates() {
    let stages = Stages::new(&DefaultBundles::default());
    let info = info_for("page", 1);
    assert_eq!(stages.check_validity(&info), Validity::Missing);

    let image = process(&stages, &info, &CancellationToken::new()).unwrap();
    assert_eq!(store_sizes(&stages), [1, 1, 1, 1, 1, 1]);
    assert_eq!(stages.check_validity(&info), Validity::Valid);

    // Default margins (20px) frame the 40x40 block as an 80x80 page.
    assert_eq!(image.width(), 80);
    assert_eq!(image.height(), 80);
}

#[test]
fn reprocessing_a_valid_page_changes_nothing() {
    let stages = Stages::new(&DefaultBundles::default());
    let info = info_for("page", 1);
    let token = CancellationToken::new();

    let first = process(&stages, &info, &token).unwrap();
    let deskew_before = stages.deskew().settings().get(info.id()).unwrap();
    let content_before = stages.content().settings().get(info.id()).unwrap();

    let second = process(&stages, &info, &token).unwrap();
    assert_eq!(first.as_raw(), second.as_raw(), "output must be bit-identical");
    assert_eq!(stages.deskew().settings().get(info.id()).unwrap(), deskew_before);
    assert_eq!(
        stages.content().settings().get(info.id()).unwrap(),
        content_before,
    );
}

#[test]
fn upstream_edit_invalidates_then_reprocessing_revalidates() {
    let stages = Stages::new(&DefaultBundles::default());
    let info = info_for("page", 1);
    let token = CancellationToken::new();
    process(&stages, &info, &token).unwrap();
    assert_eq!(stages.check_validity(&info), Validity::Valid);

    // The user rotates the scan. Orientation itself is still valid, but
    // everything downstream was computed against the old rotation.
    stages.orientation().settings().set(
        info.id().image_id().clone(),
        orientation::Params::new(Rotation::Deg90, orientation::Dependencies::for_page(&info)),
    );
    assert_eq!(stages.check_validity(&info), Validity::Invalid);

    process(&stages, &info, &token).unwrap();
    assert_eq!(stages.check_validity(&info), Validity::Valid);
}

#[test]
fn source_replacement_invalidates_the_page() {
    let stages = Stages::new(&DefaultBundles::default());
    let original = info_for("page", 1);
    process(&stages, &original, &CancellationToken::new()).unwrap();

    let replaced = info_for("page", 2);
    assert_eq!(stages.check_validity(&replaced), Validity::Invalid);
}

#[test]
fn cancellation_before_later_stages_leaves_their_stores_untouched() {
    let stages = Stages::new(&DefaultBundles::default());
    let info = info_for("page", 1);

    // Run only the first two stages so their stores have entries.
    let short_chain = stages.processing_chain(info.id(), StageKind::Split, true, false);
    let outcome = short_chain.execute(
        &CancellationToken::new(),
        PagePayload::new(info.clone(), block_page()),
    );
    assert!(outcome.command().is_some());
    assert_eq!(store_sizes(&stages), [1, 1, 0, 0, 0, 0]);
    let orientation_before = stages
        .orientation()
        .settings()
        .get(info.id().image_id())
        .unwrap();

    // Cancellation observed at the first stage boundary of a full run:
    // no result, stages 3+ never write, stages 1-2 keep what they wrote.
    let token = CancellationToken::new();
    token.cancel();
    let full_chain = stages.processing_chain(info.id(), StageKind::Output, true, false);
    let outcome = full_chain.execute(&token, PagePayload::new(info.clone(), block_page()));
    assert!(outcome.command().is_none());
    assert_eq!(store_sizes(&stages), [1, 1, 0, 0, 0, 0]);
    assert_eq!(
        stages
            .orientation()
            .settings()
            .get(info.id().image_id())
            .unwrap(),
        orientation_before,
    );
}

#[test]
fn project_round_trip_reproduces_every_store() {
    let stages = Stages::new(&DefaultBundles::default());
    let token = CancellationToken::new();
    let infos: Vec<PageInfo> = (0..3u64).map(|i| info_for(&format!("page{i}"), i + 1)).collect();
    for info in &infos {
        process(&stages, info, &token).unwrap();
    }

    let index = ProjectIndex::new(infos.iter().map(|i| i.id().clone()).collect());
    let document = stages.save_project(&index);

    // Round-trip the document through its serialized form, as a real
    // project save/load would.
    let json = serde_json::to_string(&document).unwrap();
    let document: recto_pipeline::Element = serde_json::from_str(&json).unwrap();

    let restored = Stages::new(&DefaultBundles::default());
    restored.load_project(&index, &document);

    for info in &infos {
        assert_eq!(restored.check_validity(info), Validity::Valid);
        assert_eq!(
            restored.deskew().settings().get(info.id()),
            stages.deskew().settings().get(info.id()),
        );
        assert_eq!(
            restored.output().settings().get(info.id()),
            stages.output().settings().get(info.id()),
        );
    }
    assert_eq!(store_sizes(&restored), store_sizes(&stages));
}

#[test]
fn unresolvable_entries_are_skipped_individually() {
    let stages = Stages::new(&DefaultBundles::default());
    let token = CancellationToken::new();
    let infos: Vec<PageInfo> = (0..3u64).map(|i| info_for(&format!("page{i}"), i + 1)).collect();
    for info in &infos {
        process(&stages, info, &token).unwrap();
    }

    let index = ProjectIndex::new(infos.iter().map(|i| i.id().clone()).collect());
    let mut document = stages.save_project(&index);

    // Corrupt the deskew section: one entry gets an id the reader cannot
    // resolve, another a malformed id.
    let deskew_el = document
        .children
        .iter_mut()
        .find(|el| el.name == "deskew")
        .unwrap();
    deskew_el.children[0].set_attr("id", 99);
    deskew_el.children[1].set_attr("id", "three");

    let restored = Stages::new(&DefaultBundles::default());
    restored.load_project(&index, &document);
    assert_eq!(restored.deskew().settings().len(), 1);
    // The other stages were untouched by the corruption.
    assert_eq!(restored.output().settings().len(), 3);
}

#[test]
fn relinking_moves_settings_and_drops_missing_files() {
    struct MoveOrDrop;
    impl Relinker for MoveOrDrop {
        fn reassign(&self, image: &ImageId) -> Option<ImageId> {
            let path = image.path().to_string_lossy().into_owned();
            path.strip_prefix("old/")
                .map(|rest| image.with_path(format!("new/{rest}")))
        }
    }

    let stages = Stages::new(&DefaultBundles::default());
    let token = CancellationToken::new();
    let moved = PageInfo::new(
        PageId::single(ImageId::new("old/kept.png", 0)),
        Dimensions::new(100, 100),
        1,
    );
    let dropped = PageInfo::new(
        PageId::single(ImageId::new("elsewhere/gone.png", 0)),
        Dimensions::new(100, 100),
        2,
    );
    process(&stages, &moved, &token).unwrap();
    process(&stages, &dropped, &token).unwrap();

    stages.perform_relinking(&MoveOrDrop);

    let relinked = PageInfo::new(
        PageId::single(ImageId::new("new/kept.png", 0)),
        Dimensions::new(100, 100),
        1,
    );
    assert_eq!(stages.check_validity(&relinked), Validity::Valid);
    assert_eq!(stages.check_validity(&dropped), Validity::Missing);
    assert_eq!(store_sizes(&stages), [1, 1, 1, 1, 1, 1]);
}

#[test]
fn split_pages_share_scan_scoped_settings() {
    let stages = Stages::new(&DefaultBundles::default());
    let token = CancellationToken::new();
    let scan = ImageId::new("spread.png", 0);
    let left = PageInfo::new(
        PageId::new(scan.clone(), SubPage::Left),
        Dimensions::new(100, 100),
        7,
    );
    let right = PageInfo::new(
        PageId::new(scan.clone(), SubPage::Right),
        Dimensions::new(100, 100),
        7,
    );

    // Force a two-page layout; the portrait test image would otherwise
    // detect as a single page.
    stages.split().settings().set(
        scan.clone(),
        split::Params::new(
            split::Layout::two_pages(50),
            split::Dependencies::new(Rotation::Deg0, Dimensions::new(100, 100)),
        ),
    );

    process(&stages, &left, &token).unwrap();
    process(&stages, &right, &token).unwrap();

    // One orientation/split entry for the scan, two entries per
    // page-scoped stage.
    assert_eq!(store_sizes(&stages), [1, 1, 2, 2, 2, 2]);
    assert_eq!(stages.check_validity(&left), Validity::Valid);
    assert_eq!(stages.check_validity(&right), Validity::Valid);
}

#[test]
fn load_defaults_only_fills_gaps() {
    let stages = Stages::new(&DefaultBundles::default());
    let info = info_for("page", 1);
    process(&stages, &info, &CancellationToken::new()).unwrap();
    let before = stages.deskew().settings().get(info.id()).unwrap();

    stages.load_default_params(&info);
    assert_eq!(stages.deskew().settings().get(info.id()).unwrap(), before);
    assert_eq!(stages.check_validity(&info), Validity::Valid);

    // A brand-new page gets placeholder params that demand recomputation.
    let fresh = info_for("fresh", 9);
    stages.load_default_params(&fresh);
    assert_eq!(stages.check_validity(&fresh), Validity::Invalid);
}
