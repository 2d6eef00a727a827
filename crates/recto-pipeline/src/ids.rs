//! Stable identities for scans and the logical pages they host.
//!
//! An [`ImageId`] names one frame of one source file; a [`PageId`] names a
//! logical page derived from that frame. A single wide scan can host two
//! pages (left and right), so the mapping from images to pages is 1:N, but
//! a page is never duplicated under two ids.
//!
//! Both ids are ordered so that sorting a page list by `PageId` yields
//! natural document order: source path, then frame, then left-before-right.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::geometry::Dimensions;

/// Identity of one frame within one source file.
///
/// Most scans are single-frame files (`frame == 0`). Multi-frame sources
/// (e.g. TIFF stacks) assign one `ImageId` per frame; splitting such files
/// apart happens at import time, outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId {
    path: PathBuf,
    frame: u32,
}

impl ImageId {
    /// Identify `frame` of the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, frame: u32) -> Self {
        Self {
            path: path.into(),
            frame,
        }
    }

    /// The source file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Zero-based frame index within the source file.
    #[must_use]
    pub const fn frame(&self) -> u32 {
        self.frame
    }

    /// Return a copy of this id pointing at a relocated source file.
    #[must_use]
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            frame: self.frame,
        }
    }
}

/// Which logical page of a scan a [`PageId`] refers to.
///
/// Declaration order defines natural document order for two-page scans:
/// the left page precedes the right page.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum SubPage {
    /// The scan hosts exactly one page.
    #[default]
    Single,
    /// Left page of a two-page scan.
    Left,
    /// Right page of a two-page scan.
    Right,
}

impl SubPage {
    /// Stable tag used in the project document.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    /// Inverse of [`tag`](Self::tag). Returns `None` for unknown tags.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "single" => Some(Self::Single),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Identity of one logical page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    image: ImageId,
    sub_page: SubPage,
}

impl PageId {
    /// A page hosted by `image`.
    #[must_use]
    pub const fn new(image: ImageId, sub_page: SubPage) -> Self {
        Self { image, sub_page }
    }

    /// The single page of a one-page scan.
    #[must_use]
    pub const fn single(image: ImageId) -> Self {
        Self::new(image, SubPage::Single)
    }

    /// The backing image identity.
    #[must_use]
    pub const fn image_id(&self) -> &ImageId {
        &self.image
    }

    /// Which page of the backing scan this is.
    #[must_use]
    pub const fn sub_page(&self) -> SubPage {
        self.sub_page
    }
}

/// Everything the pipeline knows about a page without opening its source
/// file: identity, source frame dimensions, and a content fingerprint.
///
/// Validity chains work from `PageInfo` alone, which is what keeps cache
/// scans cheap — no image decode is ever needed to answer "is this page
/// stale".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    id: PageId,
    source_size: Dimensions,
    source_fingerprint: u64,
}

impl PageInfo {
    /// Describe a page whose source frame has the given size and
    /// fingerprint (see [`source_fingerprint`]).
    #[must_use]
    pub const fn new(id: PageId, source_size: Dimensions, source_fingerprint: u64) -> Self {
        Self {
            id,
            source_size,
            source_fingerprint,
        }
    }

    /// The page identity.
    #[must_use]
    pub const fn id(&self) -> &PageId {
        &self.id
    }

    /// Pixel dimensions of the source frame, before any correction.
    #[must_use]
    pub const fn source_size(&self) -> Dimensions {
        self.source_size
    }

    /// Fingerprint of the source file content.
    #[must_use]
    pub const fn source_fingerprint(&self) -> u64 {
        self.source_fingerprint
    }
}

/// Maps old image identities to new ones after source files move.
///
/// Returning `None` for an identity means the file is gone; stored
/// settings for its pages are dropped as if the pages were removed.
pub trait Relinker {
    /// The new identity for `image`, or `None` if it no longer exists.
    fn reassign(&self, image: &ImageId) -> Option<ImageId>;
}

/// A relinker that keeps every identity unchanged.
pub struct IdentityRelinker;

impl Relinker for IdentityRelinker {
    fn reassign(&self, image: &ImageId) -> Option<ImageId> {
        Some(image.clone())
    }
}

/// Fingerprint source file bytes for change detection.
///
/// Stored inside orientation [`Dependencies`](crate::stages::orientation::Dependencies)
/// so that replacing a scan file on disk invalidates every stage for its
/// pages, even when the new file happens to have the same dimensions.
#[must_use]
pub fn source_fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytes);
    hasher.finish()
}
