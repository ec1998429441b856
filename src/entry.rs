//! Site entries and their rank.
//!
//! An entry is one tracked URL plus the metadata payload supplied by the
//! caller (title, redirect chain, thumbnail). The store never interprets
//! the payload; it only orders entries by their [`Rank`].

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Integer rank used on the wire for a forced (pinned) entry.
pub const RANK_OF_FORCED_URL: i64 = -1;

/// Integer rank reported for a URL the store does not know.
///
/// Never a valid input to [`RankRequest`].
pub const RANK_OF_NON_EXISTING_URL: i64 = -2;

/// Where an entry sits in the listing.
///
/// Forced entries always precede organic ones. Forced entries are ordered by
/// pin time, organic entries by a dense rank starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rank {
    /// Pinned by a caller at `since`.
    Forced {
        /// When the entry was pinned.
        since: DateTime<Utc>,
    },
    /// Organically ranked; 0 is the most visited.
    Organic(u32),
}

impl Rank {
    /// Returns true for pinned entries.
    #[must_use]
    pub const fn is_forced(&self) -> bool {
        matches!(self, Self::Forced { .. })
    }

    /// Returns the organic rank, if any.
    #[must_use]
    pub const fn organic(&self) -> Option<u32> {
        match self {
            Self::Organic(rank) => Some(*rank),
            Self::Forced { .. } => None,
        }
    }

    /// Returns the pin time, if any.
    #[must_use]
    pub fn forced_since(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Forced { since } => Some(*since),
            Self::Organic(_) => None,
        }
    }

    /// The integer form stored in the `url_rank` column.
    #[must_use]
    pub fn as_column(&self) -> i64 {
        match self {
            Self::Forced { .. } => RANK_OF_FORCED_URL,
            Self::Organic(rank) => i64::from(*rank),
        }
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Forced { since: a }, Self::Forced { since: b }) => a.cmp(b),
            (Self::Forced { .. }, Self::Organic(_)) => Ordering::Less,
            (Self::Organic(_), Self::Forced { .. }) => Ordering::Greater,
            (Self::Organic(a), Self::Organic(b)) => a.cmp(b),
        }
    }
}

/// A caller's requested placement for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankRequest {
    /// Pin the entry.
    ///
    /// `at` is the pin time. When `None`, an already pinned entry keeps its
    /// pin time and a newly pinned one is pinned now.
    Forced {
        /// Pin time carried with the request.
        at: Option<DateTime<Utc>>,
    },
    /// Place the entry at this position among organic entries.
    ///
    /// Out-of-range positions are clamped to the end.
    Organic(usize),
}

impl RankRequest {
    /// Pin at a specific time.
    #[must_use]
    pub const fn forced_at(at: DateTime<Utc>) -> Self {
        Self::Forced { at: Some(at) }
    }

    /// Pin, keeping any existing pin time.
    #[must_use]
    pub const fn forced() -> Self {
        Self::Forced { at: None }
    }

    /// Append after every organic entry.
    #[must_use]
    pub const fn last() -> Self {
        Self::Organic(usize::MAX)
    }
}

/// Capture quality of a thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailScore {
    /// How "boring" the captured page looked, 0.0 to 1.0.
    pub boring_score: f64,
    /// Whether the capture was clipped to a good aspect ratio.
    pub good_clipping: bool,
    /// Whether the page was scrolled to the top when captured.
    pub at_top: bool,
    /// Whether the page had finished loading.
    pub load_completed: bool,
    /// When the capture was taken (`last_updated`).
    pub time_at_snapshot: DateTime<Utc>,
}

impl Default for ThumbnailScore {
    fn default() -> Self {
        Self {
            boring_score: 1.0,
            good_clipping: false,
            at_top: false,
            load_completed: false,
            time_at_snapshot: DateTime::<Utc>::default(),
        }
    }
}

/// Thumbnail bytes and their capture metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    /// Encoded image bytes; opaque to the store.
    pub data: Vec<u8>,
    /// Capture metadata.
    pub score: ThumbnailScore,
}

/// Caller-supplied payload stored alongside a URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadata {
    /// Page title.
    pub title: String,
    /// Redirect chain that led to the URL, oldest first.
    pub redirects: Vec<String>,
    /// Page thumbnail.
    pub thumbnail: Thumbnail,
}

impl SiteMetadata {
    /// Metadata with only a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// One tracked URL.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteEntry {
    /// Unique key.
    pub url: String,
    /// Current placement.
    pub rank: Rank,
    /// Opaque payload.
    pub metadata: SiteMetadata,
}

impl SiteEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(url: impl Into<String>, rank: Rank, metadata: SiteMetadata) -> Self {
        Self {
            url: url.into(),
            rank,
            metadata,
        }
    }

    /// Pin time for forced entries.
    #[must_use]
    pub fn forced_time(&self) -> Option<DateTime<Utc>> {
        self.rank.forced_since()
    }

    /// Listing order: rank first, URL as tie-breaker.
    #[must_use]
    pub fn listing_cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.url.cmp(&other.url))
    }
}
