//! In-memory record graph value types
//!
//! `IconRecord` and `PageRecord` live inside the url-and-icon lock and are
//! only ever touched by value snapshots from the sync thread. Back-references
//! are kept by URL, not by pointer, so the page/icon cycle is a plain pair of
//! maps with no collection concerns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::RgbaImage;

/// State of an icon's image payload.
///
/// Pending means no attempt has resolved the bytes yet (they may still exist
/// on disk); Missing is a definitive negative recorded either by a disk read
/// that found nothing or by the embedder handing in null bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconPayload {
    Pending,
    Missing,
    Data(Arc<Vec<u8>>),
}

impl IconPayload {
    /// True once the payload has been resolved either way.
    pub fn is_known(&self) -> bool {
        !matches!(self, IconPayload::Pending)
    }

    pub fn bytes(&self) -> Option<&Arc<Vec<u8>>> {
        match self {
            IconPayload::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// One icon, identified by the absolute URL it was (or would be) fetched
/// from.
#[derive(Debug, Clone)]
pub struct IconRecord {
    pub icon_url: String,
    pub payload: IconPayload,
    /// Seconds since epoch of the last successful fetch; 0 = never fetched.
    pub timestamp: i64,
    /// Page URLs currently associated with this icon. Maintained by the
    /// record store under the url-and-icon lock.
    pub retaining_page_urls: HashSet<String>,
    /// At most one decoded image per requested size. A cached None records a
    /// decode failure so it is not re-attempted until new bytes arrive.
    decoded: HashMap<(u32, u32), Option<Arc<RgbaImage>>>,
}

impl IconRecord {
    pub fn new(icon_url: &str) -> Self {
        Self {
            icon_url: icon_url.to_string(),
            payload: IconPayload::Pending,
            timestamp: 0,
            retaining_page_urls: HashSet::new(),
            decoded: HashMap::new(),
        }
    }

    /// Store freshly fetched bytes (or a definitive negative) and stamp them.
    pub fn set_image_data(&mut self, data: Option<Arc<Vec<u8>>>, timestamp: i64) {
        self.payload = match data {
            Some(data) => IconPayload::Data(data),
            None => IconPayload::Missing,
        };
        self.timestamp = timestamp;
        self.decoded.clear();
    }

    /// Resolve the payload from a disk read. The stamp is left alone; it was
    /// populated by the URL import.
    pub fn set_payload_from_disk(&mut self, data: Option<Vec<u8>>) {
        self.payload = match data {
            Some(data) => IconPayload::Data(Arc::new(data)),
            None => IconPayload::Missing,
        };
        self.decoded.clear();
    }

    pub fn has_image_data(&self) -> bool {
        matches!(self.payload, IconPayload::Data(_))
    }

    /// Cache lookup for a decoded image. Outer None = never attempted for
    /// this size; inner None = attempted and failed.
    pub fn cached_image(&self, size: (u32, u32)) -> Option<Option<Arc<RgbaImage>>> {
        self.decoded.get(&size).cloned()
    }

    pub fn cache_image(&mut self, size: (u32, u32), image: Option<Arc<RgbaImage>>) {
        self.decoded.insert(size, image);
    }

    /// Value copy for the sync thread to persist.
    pub fn snapshot(&self) -> IconSnapshot {
        IconSnapshot::Update {
            icon_url: self.icon_url.clone(),
            timestamp: self.timestamp,
            data: self.payload.bytes().cloned(),
        }
    }
}

/// One page URL known to the database.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub page_url: String,
    pub icon_url: Option<String>,
    /// Mirror of the retention multiset entry for this page.
    pub retain_count: u32,
}

impl PageRecord {
    pub fn new(page_url: &str) -> Self {
        Self {
            page_url: page_url.to_string(),
            icon_url: None,
            retain_count: 0,
        }
    }
}

/// Icon state handed to the sync thread. `Update` with data None persists a
/// "no icon known" row, overwriting any existing bytes; `Delete` is the
/// tombstone for an orphaned icon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconSnapshot {
    Update {
        icon_url: String,
        timestamp: i64,
        data: Option<Arc<Vec<u8>>>,
    },
    Delete {
        icon_url: String,
    },
}

impl IconSnapshot {
    pub fn icon_url(&self) -> &str {
        match self {
            IconSnapshot::Update { icon_url, .. } | IconSnapshot::Delete { icon_url } => icon_url,
        }
    }
}

/// Page state handed to the sync thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSnapshot {
    Update { page_url: String, icon_url: String },
    Delete { page_url: String },
}

impl PageSnapshot {
    pub fn page_url(&self) -> &str {
        match self {
            PageSnapshot::Update { page_url, .. } | PageSnapshot::Delete { page_url } => page_url,
        }
    }
}
