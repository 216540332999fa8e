//! Public interface of the favicon database
//!
//! This file defines the collaborator traits the embedder supplies and the
//! shared value types of the public API. It acts as the source of truth for
//! the contract between the core and its host.

use std::time::Duration;

use image::RgbaImage;

use crate::database::DatabaseResult;
use crate::sync::ImportSession;

/// Whether the embedder should fetch an icon from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDecision {
    /// No usable cached bytes, or the cached bytes passed the expiration
    /// horizon. Fetch.
    Yes,
    /// Cached bytes (or a definitive negative result) within the horizon.
    No,
    /// The on-disk row for this icon has not been read yet. The caller is
    /// recorded as interested and notified when the import resolves.
    Unknown,
}

/// Callbacks the core dispatches to the embedder.
///
/// All notification methods are invoked through the [`UiDispatcher`], so they
/// arrive on the embedder's UI thread. `performing_import_should_stop` is the
/// exception: it is polled directly from the sync thread between import rows.
pub trait IconDatabaseClient: Send + Sync {
    /// A previously-unknown icon became known (Yes or No resolved) for a page
    /// the embedder was loading.
    fn did_add_icon_for_page(&self, _page_url: &str) {}

    /// Icon bytes for a page became available in memory.
    fn did_import_icon_data_for_page(&self, _page_url: &str) {}

    /// `remove_all_icons` finished truncating the on-disk store.
    fn did_remove_all_icons(&self) {}

    /// Polled during imports; returning true requests an early return.
    fn performing_import_should_stop(&self) -> bool {
        false
    }
}

/// Client that ignores every notification.
pub struct NullClient;

impl IconDatabaseClient for NullClient {}

/// One-shot "post to the UI thread" primitive supplied by the embedder.
///
/// The core never calls the client directly from the sync thread; every
/// notification closure goes through here.
pub trait UiDispatcher: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// Dispatcher that runs tasks on the calling thread. Suitable for embedders
/// without a message loop and for tests; notifications then arrive on
/// whichever thread produced them.
pub struct InlineDispatcher;

impl UiDispatcher for InlineDispatcher {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Image decoding collaborator. Given raw icon bytes and a size request,
/// produces a bitmap suitable for display, or None if the bytes do not
/// decode.
pub trait IconDecoder: Send + Sync {
    fn decode(&self, data: &[u8], size: (u32, u32)) -> Option<RgbaImage>;
}

/// Opt-in migration of an older on-disk icon format.
///
/// Runs once per database on the sync thread, before the main loop starts.
/// The imported flag is only set when `import` returns Ok, so a failed run
/// is retried on the next open. Deployments without legacy data simply leave
/// the importer unset and the flag is written at open.
pub trait LegacyImporter: Send {
    fn import(&mut self, session: &mut ImportSession<'_>) -> DatabaseResult<()>;
}

/// Configuration options, fixed at handle construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Gate on all writes. Disabling behaves as a read-only freeze.
    pub enabled: bool,
    /// Gate on writes; reads of in-memory data are unchanged.
    pub private_browsing: bool,
    /// Run an integrity check as the first action of the sync thread; on
    /// failure the store is truncated and recreated.
    pub integrity_check_before_open: bool,
    /// Age above which cached icon bytes force a re-fetch decision.
    pub expiration_horizon: Duration,
    /// Delay between the first dirtying event and the write burst that
    /// flushes it. Later events within the window do not extend it.
    pub sync_coalesce_window: Duration,
    /// Upper bound on how long the sync thread sleeps with no work queued.
    pub sync_idle_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            private_browsing: false,
            integrity_check_before_open: false,
            expiration_horizon: Duration::from_secs(60 * 60 * 24 * 4),
            sync_coalesce_window: Duration::from_secs(3),
            sync_idle_period: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert!(config.enabled);
        assert!(!config.private_browsing);
        assert!(!config.integrity_check_before_open);
        assert_eq!(config.expiration_horizon, Duration::from_secs(345_600));
        assert_eq!(config.sync_coalesce_window, Duration::from_secs(3));
    }

    #[test]
    fn null_client_never_requests_stop() {
        assert!(!NullClient.performing_import_should_stop());
    }

    #[test]
    fn inline_dispatcher_runs_task() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        InlineDispatcher.post(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
