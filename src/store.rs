//! IconDatabase - the public favicon store
//!
//! Two actors share the state in here: the embedder's UI thread, which calls
//! the public API and never touches disk, and one sync thread (`sync.rs`)
//! that owns the SQLite connection. All cross-thread traffic goes through
//! value snapshots in the pending queues.
//!
//! Lock acquisition order, outermost first:
//!   1. url_and_icon   - icon map, page map, retention multiset
//!   2. pending_sync   - page/icon snapshots awaiting writeback
//!   3. pending_reading - import and read queues
//!   4. sync_control   - db path and wakeup state, monitor of sync_condition
//!   5. remove_lock    - monitor of remove_condition
//! A thread may only acquire locks in increasing order.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Utc;
use image::RgbaImage;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::decoder::{generate_default_icon, ImageCrateDecoder};
use crate::interface::{
    Config, IconDatabaseClient, IconDecoder, InlineDispatcher, LegacyImporter, LoadDecision,
    NullClient, UiDispatcher,
};
use crate::models::{IconRecord, IconSnapshot, PageRecord, PageSnapshot};

pub(crate) fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Everything guarded by the url-and-icon lock.
#[derive(Default)]
pub(crate) struct UrlAndIconState {
    pub icons: HashMap<String, IconRecord>,
    pub pages: HashMap<String, PageRecord>,
    /// Retention multiset: page URL -> retain count. Absence means 0.
    pub retained_pages: HashMap<String, u32>,
    /// Per-size cache of the default icon. Lives here, not in the icon map,
    /// so it can never end up in a pending queue.
    pub default_icons: HashMap<(u32, u32), Arc<RgbaImage>>,
}

/// The UI actor's outbox: state the sync thread should persist next.
#[derive(Default)]
pub(crate) struct PendingSync {
    pub pages: HashMap<String, PageSnapshot>,
    pub icons: HashMap<String, IconSnapshot>,
}

/// The UI actor's inbox requests: imports and byte reads the sync thread
/// still owes us.
#[derive(Default)]
pub(crate) struct PendingReading {
    pub pages_pending_import: HashSet<String>,
    pub pages_interested_in_icons: HashSet<String>,
    pub icons_pending_read: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct SyncControl {
    pub db_directory: Option<PathBuf>,
    /// Armed by the first dirtying event; later events do not extend it.
    pub wake_deadline: Option<Instant>,
    pub wake_requested: bool,
}

pub(crate) struct Shared {
    pub url_and_icon: Mutex<UrlAndIconState>,
    pub pending_sync: Mutex<PendingSync>,
    pub pending_reading: Mutex<PendingReading>,
    pub sync_control: Mutex<SyncControl>,
    pub sync_condition: Condvar,
    pub remove_lock: Mutex<()>,
    pub remove_condition: Condvar,

    pub enabled: AtomicBool,
    pub private_browsing: AtomicBool,
    pub thread_termination_requested: AtomicBool,
    pub remove_icons_requested: AtomicBool,
    pub icon_url_import_complete: AtomicBool,
    pub integrity_check_before_open: AtomicBool,
    pub cleanup_suspend_count: AtomicUsize,

    pub config: Config,
    pub client: Mutex<Arc<dyn IconDatabaseClient>>,
    pub dispatcher: Mutex<Arc<dyn UiDispatcher>>,
    pub decoder: Mutex<Arc<dyn IconDecoder>>,
    pub importer: Mutex<Option<Box<dyn LegacyImporter>>>,
}

impl Shared {
    pub(crate) fn client(&self) -> Arc<dyn IconDatabaseClient> {
        Arc::clone(&self.client.lock())
    }

    pub(crate) fn dispatcher(&self) -> Arc<dyn UiDispatcher> {
        Arc::clone(&self.dispatcher.lock())
    }

    pub(crate) fn decoder(&self) -> Arc<dyn IconDecoder> {
        Arc::clone(&self.decoder.lock())
    }

    pub(crate) fn writes_allowed(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.private_browsing.load(Ordering::SeqCst)
    }

    /// Arm the coalesced write wakeup. The deadline is only set by the first
    /// dirtying event of a burst.
    pub(crate) fn schedule_sync(&self) {
        let mut control = self.sync_control.lock();
        if control.wake_deadline.is_none() {
            control.wake_deadline = Some(Instant::now() + self.config.sync_coalesce_window);
            self.sync_condition.notify_one();
        }
    }

    /// Wake the sync thread now, skipping the coalesce window.
    pub(crate) fn wake_sync_thread(&self) {
        let mut control = self.sync_control.lock();
        control.wake_requested = true;
        self.sync_condition.notify_one();
    }

    /// Caller holds `url_and_icon`. Creates the record if absent and, while
    /// the URL import has not completed, registers it for a disk read so its
    /// payload gets resolved.
    pub(crate) fn get_or_create_icon<'a>(
        &self,
        state: &'a mut UrlAndIconState,
        icon_url: &str,
    ) -> &'a mut IconRecord {
        match state.icons.entry(icon_url.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !self.icon_url_import_complete.load(Ordering::SeqCst) {
                    self.pending_reading
                        .lock()
                        .icons_pending_read
                        .insert(icon_url.to_string());
                }
                entry.insert(IconRecord::new(icon_url))
            }
        }
    }

    /// Caller holds `url_and_icon`. A page created before the URL import
    /// completes is queued for import so its icon mapping gets resolved.
    pub(crate) fn get_or_create_page<'a>(
        &self,
        state: &'a mut UrlAndIconState,
        page_url: &str,
    ) -> &'a mut PageRecord {
        match state.pages.entry(page_url.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !self.icon_url_import_complete.load(Ordering::SeqCst) {
                    self.pending_reading
                        .lock()
                        .pages_pending_import
                        .insert(page_url.to_string());
                }
                entry.insert(PageRecord::new(page_url))
            }
        }
    }

    /// Caller holds `url_and_icon`. Detaches the page from its previous icon
    /// and attaches it to the new one. An orphaned previous icon is dropped
    /// and, when `enqueue` is set, tombstoned for deletion; the new
    /// association is queued for writeback.
    pub(crate) fn associate(
        &self,
        state: &mut UrlAndIconState,
        page_url: &str,
        icon_url: &str,
        enqueue: bool,
    ) {
        let previous = {
            let page = self.get_or_create_page(state, page_url);
            if page.icon_url.as_deref() == Some(icon_url) {
                return;
            }
            page.icon_url.replace(icon_url.to_string())
        };

        if let Some(previous_url) = previous {
            let orphaned = match state.icons.get_mut(&previous_url) {
                Some(previous_icon) => {
                    previous_icon.retaining_page_urls.remove(page_url);
                    previous_icon.retaining_page_urls.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.release_icon_if_unreferenced(state, &previous_url, enqueue);
            }
        }

        self.get_or_create_icon(state, icon_url)
            .retaining_page_urls
            .insert(page_url.to_string());

        if enqueue {
            self.pending_sync.lock().pages.insert(
                page_url.to_string(),
                PageSnapshot::Update {
                    page_url: page_url.to_string(),
                    icon_url: icon_url.to_string(),
                },
            );
            self.schedule_sync();
        }
    }

    /// Caller holds `url_and_icon`. Association performed by the sync thread
    /// while importing: never dirties the pending queues and never registers
    /// reads, since the rows just came off disk.
    pub(crate) fn associate_imported(
        &self,
        state: &mut UrlAndIconState,
        page_url: &str,
        icon_url: &str,
        stamp: i64,
    ) {
        let previous = {
            let page = state
                .pages
                .entry(page_url.to_string())
                .or_insert_with(|| PageRecord::new(page_url));
            if let Some(count) = state.retained_pages.get(page_url) {
                page.retain_count = *count;
            }
            page.icon_url.replace(icon_url.to_string())
        };
        if let Some(previous_url) = previous {
            if previous_url != icon_url {
                if let Some(previous_icon) = state.icons.get_mut(&previous_url) {
                    previous_icon.retaining_page_urls.remove(page_url);
                }
            }
        }
        let icon = state
            .icons
            .entry(icon_url.to_string())
            .or_insert_with(|| IconRecord::new(icon_url));
        if icon.timestamp == 0 {
            icon.timestamp = stamp;
        }
        icon.retaining_page_urls.insert(page_url.to_string());
    }

    /// Caller holds `url_and_icon`. Drops an icon whose back-reference set
    /// emptied out, enqueueing a deletion tombstone when writes are allowed.
    pub(crate) fn release_icon_if_unreferenced(
        &self,
        state: &mut UrlAndIconState,
        icon_url: &str,
        enqueue: bool,
    ) {
        let unreferenced = state
            .icons
            .get(icon_url)
            .map_or(false, |icon| icon.retaining_page_urls.is_empty());
        if !unreferenced {
            return;
        }
        state.icons.remove(icon_url);
        if enqueue {
            self.pending_sync.lock().icons.insert(
                icon_url.to_string(),
                IconSnapshot::Delete {
                    icon_url: icon_url.to_string(),
                },
            );
        }
        self.pending_reading
            .lock()
            .icons_pending_read
            .remove(icon_url);
        if enqueue {
            self.schedule_sync();
        }
    }
}

/// Persistent, embedder-owned favicon database handle.
///
/// Each handle is independent; tests construct several side by side. The
/// default icon lives inside the handle and survives `close()`.
pub struct IconDatabase {
    shared: Arc<Shared>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl IconDatabase {
    pub fn new(config: Config) -> Self {
        let shared = Arc::new(Shared {
            url_and_icon: Mutex::new(UrlAndIconState::default()),
            pending_sync: Mutex::new(PendingSync::default()),
            pending_reading: Mutex::new(PendingReading::default()),
            sync_control: Mutex::new(SyncControl::default()),
            sync_condition: Condvar::new(),
            remove_lock: Mutex::new(()),
            remove_condition: Condvar::new(),
            enabled: AtomicBool::new(config.enabled),
            private_browsing: AtomicBool::new(config.private_browsing),
            thread_termination_requested: AtomicBool::new(false),
            remove_icons_requested: AtomicBool::new(false),
            icon_url_import_complete: AtomicBool::new(false),
            integrity_check_before_open: AtomicBool::new(config.integrity_check_before_open),
            cleanup_suspend_count: AtomicUsize::new(0),
            config,
            client: Mutex::new(Arc::new(NullClient) as Arc<dyn IconDatabaseClient>),
            dispatcher: Mutex::new(Arc::new(InlineDispatcher) as Arc<dyn UiDispatcher>),
            decoder: Mutex::new(Arc::new(ImageCrateDecoder) as Arc<dyn IconDecoder>),
            importer: Mutex::new(None),
        });
        Self {
            shared,
            sync_thread: Mutex::new(None),
        }
    }

    /// Stable name of the database file inside the configured directory.
    pub fn default_database_filename() -> &'static str {
        "WebpageIcons.db"
    }

    /// Install the embedder's callback sink. Call before `open`.
    pub fn set_client(&self, client: Arc<dyn IconDatabaseClient>) {
        *self.shared.client.lock() = client;
    }

    /// Install the post-to-UI primitive. Call before `open`.
    pub fn set_ui_dispatcher(&self, dispatcher: Arc<dyn UiDispatcher>) {
        *self.shared.dispatcher.lock() = dispatcher;
    }

    pub fn set_decoder(&self, decoder: Arc<dyn IconDecoder>) {
        *self.shared.decoder.lock() = decoder;
    }

    /// Install the legacy migration collaborator. Consumed by the next
    /// `open`; without one, the imported flag is written at open.
    pub fn set_legacy_importer(&self, importer: Box<dyn LegacyImporter>) {
        *self.shared.importer.lock() = Some(importer);
    }

    /// Request an integrity check as the first act of the next `open`.
    pub fn check_integrity_before_open(&self) {
        self.shared
            .integrity_check_before_open
            .store(true, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Open the database inside `directory`, starting the sync thread.
    /// Idempotent while open at the same path; fails if already open
    /// elsewhere. Returns true iff the path is usable.
    pub fn open(&self, directory: &Path) -> bool {
        if self.is_open() {
            let same = self.shared.sync_control.lock().db_directory.as_deref() == Some(directory);
            if !same {
                warn!(
                    "icon database already open at a different path, refusing {}",
                    directory.display()
                );
            }
            return same;
        }
        if directory.as_os_str().is_empty() {
            return false;
        }
        if let Err(err) = std::fs::create_dir_all(directory) {
            warn!(
                "could not create icon database directory {}: {}",
                directory.display(),
                err
            );
            return false;
        }

        {
            let mut control = self.shared.sync_control.lock();
            control.db_directory = Some(directory.to_path_buf());
            control.wake_deadline = None;
            control.wake_requested = false;
        }
        self.shared
            .thread_termination_requested
            .store(false, Ordering::SeqCst);
        self.shared
            .icon_url_import_complete
            .store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name("favicondb-sync".into())
            .spawn(move || crate::sync::run(shared))
        {
            Ok(handle) => {
                *self.sync_thread.lock() = Some(handle);
                true
            }
            Err(err) => {
                warn!("could not start icon database sync thread: {}", err);
                self.shared.sync_control.lock().db_directory = None;
                false
            }
        }
    }

    /// Ask the sync thread to drain and exit, join it, and clear the
    /// in-memory state. Safe to call when not open.
    pub fn close(&self) {
        let handle = self.sync_thread.lock().take();
        if let Some(handle) = handle {
            self.shared
                .thread_termination_requested
                .store(true, Ordering::SeqCst);
            self.shared.wake_sync_thread();
            if handle.join().is_err() {
                warn!("icon database sync thread panicked during shutdown");
            }
        }

        self.shared
            .thread_termination_requested
            .store(false, Ordering::SeqCst);
        self.shared
            .icon_url_import_complete
            .store(false, Ordering::SeqCst);
        self.shared
            .remove_icons_requested
            .store(false, Ordering::SeqCst);
        {
            let mut state = self.shared.url_and_icon.lock();
            state.icons.clear();
            state.pages.clear();
            state.retained_pages.clear();
            // default_icons survives: the placeholder has process lifetime
        }
        {
            let mut pending = self.shared.pending_sync.lock();
            pending.pages.clear();
            pending.icons.clear();
        }
        {
            let mut reading = self.shared.pending_reading.lock();
            reading.pages_pending_import.clear();
            reading.pages_interested_in_icons.clear();
            reading.icons_pending_read.clear();
        }
        {
            let mut control = self.shared.sync_control.lock();
            control.db_directory = None;
            control.wake_deadline = None;
            control.wake_requested = false;
        }
    }

    pub fn is_open(&self) -> bool {
        self.sync_thread.lock().is_some()
    }

    /// Full path of the database file, when open.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.shared
            .sync_control
            .lock()
            .db_directory
            .as_ref()
            .map(|dir| dir.join(Self::default_database_filename()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Write gates
    // ─────────────────────────────────────────────────────────────────────

    /// Disabling is a read-only freeze: nothing new is enqueued, pending
    /// writes still flush.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// While set, writes stay in the memory cache only.
    pub fn set_private_browsing(&self, enabled: bool) {
        self.shared.private_browsing.store(enabled, Ordering::SeqCst);
    }

    pub fn is_private_browsing(&self) -> bool {
        self.shared.private_browsing.load(Ordering::SeqCst)
    }

    /// Suppress pruning passes until the matching `allow_database_cleanup`.
    /// Reference-counted across callers.
    pub fn delay_database_cleanup(&self) {
        self.shared
            .cleanup_suspend_count
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn allow_database_cleanup(&self) {
        let previous = self
            .shared
            .cleanup_suspend_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(1) => self.shared.wake_sync_thread(),
            Ok(_) => {}
            Err(_) => warn!("allow_database_cleanup called without a matching delay"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────

    /// Decoded icon for the page at the requested size, or the default icon.
    /// An icon whose bytes are not in memory yet triggers an asynchronous
    /// disk read and yields the default icon meanwhile.
    pub fn icon_for_page(&self, page_url: &str, size: (u32, u32), cache: bool) -> Arc<RgbaImage> {
        if page_url.is_empty() || !self.is_open() {
            return self.default_icon(size);
        }
        let shared = &self.shared;
        let mut state = shared.url_and_icon.lock();

        let icon_url = {
            let page = shared.get_or_create_page(&mut state, page_url);
            page.icon_url.clone()
        };
        let Some(icon_url) = icon_url else {
            return Self::default_icon_locked(&mut state, size);
        };

        let pending = state
            .icons
            .get(&icon_url)
            .map_or(true, |icon| !icon.payload.is_known());
        if pending {
            shared.get_or_create_icon(&mut state, &icon_url);
            shared
                .pending_reading
                .lock()
                .icons_pending_read
                .insert(icon_url);
            let placeholder = Self::default_icon_locked(&mut state, size);
            drop(state);
            shared.wake_sync_thread();
            return placeholder;
        }

        let decoder = shared.decoder();
        let resolved: Option<Arc<RgbaImage>> = {
            match state.icons.get_mut(&icon_url) {
                None => None,
                Some(icon) => {
                    let bytes = icon.payload.bytes().cloned();
                    match bytes {
                        None => None,
                        Some(bytes) => match icon.cached_image(size) {
                            Some(cached) => cached,
                            None => {
                                let decoded = decoder.decode(&bytes, size).map(Arc::new);
                                if cache {
                                    icon.cache_image(size, decoded.clone());
                                }
                                decoded
                            }
                        },
                    }
                }
            }
        };
        resolved.unwrap_or_else(|| Self::default_icon_locked(&mut state, size))
    }

    /// The handle-scoped placeholder icon at the requested size.
    pub fn default_icon(&self, size: (u32, u32)) -> Arc<RgbaImage> {
        let mut state = self.shared.url_and_icon.lock();
        Self::default_icon_locked(&mut state, size)
    }

    fn default_icon_locked(state: &mut UrlAndIconState, size: (u32, u32)) -> Arc<RgbaImage> {
        Arc::clone(
            state
                .default_icons
                .entry(size)
                .or_insert_with(|| Arc::new(generate_default_icon(size))),
        )
    }

    /// Associated icon URL for the page, or empty when none is known. A page
    /// first seen before the URL import completes is queued for import.
    pub fn icon_url_for_page(&self, page_url: &str) -> String {
        if page_url.is_empty() || !self.is_open() {
            return String::new();
        }
        let shared = &self.shared;
        let mut state = shared.url_and_icon.lock();
        let page = shared.get_or_create_page(&mut state, page_url);
        page.icon_url.clone().unwrap_or_default()
    }

    /// Explicitly request the asynchronous byte read that `icon_for_page`
    /// would trigger.
    pub fn read_icon_for_page_from_disk(&self, page_url: &str) {
        if page_url.is_empty() || !self.is_open() {
            return;
        }
        let shared = &self.shared;
        let mut state = shared.url_and_icon.lock();
        let icon_url = {
            let page = shared.get_or_create_page(&mut state, page_url);
            page.icon_url.clone()
        };
        let Some(icon_url) = icon_url else { return };
        let pending = state
            .icons
            .get(&icon_url)
            .map_or(true, |icon| !icon.payload.is_known());
        if !pending {
            return;
        }
        shared.get_or_create_icon(&mut state, &icon_url);
        shared
            .pending_reading
            .lock()
            .icons_pending_read
            .insert(icon_url);
        drop(state);
        shared.wake_sync_thread();
    }

    /// Whether the embedder should fetch this icon. An `Unknown` decision
    /// records the loading page so it gets a `did_add_icon_for_page`
    /// callback once the import resolves.
    pub fn load_decision_for_icon_url(&self, icon_url: &str, page_url: &str) -> LoadDecision {
        if icon_url.is_empty() || !self.is_open() {
            return LoadDecision::Unknown;
        }
        let shared = &self.shared;
        {
            let state = shared.url_and_icon.lock();
            if let Some(icon) = state.icons.get(icon_url) {
                if icon.timestamp > 0 {
                    let age = now_epoch().saturating_sub(icon.timestamp);
                    let horizon = shared.config.expiration_horizon.as_secs() as i64;
                    return if age >= horizon {
                        LoadDecision::Yes
                    } else {
                        LoadDecision::No
                    };
                }
            }
        }
        // The import completion pass drains interest under this same lock,
        // so checking the flag inside it cannot lose a registration.
        let mut reading = shared.pending_reading.lock();
        if shared.icon_url_import_complete.load(Ordering::SeqCst) {
            return LoadDecision::Yes;
        }
        if !page_url.is_empty() {
            reading
                .pages_interested_in_icons
                .insert(page_url.to_string());
        }
        LoadDecision::Unknown
    }

    /// True iff the core holds either cached bytes or a definitive negative
    /// result for this icon URL.
    pub fn icon_data_known_for_icon_url(&self, icon_url: &str) -> bool {
        if icon_url.is_empty() || !self.is_open() {
            return false;
        }
        self.shared
            .url_and_icon
            .lock()
            .icons
            .get(icon_url)
            .map_or(false, |icon| icon.payload.is_known())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Increment the page's retain count, creating its record on first
    /// retain. Retained pages are protected from pruning.
    pub fn retain_page(&self, page_url: &str) {
        if page_url.is_empty() {
            return;
        }
        let shared = &self.shared;
        let mut state = shared.url_and_icon.lock();
        let count = {
            let entry = state.retained_pages.entry(page_url.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count == 1 {
            shared.get_or_create_page(&mut state, page_url).retain_count = 1;
        } else if let Some(page) = state.pages.get_mut(page_url) {
            page.retain_count = count;
        }
    }

    /// Decrement the page's retain count. At zero the record is dropped and
    /// its row (plus a newly orphaned icon) is scheduled for deletion.
    /// Releasing an unretained page is a logged no-op.
    pub fn release_page(&self, page_url: &str) {
        if page_url.is_empty() {
            return;
        }
        let shared = &self.shared;
        let mut state = shared.url_and_icon.lock();
        let Some(count) = state.retained_pages.get_mut(page_url) else {
            warn!("released page {} that was never retained", page_url);
            return;
        };
        *count -= 1;
        if *count > 0 {
            let count = *count;
            if let Some(page) = state.pages.get_mut(page_url) {
                page.retain_count = count;
            }
            return;
        }
        state.retained_pages.remove(page_url);

        let icon_url = state.pages.remove(page_url).and_then(|page| page.icon_url);
        let enqueue = shared.writes_allowed();
        if enqueue {
            shared.pending_sync.lock().pages.insert(
                page_url.to_string(),
                PageSnapshot::Delete {
                    page_url: page_url.to_string(),
                },
            );
        }
        if let Some(icon_url) = icon_url {
            let orphaned = state
                .icons
                .get_mut(&icon_url)
                .map(|icon| {
                    icon.retaining_page_urls.remove(page_url);
                    icon.retaining_page_urls.is_empty()
                })
                .unwrap_or(false);
            if orphaned {
                shared.release_icon_if_unreferenced(&mut state, &icon_url, enqueue);
            }
        }
        {
            let mut reading = shared.pending_reading.lock();
            reading.pages_pending_import.remove(page_url);
            reading.pages_interested_in_icons.remove(page_url);
        }
        if enqueue {
            shared.schedule_sync();
        }
    }

    /// Store freshly fetched icon bytes (None records a definitive "no
    /// icon"), stamp them now, queue the snapshot for writeback, and notify
    /// every page currently associated with this icon. In private browsing
    /// the bytes stay in the memory cache only.
    pub fn set_icon_data_for_icon_url(&self, data: Option<Vec<u8>>, icon_url: &str) {
        if icon_url.is_empty() || !self.is_open() {
            return;
        }
        let shared = &self.shared;
        let now = now_epoch();
        let data = data.map(Arc::new);

        let mut state = shared.url_and_icon.lock();
        let (snapshot, pages) = {
            let icon = shared.get_or_create_icon(&mut state, icon_url);
            icon.set_image_data(data, now);
            let pages: Vec<String> = icon.retaining_page_urls.iter().cloned().collect();
            (icon.snapshot(), pages)
        };
        let enqueue = shared.writes_allowed();
        if enqueue {
            shared
                .pending_sync
                .lock()
                .icons
                .insert(icon_url.to_string(), snapshot);
        }
        shared
            .pending_reading
            .lock()
            .icons_pending_read
            .remove(icon_url);
        drop(state);

        if enqueue {
            shared.schedule_sync();
        }

        let client = shared.client();
        let dispatcher = shared.dispatcher();
        for page_url in pages {
            let client = Arc::clone(&client);
            dispatcher.post(Box::new(move || {
                client.did_import_icon_data_for_page(&page_url)
            }));
        }
    }

    /// Associate the page with the icon URL. Empty URLs are rejected
    /// silently. In private browsing the mapping stays in memory only.
    pub fn set_icon_url_for_page(&self, icon_url: &str, page_url: &str) {
        if icon_url.is_empty() || page_url.is_empty() || !self.is_open() {
            return;
        }
        let shared = &self.shared;
        let mut state = shared.url_and_icon.lock();
        shared.associate(&mut state, page_url, icon_url, shared.writes_allowed());
    }

    /// Clear the in-memory state immediately, discard pending writes, and
    /// block until the sync thread has truncated the on-disk store. Pages
    /// the embedder still retains come back as empty records.
    pub fn remove_all_icons(&self) {
        if !self.is_open() {
            return;
        }
        let shared = &self.shared;
        {
            let mut state = shared.url_and_icon.lock();
            state.icons.clear();
            state.pages.clear();
            let retained: Vec<(String, u32)> = state
                .retained_pages
                .iter()
                .map(|(url, count)| (url.clone(), *count))
                .collect();
            for (page_url, count) in retained {
                let mut record = PageRecord::new(&page_url);
                record.retain_count = count;
                state.pages.insert(page_url, record);
            }
            let mut pending = shared.pending_sync.lock();
            pending.pages.clear();
            pending.icons.clear();
            drop(pending);
            let mut reading = shared.pending_reading.lock();
            reading.pages_pending_import.clear();
            reading.pages_interested_in_icons.clear();
            reading.icons_pending_read.clear();
        }

        shared.remove_icons_requested.store(true, Ordering::SeqCst);
        shared.wake_sync_thread();
        let mut guard = shared.remove_lock.lock();
        while shared.remove_icons_requested.load(Ordering::SeqCst) {
            shared.remove_condition.wait(&mut guard);
        }
        debug!("remove_all_icons finished truncating the on-disk store");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Statistics
    // ─────────────────────────────────────────────────────────────────────

    pub fn page_url_mapping_count(&self) -> usize {
        self.shared.url_and_icon.lock().pages.len()
    }

    pub fn retained_page_url_count(&self) -> usize {
        self.shared.url_and_icon.lock().retained_pages.len()
    }

    pub fn icon_record_count(&self) -> usize {
        self.shared.url_and_icon.lock().icons.len()
    }

    pub fn icon_record_count_with_data(&self) -> usize {
        self.shared
            .url_and_icon
            .lock()
            .icons
            .values()
            .filter(|icon| icon.has_image_data())
            .count()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Default for IconDatabase {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Drop for IconDatabase {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IconPayload;
    use image::Rgba;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    const PAGE: &str = "https://example.com/";
    const ICON: &str = "https://example.com/favicon.ico";

    fn test_config() -> Config {
        Config {
            sync_coalesce_window: Duration::from_millis(50),
            sync_idle_period: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn open_db() -> (IconDatabase, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = IconDatabase::new(test_config());
        assert!(db.open(dir.path()));
        (db, dir)
    }

    fn png_bytes(pixel: Rgba<u8>) -> Vec<u8> {
        let image = RgbaImage::from_pixel(16, 16, pixel);
        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn open_is_idempotent_on_same_path_only() {
        let (db, dir) = open_db();
        assert!(db.is_open());
        assert!(db.open(dir.path()));

        let other = TempDir::new().unwrap();
        assert!(!db.open(other.path()));

        assert_eq!(
            db.database_path().unwrap(),
            dir.path().join(IconDatabase::default_database_filename())
        );

        db.close();
        assert!(!db.is_open());
        assert!(db.open(other.path()));
    }

    #[test]
    fn close_when_not_open_is_safe() {
        let db = IconDatabase::new(test_config());
        db.close();
        db.close();
    }

    #[test]
    fn empty_urls_are_rejected_silently() {
        let (db, _dir) = open_db();
        db.retain_page("");
        db.release_page("");
        db.set_icon_url_for_page("", PAGE);
        db.set_icon_url_for_page(ICON, "");
        db.set_icon_data_for_icon_url(Some(vec![1]), "");
        assert_eq!(db.icon_url_for_page(""), "");
        assert_eq!(db.page_url_mapping_count(), 0);
        assert_eq!(db.icon_record_count(), 0);
        assert_eq!(db.retained_page_url_count(), 0);
    }

    #[test]
    fn retain_and_release_balance_out() {
        let (db, _dir) = open_db();
        db.retain_page(PAGE);
        db.retain_page(PAGE);
        assert_eq!(db.retained_page_url_count(), 1);
        assert_eq!(db.page_url_mapping_count(), 1);

        db.release_page(PAGE);
        assert_eq!(db.retained_page_url_count(), 1);
        db.release_page(PAGE);
        assert_eq!(db.retained_page_url_count(), 0);
        assert_eq!(db.page_url_mapping_count(), 0);

        // Releasing below zero is tolerated
        db.release_page(PAGE);
        assert_eq!(db.retained_page_url_count(), 0);
    }

    #[test]
    fn association_updates_mapping_and_back_references() {
        let (db, _dir) = open_db();
        db.retain_page(PAGE);
        db.set_icon_url_for_page(ICON, PAGE);
        assert_eq!(db.icon_url_for_page(PAGE), ICON);
        assert_eq!(db.icon_record_count(), 1);

        // Re-associating with another icon orphans the first
        db.set_icon_url_for_page("https://example.com/other.ico", PAGE);
        assert_eq!(db.icon_url_for_page(PAGE), "https://example.com/other.ico");
        assert_eq!(db.icon_record_count(), 1);

        let shared = db.shared();
        let state = shared.url_and_icon.lock();
        let icon = state.icons.get("https://example.com/other.ico").unwrap();
        assert!(icon.retaining_page_urls.contains(PAGE));
    }

    #[test]
    fn release_drops_orphaned_icon() {
        let (db, _dir) = open_db();
        db.retain_page(PAGE);
        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(vec![1, 2]), ICON);
        assert_eq!(db.icon_record_count_with_data(), 1);

        db.release_page(PAGE);
        assert_eq!(db.icon_record_count(), 0);
        assert_eq!(db.page_url_mapping_count(), 0);
    }

    #[test]
    fn icon_data_known_reflects_payload_state() {
        let (db, _dir) = open_db();
        assert!(!db.icon_data_known_for_icon_url(ICON));

        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(vec![1]), ICON);
        assert!(db.icon_data_known_for_icon_url(ICON));
        assert_eq!(db.icon_record_count_with_data(), 1);

        // Null bytes are a definitive negative: known, but without data
        db.set_icon_data_for_icon_url(None, ICON);
        assert!(db.icon_data_known_for_icon_url(ICON));
        assert_eq!(db.icon_record_count_with_data(), 0);
        let shared = db.shared();
        let state = shared.url_and_icon.lock();
        assert_eq!(state.icons.get(ICON).unwrap().payload, IconPayload::Missing);
    }

    #[test]
    fn load_decision_flips_no_after_fresh_data() {
        let (db, _dir) = open_db();
        db.set_icon_data_for_icon_url(Some(vec![1]), ICON);
        assert_eq!(db.load_decision_for_icon_url(ICON, PAGE), LoadDecision::No);

        // A definitive negative is also No until the horizon passes
        db.set_icon_data_for_icon_url(None, ICON);
        assert_eq!(db.load_decision_for_icon_url(ICON, PAGE), LoadDecision::No);
    }

    #[test]
    fn load_decision_yes_when_horizon_elapsed() {
        let dir = TempDir::new().unwrap();
        let db = IconDatabase::new(Config {
            expiration_horizon: Duration::ZERO,
            ..test_config()
        });
        assert!(db.open(dir.path()));
        db.set_icon_data_for_icon_url(Some(vec![1]), ICON);
        assert_eq!(db.load_decision_for_icon_url(ICON, PAGE), LoadDecision::Yes);
    }

    #[test]
    fn operations_after_close_degrade_gracefully() {
        let (db, _dir) = open_db();
        db.set_icon_url_for_page(ICON, PAGE);
        db.close();

        assert_eq!(db.icon_url_for_page(PAGE), "");
        assert_eq!(
            db.load_decision_for_icon_url(ICON, PAGE),
            LoadDecision::Unknown
        );
        assert!(!db.icon_data_known_for_icon_url(ICON));
        let icon = db.icon_for_page(PAGE, (16, 16), true);
        assert_eq!(icon.dimensions(), (16, 16));
    }

    #[test]
    fn default_icon_is_cached_per_size() {
        let db = IconDatabase::new(test_config());
        let first = db.default_icon((16, 16));
        let second = db.default_icon((16, 16));
        assert!(Arc::ptr_eq(&first, &second));
        let other = db.default_icon((32, 32));
        assert_eq!(other.dimensions(), (32, 32));
    }

    #[test]
    fn icon_for_page_serves_decoded_bytes() {
        let (db, _dir) = open_db();
        db.retain_page(PAGE);
        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(png_bytes(Rgba([0xff, 0, 0, 0xff]))), ICON);

        let icon = db.icon_for_page(PAGE, (16, 16), true);
        assert_eq!(icon.dimensions(), (16, 16));
        assert_eq!(*icon.get_pixel(8, 8), Rgba([0xff, 0, 0, 0xff]));
    }

    #[test]
    fn decode_failure_yields_default_until_new_bytes() {
        let (db, _dir) = open_db();
        db.retain_page(PAGE);
        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(b"definitely not an image".to_vec()), ICON);

        let fallback = db.icon_for_page(PAGE, (16, 16), true);
        assert!(Arc::ptr_eq(&fallback, &db.default_icon((16, 16))));
        {
            let shared = db.shared();
            let state = shared.url_and_icon.lock();
            assert_eq!(state.icons.get(ICON).unwrap().cached_image((16, 16)), Some(None));
        }

        // Fresh bytes clear the failure cache
        db.set_icon_data_for_icon_url(Some(png_bytes(Rgba([0, 0xff, 0, 0xff]))), ICON);
        let icon = db.icon_for_page(PAGE, (16, 16), true);
        assert!(!Arc::ptr_eq(&icon, &db.default_icon((16, 16))));
    }

    #[test]
    fn set_icon_data_notifies_associated_pages() {
        use std::sync::Mutex as StdMutex;

        struct Recorder(StdMutex<Vec<String>>);
        impl IconDatabaseClient for Recorder {
            fn did_import_icon_data_for_page(&self, page_url: &str) {
                self.0.lock().unwrap().push(page_url.to_string());
            }
        }

        let dir = TempDir::new().unwrap();
        let db = IconDatabase::new(test_config());
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        db.set_client(Arc::clone(&recorder) as Arc<dyn IconDatabaseClient>);
        assert!(db.open(dir.path()));

        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_url_for_page(ICON, "https://example.com/two");
        db.set_icon_data_for_icon_url(Some(vec![1]), ICON);

        let notified: std::collections::HashSet<String> =
            recorder.0.lock().unwrap().iter().cloned().collect();
        assert!(notified.contains(PAGE));
        assert!(notified.contains("https://example.com/two"));
    }

    #[test]
    fn remove_all_icons_clears_memory_but_keeps_retains() {
        let (db, _dir) = open_db();
        db.retain_page(PAGE);
        db.retain_page(PAGE);
        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(vec![1]), ICON);

        db.remove_all_icons();

        assert_eq!(db.icon_record_count(), 0);
        assert_eq!(db.icon_url_for_page(PAGE), "");
        assert_eq!(db.retained_page_url_count(), 1);
        let shared = db.shared();
        let state = shared.url_and_icon.lock();
        assert_eq!(state.pages.get(PAGE).unwrap().retain_count, 2);
    }

    #[test]
    fn cleanup_gate_is_reference_counted() {
        let (db, _dir) = open_db();
        db.delay_database_cleanup();
        db.delay_database_cleanup();
        db.allow_database_cleanup();
        assert_eq!(db.shared().cleanup_suspend_count.load(Ordering::SeqCst), 1);
        db.allow_database_cleanup();
        assert_eq!(db.shared().cleanup_suspend_count.load(Ordering::SeqCst), 0);
        // Unbalanced allow is a logged no-op
        db.allow_database_cleanup();
        assert_eq!(db.shared().cleanup_suspend_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_database_freezes_new_writes() {
        let (db, _dir) = open_db();
        db.set_enabled(false);
        assert!(!db.is_enabled());
        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(vec![1]), ICON);
        // In-memory state still updates; nothing is queued for writeback
        assert_eq!(db.icon_url_for_page(PAGE), ICON);
        assert!(db.shared().pending_sync.lock().icons.is_empty());
        assert!(db.shared().pending_sync.lock().pages.is_empty());
    }

    #[test]
    fn private_browsing_keeps_writes_out_of_queues() {
        let (db, _dir) = open_db();
        db.set_private_browsing(true);
        assert!(db.is_private_browsing());
        db.set_icon_url_for_page(ICON, PAGE);
        db.set_icon_data_for_icon_url(Some(vec![9]), ICON);
        assert_eq!(db.icon_url_for_page(PAGE), ICON);
        assert!(db.icon_data_known_for_icon_url(ICON));
        assert!(db.shared().pending_sync.lock().icons.is_empty());
        assert!(db.shared().pending_sync.lock().pages.is_empty());
    }
}
