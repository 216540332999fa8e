//! The sync thread
//!
//! Owns the SQLite connection for the lifetime of an open database. After
//! startup it opens the store, imports the page/icon mapping into memory,
//! runs the optional legacy migration, then loops: read requested icon
//! bytes, flush the pending snapshots in one transaction, prune once, and
//! sleep on the sync condition until the coalesce deadline or a wakeup.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::database::{Database, DatabaseResult};
use crate::models::{IconSnapshot, PageSnapshot};
use crate::store::{now_epoch, Shared};

/// Thread entry point. `IconDatabase::open` spawns this with a clone of the
/// shared state.
pub(crate) fn run(shared: Arc<Shared>) {
    let mut worker = SyncWorker {
        shared,
        db: None,
        initial_pruning_complete: false,
    };
    worker.perform_open_initialization();
    worker.perform_url_import();
    worker.perform_legacy_import();
    worker.main_loop();
    worker.cleanup();
    debug!("icon database sync thread exited");
}

/// Sync-thread view handed to a `LegacyImporter`. Imports write straight
/// through the SQL adapter; the pending queues are reserved for UI-actor
/// work.
pub struct ImportSession<'a> {
    shared: &'a Shared,
    db: &'a Database,
}

impl ImportSession<'_> {
    /// Poll between items; truthy requests an early return. Combines the
    /// shutdown flags with the client's veto.
    pub fn should_stop(&self) -> bool {
        self.shared
            .thread_termination_requested
            .load(Ordering::SeqCst)
            || self.shared.remove_icons_requested.load(Ordering::SeqCst)
            || self.shared.client().performing_import_should_stop()
    }

    /// Record a legacy page -> icon mapping, in memory and on disk.
    pub fn import_icon_url_for_page(
        &mut self,
        icon_url: &str,
        page_url: &str,
    ) -> DatabaseResult<()> {
        if icon_url.is_empty() || page_url.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.shared.url_and_icon.lock();
            self.shared
                .associate_imported(&mut state, page_url, icon_url, 0);
        }
        let icon_id = match self.db.icon_id_for_icon_url(icon_url)? {
            Some(icon_id) => icon_id,
            None => self.db.add_icon_url(icon_url)?,
        };
        self.db.set_icon_id_for_page(page_url, Some(icon_id))
    }

    /// Record legacy icon bytes, stamped now.
    pub fn import_icon_data_for_icon_url(
        &mut self,
        data: Option<Vec<u8>>,
        icon_url: &str,
    ) -> DatabaseResult<()> {
        if icon_url.is_empty() {
            return Ok(());
        }
        let now = now_epoch();
        {
            let mut state = self.shared.url_and_icon.lock();
            if let Some(icon) = state.icons.get_mut(icon_url) {
                icon.set_image_data(data.clone().map(Arc::new), now);
            }
        }
        self.db.write_icon_snapshot(&IconSnapshot::Update {
            icon_url: icon_url.to_string(),
            timestamp: now,
            data: data.map(Arc::new),
        })
    }
}

struct SyncWorker {
    shared: Arc<Shared>,
    db: Option<Database>,
    initial_pruning_complete: bool,
}

impl SyncWorker {
    fn should_stop_thread_activity(&self) -> bool {
        self.shared
            .thread_termination_requested
            .load(Ordering::SeqCst)
            || self.shared.remove_icons_requested.load(Ordering::SeqCst)
    }

    /// Open the SQL store, recreating it when it cannot be opened or when
    /// the pre-open integrity check fails. A store that cannot be created at
    /// all leaves `db` unset; the loop still runs so shutdown and remove
    /// handshakes keep working.
    fn perform_open_initialization(&mut self) {
        let path = {
            let control = self.shared.sync_control.lock();
            control
                .db_directory
                .as_ref()
                .map(|dir| dir.join(crate::IconDatabase::default_database_filename()))
        };
        let Some(path) = path else {
            warn!("sync thread started without a database path");
            return;
        };

        let mut db = match Database::open(&path) {
            Ok(db) => Some(db),
            Err(err) => {
                warn!(
                    "could not open icon database {}, recreating: {}",
                    path.display(),
                    err
                );
                let _ = std::fs::remove_file(&path);
                match Database::open(&path) {
                    Ok(db) => Some(db),
                    Err(err) => {
                        warn!("could not recreate icon database {}: {}", path.display(), err);
                        None
                    }
                }
            }
        };

        if self.shared.integrity_check_before_open.load(Ordering::SeqCst) {
            if let Some(current) = db.take() {
                if current.integrity_check() {
                    db = Some(current);
                } else {
                    warn!("icon database failed its integrity check, recreating");
                    drop(current);
                    let _ = std::fs::remove_file(&path);
                    db = match Database::open(&path) {
                        Ok(fresh) => Some(fresh),
                        Err(err) => {
                            warn!(
                                "could not recreate icon database {}: {}",
                                path.display(),
                                err
                            );
                            None
                        }
                    };
                }
            }
        }

        self.db = db;
    }

    /// Load every `(pageURL, iconURL, stamp)` row into the in-memory maps,
    /// then atomically finish: clear the pending-import set, flip the
    /// import-complete flag, and notify the pages whose load decisions were
    /// waiting.
    fn perform_url_import(&mut self) {
        if let Some(db) = &self.db {
            let rows = match db.page_rows() {
                Ok(rows) => rows,
                Err(err) => {
                    warn!("icon URL import query failed: {}", err);
                    Vec::new()
                }
            };
            let client = self.shared.client();
            for row in rows {
                if self.should_stop_thread_activity() {
                    break;
                }
                if client.performing_import_should_stop() {
                    debug!("client stopped the icon URL import early");
                    break;
                }
                let mut state = self.shared.url_and_icon.lock();
                // The UI actor may have associated this page already while
                // we were reading; its fresher mapping wins.
                let fresher = state
                    .pages
                    .get(&row.page_url)
                    .map_or(false, |page| page.icon_url.is_some());
                if !fresher {
                    self.shared.associate_imported(
                        &mut state,
                        &row.page_url,
                        &row.icon_url,
                        row.stamp,
                    );
                }
                drop(state);
                self.shared
                    .pending_reading
                    .lock()
                    .pages_pending_import
                    .remove(&row.page_url);
            }
        }
        self.finish_url_import();
    }

    fn finish_url_import(&mut self) {
        if self
            .shared
            .thread_termination_requested
            .load(Ordering::SeqCst)
        {
            return;
        }
        let interested: Vec<String> = {
            let mut reading = self.shared.pending_reading.lock();
            reading.pages_pending_import.clear();
            self.shared
                .icon_url_import_complete
                .store(true, Ordering::SeqCst);
            reading.pages_interested_in_icons.drain().collect()
        };
        let client = self.shared.client();
        let dispatcher = self.shared.dispatcher();
        for page_url in interested {
            let client = Arc::clone(&client);
            dispatcher.post(Box::new(move || client.did_add_icon_for_page(&page_url)));
        }
    }

    /// Run the legacy migration once per database. The flag is only set on
    /// success, so a failed or stopped run is retried on a later open. With
    /// no importer installed there is nothing to migrate and the flag is
    /// written immediately.
    fn perform_legacy_import(&mut self) {
        if self.should_stop_thread_activity() {
            return;
        }
        let Some(db) = self.db.as_ref() else { return };
        match db.imported_flag() {
            Ok(Some(true)) => return,
            Ok(_) => {}
            Err(err) => {
                warn!("could not read the legacy import flag: {}", err);
                return;
            }
        }
        let importer = self.shared.importer.lock().take();
        let Some(mut importer) = importer else {
            if let Err(err) = db.set_imported_flag(true) {
                warn!("could not record the legacy import flag: {}", err);
            }
            return;
        };
        let mut session = ImportSession {
            shared: self.shared.as_ref(),
            db,
        };
        match importer.import(&mut session) {
            Ok(()) if !session.should_stop() => {
                if let Err(err) = db.set_imported_flag(true) {
                    warn!("could not record the legacy import flag: {}", err);
                }
            }
            Ok(()) => debug!("legacy icon import stopped early, will retry next open"),
            Err(err) => warn!("legacy icon import failed: {}", err),
        }
    }

    fn main_loop(&mut self) {
        let mut first_cycle_done = false;
        loop {
            if self
                .shared
                .thread_termination_requested
                .load(Ordering::SeqCst)
            {
                return;
            }
            if self.shared.remove_icons_requested.load(Ordering::SeqCst) {
                self.remove_all_icons_on_thread();
                continue;
            }

            self.read_from_database();
            self.write_to_database(false);

            if first_cycle_done
                && !self.initial_pruning_complete
                && self.shared.cleanup_suspend_count.load(Ordering::SeqCst) == 0
            {
                self.prune_unretained_icons();
            }

            let had_first = first_cycle_done;
            first_cycle_done = true;
            if !had_first && !self.initial_pruning_complete {
                // Come straight back for the initial pruning pass
                continue;
            }
            self.wait_for_work();
        }
    }

    /// Sleep until the coalesce deadline, an immediate wake, or the idle
    /// period elapses.
    fn wait_for_work(&self) {
        let shared = &self.shared;
        let mut control = shared.sync_control.lock();
        loop {
            if control.wake_requested {
                control.wake_requested = false;
                control.wake_deadline = None;
                return;
            }
            if shared
                .thread_termination_requested
                .load(Ordering::SeqCst)
                || shared.remove_icons_requested.load(Ordering::SeqCst)
            {
                return;
            }
            match control.wake_deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        control.wake_deadline = None;
                        return;
                    }
                    shared.sync_condition.wait_until(&mut control, deadline);
                }
                None => {
                    let result = shared
                        .sync_condition
                        .wait_for(&mut control, shared.config.sync_idle_period);
                    if result.timed_out() {
                        return;
                    }
                }
            }
        }
    }

    /// Resolve the payload of every icon in the pending-read set, notifying
    /// the pages associated with each as the bytes land in memory.
    fn read_from_database(&mut self) -> bool {
        let Some(db) = &self.db else { return false };
        let icon_urls: Vec<String> = {
            let reading = self.shared.pending_reading.lock();
            reading.icons_pending_read.iter().cloned().collect()
        };
        if icon_urls.is_empty() {
            return false;
        }

        let client = self.shared.client();
        let dispatcher = self.shared.dispatcher();
        let mut did_work = false;
        for icon_url in icon_urls {
            if self.should_stop_thread_activity() {
                break;
            }
            let data = match db.image_data_for_icon_url(&icon_url) {
                Ok(data) => data,
                Err(err) => {
                    warn!("reading icon bytes for {} failed: {}", icon_url, err);
                    None
                }
            };

            let mut pages_to_notify = Vec::new();
            {
                let mut state = self.shared.url_and_icon.lock();
                let mut reading = self.shared.pending_reading.lock();
                // The UI actor may have supplied fresh bytes meanwhile, in
                // which case the entry is gone and the disk copy is stale.
                if reading.icons_pending_read.remove(&icon_url) {
                    if let Some(icon) = state.icons.get_mut(&icon_url) {
                        icon.set_payload_from_disk(data);
                        pages_to_notify = icon.retaining_page_urls.iter().cloned().collect();
                    }
                }
            }
            for page_url in pages_to_notify {
                let client = Arc::clone(&client);
                dispatcher.post(Box::new(move || {
                    client.did_import_icon_data_for_page(&page_url)
                }));
            }
            did_work = true;
        }
        did_work
    }

    /// Snapshot-and-clear the pending queues, then apply everything in one
    /// transaction. A failing statement is logged and its write dropped;
    /// there is no retry within the cycle. During the final drain
    /// (`draining`) the termination flag no longer aborts the burst.
    fn write_to_database(&mut self, draining: bool) -> bool {
        let Some(db) = &self.db else { return false };
        let (pages, icons) = {
            let mut pending = self.shared.pending_sync.lock();
            if pending.pages.is_empty() && pending.icons.is_empty() {
                return false;
            }
            (
                std::mem::take(&mut pending.pages),
                std::mem::take(&mut pending.icons),
            )
        };

        let abort = |worker: &Self| {
            worker.shared.remove_icons_requested.load(Ordering::SeqCst)
                || (!draining
                    && worker
                        .shared
                        .thread_termination_requested
                        .load(Ordering::SeqCst))
        };

        let tx = match db.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!("could not start a write transaction: {}", err);
                return true;
            }
        };
        for snapshot in icons.values() {
            if abort(self) {
                break;
            }
            if let Err(err) = db.write_icon_snapshot(snapshot) {
                warn!("dropping icon write for {}: {}", snapshot.icon_url(), err);
            }
        }
        for snapshot in pages.values() {
            if abort(self) {
                break;
            }
            if let Err(err) = Self::write_page_snapshot(db, snapshot) {
                warn!("dropping page write for {}: {}", snapshot.page_url(), err);
            }
        }
        if let Err(err) = tx.commit() {
            warn!("write transaction failed to commit: {}", err);
        }
        true
    }

    fn write_page_snapshot(db: &Database, snapshot: &PageSnapshot) -> DatabaseResult<()> {
        match snapshot {
            PageSnapshot::Delete { page_url } => db.remove_page(page_url),
            PageSnapshot::Update { page_url, icon_url } => {
                let icon_id = match db.icon_id_for_icon_url(icon_url)? {
                    Some(icon_id) => icon_id,
                    None => db.add_icon_url(icon_url)?,
                };
                db.set_icon_id_for_page(page_url, Some(icon_id))
            }
        }
    }

    /// One transaction that deletes every persisted page with no retain
    /// count and no queued write, then every icon left without a referring
    /// page, then any page row pointing at a missing icon.
    fn prune_unretained_icons(&mut self) {
        let Some(db) = &self.db else {
            self.initial_pruning_complete = true;
            return;
        };
        let on_disk = match db.page_urls_on_disk() {
            Ok(urls) => urls,
            Err(err) => {
                warn!("pruning could not list page rows: {}", err);
                return;
            }
        };
        let mut unretained: Vec<String> = {
            let state = self.shared.url_and_icon.lock();
            on_disk
                .into_iter()
                .filter(|url| !state.retained_pages.contains_key(url))
                .collect()
        };
        {
            let pending = self.shared.pending_sync.lock();
            unretained.retain(|url| !pending.pages.contains_key(url));
        }

        let tx = match db.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!("could not start the pruning transaction: {}", err);
                return;
            }
        };
        let pruned_pages = unretained.len();
        for page_url in &unretained {
            if self
                .shared
                .thread_termination_requested
                .load(Ordering::SeqCst)
            {
                return;
            }
            if let Err(err) = db.remove_page(page_url) {
                warn!("pruning page {} failed: {}", page_url, err);
            }
        }
        let pruned_icons = match db.remove_unreferenced_icons() {
            Ok(removed) => removed,
            Err(err) => {
                warn!("pruning unreferenced icons failed: {}", err);
                0
            }
        };
        match db.dangling_page_urls() {
            Ok(dangling) if !dangling.is_empty() => {
                warn!("removing {} dangling page rows", dangling.len());
                for page_url in &dangling {
                    if let Err(err) = db.remove_page(page_url) {
                        warn!("removing dangling page {} failed: {}", page_url, err);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!("dangling page check failed: {}", err),
        }
        if let Err(err) = tx.commit() {
            warn!("pruning transaction failed to commit: {}", err);
            return;
        }
        if pruned_pages > 0 || pruned_icons > 0 {
            debug!("pruned {} pages and {} icons", pruned_pages, pruned_icons);
        }
        self.initial_pruning_complete = true;
    }

    /// Truncate the on-disk store, release the UI actor waiting on the
    /// remove condition, and notify the client.
    fn remove_all_icons_on_thread(&mut self) {
        if let Some(db) = &self.db {
            if let Err(err) = db.truncate_all() {
                warn!("truncating the icon database failed: {}", err);
            }
        }
        {
            let mut pending = self.shared.pending_sync.lock();
            pending.pages.clear();
            pending.icons.clear();
        }
        {
            let _guard = self.shared.remove_lock.lock();
            self.shared
                .remove_icons_requested
                .store(false, Ordering::SeqCst);
            self.shared.remove_condition.notify_all();
        }
        let client = self.shared.client();
        self.shared
            .dispatcher()
            .post(Box::new(move || client.did_remove_all_icons()));
    }

    /// Commit whatever the UI actor queued before termination, then close
    /// the SQL handle (finalizing the cached statements with it).
    fn cleanup(&mut self) {
        self.write_to_database(true);
        self.db = None;
    }
}
