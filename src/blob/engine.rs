use crate::blob::allocation::AllocationStrategy;
use crate::blob::error::{BlobResult, BlobStorageError};
use crate::blob::header::{FileStatus, STORAGE_HEADER_SIZE, StorageHeader};
use crate::blob::record::{
    PADDING_HEADER_SIZE, RECORD_ALIGNMENT, RECORD_HEADER_SIZE, RecordHeader, RecordId,
};
use crate::blob::scan::{RecordIter, ScannedRecord};
use crate::blob::stats::BlobStorageStatistics;
use crate::config::BlobStorageConfig;
use crate::storage::disk::MIN_PAGE_SIZE;
use crate::storage::{PagedFileStorage, PagedStorage};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;

struct EngineState {
    header: StorageHeader,
    closed: bool,
}

impl EngineState {
    fn ensure_open(&self) -> BlobResult<()> {
        if self.closed {
            return Err(BlobStorageError::Closed);
        }
        Ok(())
    }
}

/// Terminal slot reached from a record id, with the redirects passed on the way.
struct Resolved {
    id: RecordId,
    header: RecordHeader,
    redirects: Vec<(RecordId, u32)>,
}

/// Record store mapping [`RecordId`]s to byte payloads on top of a [`PagedStorage`].
///
/// ## Concurrency
///
/// A single reader/writer lock guards the storage header and its counters.
/// Reads take the shared side, so lookups of different records run in
/// parallel. Every mutation (allocation, in-place update, relocation,
/// deletion) takes the exclusive side, which also keeps a read from observing
/// a relocation half done.
///
/// ## Durability
///
/// Counters reach the file only on [`BlobStorage::flush`] or
/// [`BlobStorage::close`]. A file that was not closed properly is detected on
/// the next open and its counters are rebuilt from a full scan.
pub struct BlobStorage {
    storage: Box<dyn PagedStorage>,
    strategy: Box<dyn AllocationStrategy>,
    config: BlobStorageConfig,
    page_size: usize,
    was_closed_properly: bool,
    state: RwLock<EngineState>,
}

impl BlobStorage {
    /// Opens a blob file at `path`, creating it if needed.
    pub fn open_file(
        path: &Path,
        strategy: Box<dyn AllocationStrategy>,
        config: BlobStorageConfig,
    ) -> BlobResult<Self> {
        let storage = PagedFileStorage::open(path, config.page_size, config.buffer_pool_frames)?;
        Self::open_with_config(Box::new(storage), strategy, config)
    }

    pub fn open(
        storage: Box<dyn PagedStorage>,
        strategy: Box<dyn AllocationStrategy>,
    ) -> BlobResult<Self> {
        Self::open_with_config(storage, strategy, BlobStorageConfig::default())
    }

    /// Opens the engine over `storage`. The storage is closed if opening fails.
    ///
    /// `config.page_size` is ignored here: the page size is whatever `storage` uses.
    pub fn open_with_config(
        storage: Box<dyn PagedStorage>,
        strategy: Box<dyn AllocationStrategy>,
        config: BlobStorageConfig,
    ) -> BlobResult<Self> {
        let (header, was_closed_properly) = match Self::load_header(storage.as_ref()) {
            Ok(loaded) => loaded,
            Err(e) => {
                if let Err(close_err) = storage.close() {
                    warn!("failed to release storage after failed open: {close_err}");
                }
                return Err(e);
            }
        };

        let page_size = storage.page_size();
        let engine = Self {
            storage,
            strategy,
            config,
            page_size,
            was_closed_properly,
            state: RwLock::new(EngineState {
                header,
                closed: false,
            }),
        };

        if let Err(e) = engine.start_session() {
            engine.abandon();
            return Err(e);
        }
        Ok(engine)
    }

    fn load_header(storage: &dyn PagedStorage) -> BlobResult<(StorageHeader, bool)> {
        let page_size = storage.page_size();
        if page_size < MIN_PAGE_SIZE
            || page_size % RECORD_ALIGNMENT != 0
            || u32::try_from(page_size).is_err()
        {
            return Err(BlobStorageError::Format(format!(
                "unsupported page size {page_size}"
            )));
        }

        let size = storage.size()?;
        if size == 0 {
            return Self::initialize_header(storage);
        }
        if size < STORAGE_HEADER_SIZE as u64 {
            return Err(BlobStorageError::Format(format!(
                "storage of {size} bytes is too small for a header"
            )));
        }

        let raw = storage.read_bytes(0, STORAGE_HEADER_SIZE)?;
        let Some(header) = StorageHeader::decode(&raw)? else {
            return Self::initialize_header(storage);
        };

        if header.page_size as usize != page_size {
            return Err(BlobStorageError::Format(format!(
                "storage was created with page size {}, opened with {page_size}",
                header.page_size
            )));
        }
        let end = header.stats.size_in_bytes;
        if end < STORAGE_HEADER_SIZE as u64 || end > size || end % RECORD_ALIGNMENT as u64 != 0 {
            return Err(BlobStorageError::Format(format!(
                "records end at {end} but storage holds {size} bytes"
            )));
        }

        let clean = header.status == FileStatus::ClosedProperly;
        Ok((header, clean))
    }

    fn initialize_header(storage: &dyn PagedStorage) -> BlobResult<(StorageHeader, bool)> {
        let page_size = storage.page_size();
        let header = StorageHeader::new(page_size as u32);
        storage.grow(page_size as u64)?;
        storage.write_bytes(0, &header.encode())?;
        storage.flush()?;
        info!("initialized new blob storage, page size {page_size}");
        Ok((header, true))
    }

    fn start_session(&self) -> BlobResult<()> {
        let mut state = self.state.write();
        if !self.was_closed_properly {
            warn!("blob storage was not closed properly, header counters may be stale");
            if self.config.recover_on_unclean_open {
                self.recover_locked(&mut state.header)?;
            }
        }
        state.header.status = FileStatus::Opened;
        self.persist_header(&state.header)?;
        info!(
            "opened blob storage: {} live records, {} bytes",
            state.header.stats.live_records_count(),
            state.header.stats.size_in_bytes
        );
        Ok(())
    }

    /// Releases the storage without marking the file as properly closed.
    fn abandon(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Err(e) = self.storage.close() {
            warn!("failed to release storage after failed open: {e}");
        }
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    pub fn read_record(&self, id: RecordId) -> BlobResult<Vec<u8>> {
        let state = self.state.read();
        state.ensure_open()?;

        let resolved = self.resolve(&state.header, id)?;
        match resolved.header {
            RecordHeader::Actual { length, .. } => {
                let payload_offset = resolved.id.offset() + RECORD_HEADER_SIZE as u64;
                Ok(self.storage.read_bytes(payload_offset, length as usize)?)
            }
            _ => Err(BlobStorageError::Deleted(id)),
        }
    }

    /// Writes `payload` as a new record (`id == None`) or over an existing one.
    ///
    /// Returns the id the record lives under now. An update that fits the
    /// current capacity keeps the id; one that does not relocates the record
    /// and returns the new id, while the old id keeps resolving to it.
    pub fn write_record(&self, id: Option<RecordId>, payload: &[u8]) -> BlobResult<RecordId> {
        let mut state = self.state.write();
        state.ensure_open()?;

        let Some(id) = id else {
            return self.insert(&mut state.header, payload);
        };

        let resolved = self.resolve(&state.header, id)?;
        let RecordHeader::Actual {
            capacity,
            length,
            origin,
        } = resolved.header
        else {
            return Err(BlobStorageError::Deleted(id));
        };

        if payload.len() <= capacity as usize {
            let mut stats = state.header.stats;
            stats.live_payload_bytes = adjust(
                stats.live_payload_bytes,
                payload.len() as u64,
                length as u64,
                resolved.id.offset(),
            )?;
            let updated = RecordHeader::Actual {
                capacity,
                length: payload.len() as u32,
                origin,
            };
            self.write_slot(resolved.id.offset(), &updated, payload)?;
            state.header.stats = stats;
            return Ok(resolved.id);
        }

        self.relocate(&mut state.header, resolved, payload)
    }

    /// Marks the record `id` resolves to as deleted.
    ///
    /// The record's redirects (its origin and every redirect on the way) are
    /// turned into tombstones as well, so all ids of the record fail with
    /// [`BlobStorageError::Deleted`] within one hop.
    pub fn delete_record(&self, id: RecordId) -> BlobResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;

        let resolved = self.resolve(&state.header, id)?;
        let RecordHeader::Actual {
            capacity,
            length,
            origin,
        } = resolved.header
        else {
            return Err(BlobStorageError::Deleted(id));
        };

        let offset = resolved.id.offset();
        let mut stats = state.header.stats;
        stats.records_deleted += 1;
        stats.live_payload_bytes = adjust(stats.live_payload_bytes, 0, length as u64, offset)?;
        stats.live_capacity_bytes = adjust(stats.live_capacity_bytes, 0, capacity as u64, offset)?;

        let tombstone = RecordHeader::Deleted {
            capacity,
            length,
            relocated: false,
        };
        self.storage.write_bytes(offset, &tombstone.encode())?;
        state.header.stats = stats;
        debug!("deleted record {} (via {id})", resolved.id);

        let mut redirects = resolved.redirects;
        if let Some(origin) = origin.filter(|o| !redirects.iter().any(|(r, _)| r == o)) {
            match self.redirect_capacity(origin, stats.size_in_bytes) {
                Ok(capacity) => redirects.push((origin, capacity)),
                Err(e) => warn!("origin {origin} of deleted record {} left as is: {e}", resolved.id),
            }
        }
        for (redirect_id, redirect_capacity) in redirects {
            let tombstone = RecordHeader::Deleted {
                capacity: redirect_capacity,
                length: 0,
                relocated: true,
            };
            // A redirect left behind still leads to the tombstone above
            if let Err(e) = self.storage.write_bytes(redirect_id.offset(), &tombstone.encode()) {
                warn!("failed to tombstone redirect {redirect_id}: {e}");
            }
        }
        Ok(())
    }

    /// Follows redirects from `id` to the id the record currently lives under.
    pub fn resolve_id(&self, id: RecordId) -> BlobResult<RecordId> {
        let state = self.state.read();
        state.ensure_open()?;

        let resolved = self.resolve(&state.header, id)?;
        match resolved.header {
            RecordHeader::Actual { .. } => Ok(resolved.id),
            _ => Err(BlobStorageError::Deleted(id)),
        }
    }

    /// Lazy scan over every slot in file order.
    ///
    /// Each call starts a fresh scan bounded by the slots allocated at the time
    /// of the call. The engine lock is taken per slot, so the caller may mutate
    /// the storage between steps.
    pub fn records(&self) -> RecordIter<'_> {
        let end = self.state.read().header.stats.size_in_bytes;
        RecordIter::new(self, STORAGE_HEADER_SIZE as u64, end)
    }

    /// Calls `visitor` for every slot in file order until it returns `false`.
    pub fn for_each_record<F>(&self, mut visitor: F) -> BlobResult<()>
    where
        F: FnMut(&ScannedRecord) -> bool,
    {
        for record in self.records() {
            if !visitor(&record?) {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn scan_slot(&self, offset: u64, end: u64) -> BlobResult<ScannedRecord> {
        let state = self.state.read();
        state.ensure_open()?;

        let header = self.slot_header_at(offset, end)?;
        let id = RecordId::from_offset(offset)
            .ok_or_else(|| BlobStorageError::corruption(offset, "slot outside record id range"))?;
        let payload = match header {
            RecordHeader::Actual { length, .. } => Some(
                self.storage
                    .read_bytes(offset + RECORD_HEADER_SIZE as u64, length as usize)?,
            ),
            _ => None,
        };
        Ok(ScannedRecord {
            id,
            header,
            payload,
        })
    }

    // =========================================================================
    // Statistics and recovery
    // =========================================================================

    pub fn statistics(&self) -> BlobStorageStatistics {
        self.state.read().header.stats
    }

    pub fn records_allocated(&self) -> u64 {
        self.statistics().records_allocated
    }

    pub fn records_deleted(&self) -> u64 {
        self.statistics().records_deleted
    }

    pub fn records_relocated(&self) -> u64 {
        self.statistics().records_relocated
    }

    pub fn live_records_count(&self) -> u64 {
        self.statistics().live_records_count()
    }

    pub fn total_live_records_payload_bytes(&self) -> u64 {
        self.statistics().live_payload_bytes
    }

    pub fn total_live_records_capacity_bytes(&self) -> u64 {
        self.statistics().live_capacity_bytes
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.statistics().size_in_bytes
    }

    pub fn storage_version(&self) -> u32 {
        self.state.read().header.version
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest payload a single record can hold under the current strategy.
    pub fn max_payload_size(&self) -> usize {
        self.strategy
            .max_capacity()
            .min(self.page_size - RECORD_HEADER_SIZE)
    }

    /// Whether the session before this one closed the file properly.
    pub fn was_closed_properly(&self) -> bool {
        self.was_closed_properly
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Recomputes statistics from slot states without changing anything.
    pub fn scan_statistics(&self) -> BlobResult<BlobStorageStatistics> {
        let state = self.state.read();
        state.ensure_open()?;
        self.walk_slots(&state.header, false)
    }

    /// Rebuilds the counters from a full scan and persists them.
    ///
    /// The scan continues past the recorded end over any well-formed slots,
    /// which picks up records written after the last flush of a crashed session.
    pub fn recover(&self) -> BlobResult<BlobStorageStatistics> {
        let mut state = self.state.write();
        state.ensure_open()?;
        self.recover_locked(&mut state.header)?;
        self.persist_header(&state.header)?;
        Ok(state.header.stats)
    }

    fn recover_locked(&self, header: &mut StorageHeader) -> BlobResult<()> {
        let recomputed = self.walk_slots(header, true)?;
        if recomputed != header.stats {
            warn!(
                "recovery scan corrected statistics: {:?} -> {:?}",
                header.stats, recomputed
            );
        }
        info!(
            "recovery scan done: {} live records in {} bytes",
            recomputed.live_records_count(),
            recomputed.size_in_bytes
        );
        header.stats = recomputed;
        Ok(())
    }

    fn walk_slots(&self, header: &StorageHeader, extend: bool) -> BlobResult<BlobStorageStatistics> {
        let committed_end = header.stats.size_in_bytes;
        let mut stats = BlobStorageStatistics::default();
        let mut redirect_targets = HashSet::new();
        let mut offset = STORAGE_HEADER_SIZE as u64;

        while offset < committed_end {
            let record = self.slot_header_at(offset, committed_end)?;
            stats.account(&record);
            redirect_targets.extend(record.redirect());
            offset += record.slot_size() as u64;
        }

        if extend {
            let storage_size = self.storage.size()?;
            while offset < storage_size {
                let record = match self.slot_header_at(offset, storage_size) {
                    Ok(record) => record,
                    // Zeroed or torn space: the end of what was written
                    Err(BlobStorageError::Corruption { .. }) => break,
                    Err(e) => return Err(e),
                };
                // A relocated copy nothing redirects to is left from a relocation that never committed
                let orphan = matches!(record, RecordHeader::Actual { origin: Some(_), .. })
                    && RecordId::from_offset(offset)
                        .map_or(true, |id| !redirect_targets.contains(&id));
                if orphan {
                    debug!("stopping recovery scan at uncommitted relocation copy at {offset}");
                    break;
                }
                debug!("found slot past recorded end at {offset}: {record:?}");
                stats.account(&record);
                redirect_targets.extend(record.redirect());
                offset += record.slot_size() as u64;
            }
        }

        stats.size_in_bytes = offset;
        Ok(stats)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Persists counters and flushes pending page writes.
    pub fn flush(&self) -> BlobResult<()> {
        let state = self.state.read();
        state.ensure_open()?;
        self.persist_header(&state.header)
    }

    /// Persists counters, marks the file as properly closed and releases the
    /// storage. Closing again is a no-op.
    pub fn close(&self) -> BlobResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.header.status = FileStatus::ClosedProperly;

        let persisted = self
            .storage
            .write_bytes(0, &state.header.encode())
            .map_err(BlobStorageError::from);
        let released = self.storage.close().map_err(BlobStorageError::from);
        info!(
            "closed blob storage: {} live records, {} bytes",
            state.header.stats.live_records_count(),
            state.header.stats.size_in_bytes
        );
        persisted.and(released)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn persist_header(&self, header: &StorageHeader) -> BlobResult<()> {
        self.storage.write_bytes(0, &header.encode())?;
        self.storage.flush()?;
        Ok(())
    }

    /// Reads the slot header at `offset`; the slot must end within its page and before `limit`.
    fn slot_header_at(&self, offset: u64, limit: u64) -> BlobResult<RecordHeader> {
        let page_size = self.page_size as u64;
        let page_end = (offset / page_size + 1) * page_size;
        let readable = (page_end - offset).min(RECORD_HEADER_SIZE as u64) as usize;

        let raw = self.storage.read_bytes(offset, readable)?;
        let record = RecordHeader::decode(offset, &raw)?;

        let slot_end = offset + record.slot_size() as u64;
        if slot_end > page_end || slot_end > limit {
            return Err(BlobStorageError::corruption(
                offset,
                format!("slot of {} bytes overruns its page or the allocated range", record.slot_size()),
            ));
        }
        Ok(record)
    }

    /// Whether a slot starts exactly at `offset`, which must lie in `[64, end)`.
    ///
    /// Slots never cross pages, so walking the page from its first slot is
    /// enough. Costs one page read.
    fn is_slot_start(&self, offset: u64, end: u64) -> BlobResult<bool> {
        let page_size = self.page_size as u64;
        let page_start = offset / page_size * page_size;
        let walk_start = page_start.max(STORAGE_HEADER_SIZE as u64);
        if offset == walk_start {
            return Ok(true);
        }

        let walk_end = (page_start + page_size).min(end);
        let page = self
            .storage
            .read_bytes(walk_start, (walk_end - walk_start) as usize)?;
        let mut position = walk_start;
        while position < offset {
            let at = (position - walk_start) as usize;
            let header_end = (at + RECORD_HEADER_SIZE).min(page.len());
            let record = RecordHeader::decode(position, &page[at..header_end])?;
            position += record.slot_size() as u64;
        }
        Ok(position == offset)
    }

    fn resolve(&self, header: &StorageHeader, id: RecordId) -> BlobResult<Resolved> {
        let end = header.stats.size_in_bytes;
        let allocated =
            |rid: RecordId| rid.offset() >= STORAGE_HEADER_SIZE as u64 && rid.offset() < end;
        if !allocated(id) || !self.is_slot_start(id.offset(), end)? {
            return Err(BlobStorageError::NotFound(id));
        }

        let mut current = id;
        let mut record = self.slot_header_at(id.offset(), end)?;
        let mut redirects: Vec<(RecordId, u32)> = Vec::new();

        loop {
            match record {
                RecordHeader::Actual { .. } | RecordHeader::Deleted { .. } => {
                    return Ok(Resolved {
                        id: current,
                        header: record,
                        redirects,
                    });
                }
                RecordHeader::Padding { .. } => {
                    return match redirects.last() {
                        None => Err(BlobStorageError::NotFound(id)),
                        Some((from, _)) => Err(BlobStorageError::corruption(
                            from.offset(),
                            format!("redirect to padding slot {current}"),
                        )),
                    };
                }
                RecordHeader::Moved { capacity, target } => {
                    redirects.push((current, capacity));
                    if redirects.iter().any(|(visited, _)| *visited == target) {
                        return Err(BlobStorageError::corruption(
                            current.offset(),
                            format!("redirect cycle back to {target}"),
                        ));
                    }
                    if redirects.len() > self.config.max_redirect_hops {
                        return Err(BlobStorageError::corruption(
                            id.offset(),
                            format!(
                                "redirect chain from {id} exceeds {} hops",
                                self.config.max_redirect_hops
                            ),
                        ));
                    }
                    if !allocated(target) || !self.is_slot_start(target.offset(), end)? {
                        return Err(BlobStorageError::corruption(
                            current.offset(),
                            format!("redirect to {target}, which is not a slot"),
                        ));
                    }
                    current = target;
                    record = self.slot_header_at(target.offset(), end)?;
                }
            }
        }
    }

    /// Capacity of the redirect slot at `id`.
    fn redirect_capacity(&self, id: RecordId, end: u64) -> BlobResult<u32> {
        match self.slot_header_at(id.offset(), end)? {
            RecordHeader::Moved { capacity, .. } => Ok(capacity),
            other => Err(BlobStorageError::corruption(
                id.offset(),
                format!("expected a redirect, found {} slot", other.state()),
            )),
        }
    }

    fn capacity_for(&self, payload_len: usize, current_capacity: Option<u32>) -> BlobResult<u32> {
        let max = self.max_payload_size();
        if payload_len > max {
            return Err(BlobStorageError::Capacity {
                requested: payload_len,
                max,
            });
        }

        let desired = match current_capacity {
            None => self.strategy.initial_capacity(payload_len),
            Some(current) => self
                .strategy
                .relocation_capacity(payload_len, current as usize),
        };
        Ok(desired.clamp(payload_len, max) as u32)
    }

    fn insert(&self, header: &mut StorageHeader, payload: &[u8]) -> BlobResult<RecordId> {
        let capacity = self.capacity_for(payload.len(), None)?;
        let record = RecordHeader::actual(capacity, payload.len() as u32);
        let (id, end) = self.allocate_slot(header.stats.size_in_bytes, &record, payload)?;

        let stats = &mut header.stats;
        stats.size_in_bytes = end;
        stats.records_allocated += 1;
        stats.live_payload_bytes += payload.len() as u64;
        stats.live_capacity_bytes += capacity as u64;
        debug!("allocated record {id}: {} bytes, capacity {capacity}", payload.len());
        Ok(id)
    }

    /// Copies the record to a new slot and turns its old slot into a redirect.
    ///
    /// The new slot remembers the record's origin. Afterwards the origin
    /// points at the new slot and every other redirect of the record points
    /// at the origin, so any id of the record resolves in at most two hops no
    /// matter which id the update came through.
    fn relocate(
        &self,
        header: &mut StorageHeader,
        resolved: Resolved,
        payload: &[u8],
    ) -> BlobResult<RecordId> {
        let RecordHeader::Actual {
            capacity: old_capacity,
            length: old_length,
            origin,
        } = resolved.header
        else {
            return Err(BlobStorageError::Deleted(resolved.id));
        };
        let previous = resolved.id;
        let origin = origin.unwrap_or(previous);

        let capacity = self.capacity_for(payload.len(), Some(old_capacity))?;
        let mut stats = header.stats;
        stats.records_allocated += 1;
        stats.records_relocated += 1;
        stats.live_payload_bytes = adjust(
            stats.live_payload_bytes,
            payload.len() as u64,
            old_length as u64,
            previous.offset(),
        )?;
        stats.live_capacity_bytes = adjust(
            stats.live_capacity_bytes,
            capacity as u64,
            old_capacity as u64,
            previous.offset(),
        )?;

        let record = RecordHeader::Actual {
            capacity,
            length: payload.len() as u32,
            origin: Some(origin),
        };
        let (new_id, end) = self.allocate_slot(stats.size_in_bytes, &record, payload)?;

        let moved = RecordHeader::Moved {
            capacity: old_capacity,
            target: new_id,
        };
        self.storage.write_bytes(previous.offset(), &moved.encode())?;
        stats.size_in_bytes = end;
        header.stats = stats;
        debug!(
            "relocated record {previous} -> {new_id}: {} bytes outgrew capacity {old_capacity}",
            payload.len()
        );

        if origin != previous {
            self.shorten_chain(origin, previous, old_capacity, new_id, &resolved.redirects, end);
        }
        Ok(new_id)
    }

    /// Points `origin` at `target` and the record's other redirects at `origin`.
    ///
    /// The chain is already valid when this runs, so failures are logged and
    /// only leave a longer chain behind.
    fn shorten_chain(
        &self,
        origin: RecordId,
        previous: RecordId,
        previous_capacity: u32,
        target: RecordId,
        followed: &[(RecordId, u32)],
        end: u64,
    ) {
        let origin_capacity = match followed.iter().find(|(id, _)| *id == origin) {
            Some(&(_, capacity)) => Ok(capacity),
            None => self.redirect_capacity(origin, end),
        };
        let rewritten = origin_capacity.and_then(|capacity| {
            let shortcut = RecordHeader::Moved { capacity, target };
            self.storage
                .write_bytes(origin.offset(), &shortcut.encode())
                .map_err(BlobStorageError::from)
        });
        // Until the origin points past `previous`, pointing `previous` back at it would close a cycle
        if let Err(e) = rewritten {
            warn!("failed to point origin {origin} at {target}: {e}");
            return;
        }

        let others = followed
            .iter()
            .copied()
            .filter(|(id, _)| *id != origin)
            .chain(std::iter::once((previous, previous_capacity)));
        for (redirect_id, capacity) in others {
            let to_origin = RecordHeader::Moved {
                capacity,
                target: origin,
            };
            if let Err(e) = self.storage.write_bytes(redirect_id.offset(), &to_origin.encode()) {
                warn!("failed to point redirect {redirect_id} at origin {origin}: {e}");
            }
        }
    }

    /// Writes `record` at the first position from `start` where its slot fits
    /// in one page. Returns its id and the new end of the allocated range.
    fn allocate_slot(
        &self,
        start: u64,
        record: &RecordHeader,
        payload: &[u8],
    ) -> BlobResult<(RecordId, u64)> {
        let slot_size = record.slot_size() as u64;
        let page_size = self.page_size as u64;

        let mut offset = start;
        let page_end = (offset / page_size + 1) * page_size;
        let needs_padding = offset + slot_size > page_end;
        if needs_padding {
            offset = page_end;
        }
        let id = RecordId::from_offset(offset).ok_or(BlobStorageError::StorageFull { offset })?;

        if needs_padding {
            let remaining = (page_end - start) as usize;
            let padding = RecordHeader::Padding {
                capacity: (remaining - PADDING_HEADER_SIZE) as u32,
            };
            self.storage.write_bytes(start, &padding.encode())?;
        }

        self.storage.grow(offset + slot_size)?;
        self.write_slot(offset, record, payload)?;
        Ok((id, offset + slot_size))
    }

    fn write_slot(&self, offset: u64, record: &RecordHeader, payload: &[u8]) -> BlobResult<()> {
        let mut buf = record.encode();
        buf.extend_from_slice(payload);
        self.storage.write_bytes(offset, &buf)?;
        Ok(())
    }
}

/// `counter + added - removed`, or a corruption error when a slot header
/// claims more live bytes than the counters hold.
fn adjust(counter: u64, added: u64, removed: u64, offset: u64) -> BlobResult<u64> {
    counter
        .checked_add(added)
        .and_then(|value| value.checked_sub(removed))
        .ok_or_else(|| {
            BlobStorageError::corruption(
                offset,
                format!("live counter {counter} cannot drop by {removed}"),
            )
        })
}

impl Drop for BlobStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("failed to close blob storage: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::allocation::{ExactFit, SizeBuckets};
    use crate::blob::record::RecordState;
    use anyhow::Result;
    use tempfile::{TempDir, tempdir};

    const PAGE_SIZE: usize = 8192;

    fn open_test_storage(page_size: usize) -> Result<(TempDir, BlobStorage)> {
        let dir = tempdir()?;
        let config = BlobStorageConfig::builder().page_size(page_size).build();
        let storage = BlobStorage::open_file(
            &dir.path().join("test.blob"),
            Box::new(ExactFit::default()),
            config,
        )?;
        Ok((dir, storage))
    }

    #[test]
    fn test_new_storage_is_empty() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;

        assert_eq!(storage.records_allocated(), 0);
        assert_eq!(storage.live_records_count(), 0);
        assert_eq!(storage.size_in_bytes(), STORAGE_HEADER_SIZE as u64);
        assert_eq!(storage.records().count(), 0);
        assert!(storage.was_closed_properly());
        Ok(())
    }

    #[test]
    fn test_first_record_follows_header() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;

        let id = storage.write_record(None, b"hello")?;
        assert_eq!(id.offset(), STORAGE_HEADER_SIZE as u64);
        // 16 byte header + 5 byte payload, aligned to 8
        assert_eq!(storage.size_in_bytes(), STORAGE_HEADER_SIZE as u64 + 24);
        Ok(())
    }

    #[test]
    fn test_unknown_ids_are_not_found() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;
        storage.write_record(None, b"only")?;

        let header_id = RecordId::from_raw(1).unwrap();
        let past_end = RecordId::from_raw(10_000).unwrap();
        assert!(matches!(
            storage.read_record(header_id),
            Err(BlobStorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.read_record(past_end),
            Err(BlobStorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.delete_record(past_end),
            Err(BlobStorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ids_inside_a_slot_are_not_found() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;

        // Payload that starts with something shaped like a slot header
        let mut payload = RecordHeader::actual(40, 40).encode();
        payload.extend_from_slice(&[5u8; 48]);
        let id = storage.write_record(None, &payload)?;
        let next = storage.write_record(None, b"next")?;
        let stats = storage.statistics();

        for step in 1..(payload.len() / RECORD_ALIGNMENT) as u32 {
            let inside = RecordId::from_raw(id.as_u32() + step).unwrap();
            assert!(matches!(
                storage.read_record(inside),
                Err(BlobStorageError::NotFound(_))
            ));
            assert!(matches!(
                storage.write_record(Some(inside), b"overwrite"),
                Err(BlobStorageError::NotFound(_))
            ));
            assert!(matches!(
                storage.delete_record(inside),
                Err(BlobStorageError::NotFound(_))
            ));
        }

        assert_eq!(storage.read_record(id)?, payload);
        assert_eq!(storage.read_record(next)?, b"next");
        assert_eq!(storage.statistics(), stats);
        assert_eq!(storage.scan_statistics()?, stats);
        Ok(())
    }

    #[test]
    fn test_relocating_through_latest_id_keeps_chains_short() -> Result<()> {
        let dir = tempdir()?;
        let config = BlobStorageConfig::builder().max_redirect_hops(2).build();
        let storage = BlobStorage::open_file(
            &dir.path().join("test.blob"),
            Box::new(ExactFit::default()),
            config,
        )?;

        let mut ids = vec![storage.write_record(None, b"0")?];
        for round in 1..=40usize {
            let latest = *ids.last().unwrap();
            let payload = vec![round as u8; round + 1];
            let id = storage.write_record(Some(latest), &payload)?;
            assert_ne!(id, latest);
            ids.push(id);
            for &old in &ids {
                assert_eq!(storage.read_record(old)?, payload);
                assert_eq!(storage.resolve_id(old)?, id);
            }
        }
        assert_eq!(storage.records_relocated(), 40);
        assert_eq!(storage.live_records_count(), 1);

        storage.delete_record(*ids.last().unwrap())?;
        for &id in &ids {
            assert!(matches!(
                storage.read_record(id),
                Err(BlobStorageError::Deleted(_))
            ));
        }
        assert_eq!(storage.live_records_count(), 0);
        assert_eq!(storage.scan_statistics()?, storage.statistics());
        Ok(())
    }

    #[test]
    fn test_records_never_cross_pages() -> Result<()> {
        let page_size = 512;
        let (_dir, storage) = open_test_storage(page_size)?;

        // 64 byte header + 3 * 144 byte slots leaves 16 bytes in the first page
        let payload = vec![7u8; 124];
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(storage.write_record(None, &payload)?);
        }
        assert_eq!(ids[3].offset(), page_size as u64);

        let states: Vec<RecordState> = storage.records().map(|r| r.map(|r| r.state())).collect::<BlobResult<_>>()?;
        assert_eq!(
            states,
            vec![
                RecordState::Actual,
                RecordState::Actual,
                RecordState::Actual,
                RecordState::Padding,
                RecordState::Actual
            ]
        );
        for id in ids {
            assert_eq!(storage.read_record(id)?, payload);
        }
        Ok(())
    }

    #[test]
    fn test_payload_limited_by_page() -> Result<()> {
        let page_size = 512;
        let (_dir, storage) = open_test_storage(page_size)?;
        let max = storage.max_payload_size();
        assert_eq!(max, page_size - RECORD_HEADER_SIZE);

        let id = storage.write_record(None, &vec![1u8; max])?;
        assert_eq!(storage.read_record(id)?.len(), max);

        let too_big = vec![1u8; max + 1];
        assert!(matches!(
            storage.write_record(None, &too_big),
            Err(BlobStorageError::Capacity { requested, .. }) if requested == max + 1
        ));
        assert!(matches!(
            storage.write_record(Some(id), &too_big),
            Err(BlobStorageError::Capacity { .. })
        ));
        assert_eq!(storage.records_allocated(), 1);
        Ok(())
    }

    #[test]
    fn test_relocation_rewrites_followed_chain() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;

        let first = storage.write_record(None, b"a")?;
        let second = storage.write_record(Some(first), b"bb")?;
        let third = storage.write_record(Some(first), b"ccc")?;
        assert_ne!(second, third);

        // The original id now points straight at the latest slot
        let original = storage
            .records()
            .find(|r| matches!(r, Ok(r) if r.id == first))
            .unwrap()?;
        assert_eq!(original.header.redirect(), Some(third));
        assert_eq!(storage.resolve_id(first)?, third);
        assert_eq!(storage.resolve_id(second)?, third);
        assert_eq!(storage.records_relocated(), 2);
        assert_eq!(storage.live_records_count(), 1);
        Ok(())
    }

    #[test]
    fn test_delete_tombstones_whole_chain() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;

        let first = storage.write_record(None, b"x")?;
        let moved_to = storage.write_record(Some(first), b"longer")?;
        storage.delete_record(first)?;

        for id in [first, moved_to] {
            assert!(matches!(
                storage.read_record(id),
                Err(BlobStorageError::Deleted(_))
            ));
        }
        let states: Vec<_> = storage
            .records()
            .map(|r| r.map(|r| r.header))
            .collect::<BlobResult<_>>()?;
        assert!(matches!(
            states[0],
            RecordHeader::Deleted { relocated: true, .. }
        ));
        assert!(matches!(
            states[1],
            RecordHeader::Deleted { relocated: false, .. }
        ));

        assert_eq!(storage.scan_statistics()?, storage.statistics());
        assert!(matches!(
            storage.delete_record(first),
            Err(BlobStorageError::Deleted(_))
        ));
        assert!(matches!(
            storage.write_record(Some(moved_to), b"again"),
            Err(BlobStorageError::Deleted(_))
        ));
        Ok(())
    }

    #[test]
    fn test_strategy_capacity_allows_growth_in_place() -> Result<()> {
        let dir = tempdir()?;
        let storage = BlobStorage::open_file(
            &dir.path().join("test.blob"),
            Box::new(SizeBuckets::new(32, usize::MAX)),
            BlobStorageConfig::default(),
        )?;

        let id = storage.write_record(None, b"tiny")?;
        assert_eq!(storage.total_live_records_capacity_bytes(), 32);
        let size = storage.size_in_bytes();

        assert_eq!(storage.write_record(Some(id), &[9u8; 30])?, id);
        assert_eq!(storage.size_in_bytes(), size);
        assert_eq!(storage.records_relocated(), 0);
        assert_eq!(storage.total_live_records_payload_bytes(), 30);
        Ok(())
    }

    #[test]
    fn test_operations_after_close_fail() -> Result<()> {
        let (_dir, storage) = open_test_storage(PAGE_SIZE)?;
        let id = storage.write_record(None, b"data")?;

        storage.close()?;
        storage.close()?;
        assert!(storage.is_closed());
        assert!(matches!(storage.read_record(id), Err(BlobStorageError::Closed)));
        assert!(matches!(
            storage.write_record(None, b"more"),
            Err(BlobStorageError::Closed)
        ));
        assert!(matches!(storage.flush(), Err(BlobStorageError::Closed)));
        assert!(matches!(storage.records().next(), Some(Err(BlobStorageError::Closed))));
        Ok(())
    }
}
