//! The ordered collection of images in a search session, and their OCR state.
//!
//! Records are only ever changed through [`RecordStore`]'s methods, which keep
//! the invariants in one place:
//!
//! - a record never holds both extracted text and an error,
//! - an error is present exactly when the status is [`RecordStatus::Failed`],
//! - progress only moves forward while a record is in flight,
//! - every record's [`DisplayHandle`] is released exactly once, when the
//!   record leaves the store.

use std::{
    fmt, fs,
    sync::{Arc, Mutex, MutexGuard},
};

use schemars::JsonSchema;
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    errors::{AddError, CapacityError, ValidationError},
    images::SourceImage,
    prelude::*,
};

/// Maximum number of records in a store.
pub const MAX_RECORDS: usize = 100;

/// Stable record identifier. Random, so never reused.
pub type RecordId = Uuid;

/// Where a record is in its OCR lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Waiting to be sent to the OCR service.
    Pending,
    /// Waiting for a response from the OCR service.
    InFlight,
    /// Text was extracted.
    Done,
    /// Extraction failed. See `error`.
    Failed,
}

/// A renderable reference to a record's image, such as a preview file path.
///
/// Deliberately not `Clone`: a handle is handed back to its
/// [`PreviewProvider`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct DisplayHandle(String);

impl DisplayHandle {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates and releases [`DisplayHandle`]s for records.
pub trait PreviewProvider: Send + 'static {
    /// Create a handle for a new record.
    fn create(&mut self, id: RecordId, source: &SourceImage) -> Result<DisplayHandle>;

    /// Release a handle. Called once per handle, when its record is removed.
    fn release(&mut self, handle: DisplayHandle);
}

/// Previews stored as files in a temporary directory that lives as long as
/// the provider.
pub struct PreviewFiles {
    dir: TempDir,
}

impl PreviewFiles {
    pub fn new() -> Result<Self> {
        let dir = TempDir::with_prefix("photobox-previews")
            .context("Failed to create preview directory")?;
        Ok(Self { dir })
    }
}

impl PreviewProvider for PreviewFiles {
    fn create(&mut self, id: RecordId, source: &SourceImage) -> Result<DisplayHandle> {
        let extension = mime_guess::get_mime_extensions_str(&source.mime_type)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("img");
        let path = self.dir.path().join(format!("{id}.{extension}"));
        fs::write(&path, &source.data)
            .with_context(|| format!("Failed to write preview {:?}", path))?;
        Ok(DisplayHandle::new(path.to_string_lossy()))
    }

    fn release(&mut self, handle: DisplayHandle) {
        if let Err(err) = fs::remove_file(handle.as_str()) {
            warn!(handle = %handle, "Failed to remove preview: {err}");
        }
    }
}

/// One image and its OCR state.
#[derive(Debug)]
pub struct ImageRecord {
    id: RecordId,
    source: SourceImage,
    display_handle: Option<DisplayHandle>,
    extracted_text: Option<String>,
    status: RecordStatus,
    progress: u8,
    error: Option<String>,
}

impl ImageRecord {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn source(&self) -> &SourceImage {
        &self.source
    }

    #[allow(dead_code)]
    pub fn display_handle(&self) -> Option<&DisplayHandle> {
        self.display_handle.as_ref()
    }

    pub fn extracted_text(&self) -> Option<&str> {
        self.extracted_text.as_deref()
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// From 0 to 100.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Build an output record.
    pub fn to_report(&self, visible: bool) -> RecordReport {
        RecordReport {
            id: self.id.to_string(),
            filename: self.source.name.clone(),
            status: self.status,
            progress: self.progress,
            visible,
            text: self.extracted_text.clone(),
            error: self.error.clone(),
        }
    }

    /// Apply a state transition.
    fn apply(&mut self, update: RecordUpdate) {
        match update {
            RecordUpdate::Start => {
                self.status = RecordStatus::InFlight;
                self.error = None;
            }
            RecordUpdate::Progress(progress) => {
                if self.status == RecordStatus::InFlight {
                    self.progress = self.progress.max(progress.min(100));
                }
            }
            RecordUpdate::Done(text) => {
                self.status = RecordStatus::Done;
                self.extracted_text = Some(text);
                self.error = None;
                self.progress = 100;
            }
            RecordUpdate::Failed(error) => {
                self.status = RecordStatus::Failed;
                self.extracted_text = None;
                self.error = Some(error);
            }
            RecordUpdate::Reset => {
                self.status = RecordStatus::Pending;
                self.extracted_text = None;
                self.error = None;
                self.progress = 0;
            }
        }
    }
}

/// A partial change to one record. Each variant keeps the record's fields
/// consistent with each other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Mark the record as in flight.
    Start,
    /// Raise progress. Ignored unless in flight, and never lowers it.
    Progress(u8),
    /// Record extracted text, clearing any error.
    Done(String),
    /// Record a failure, clearing any text.
    Failed(String),
    /// Back to pending, with progress, text and error cleared.
    Reset,
}

/// What happened to a batch passed to [`RecordStore::add`].
#[derive(Debug, Default)]
pub struct AddReport {
    /// Ids of the new records, in input order.
    pub added: Vec<RecordId>,
    /// Inputs that were skipped.
    pub rejected: Vec<ValidationError>,
}

/// Status counts, for progress reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

impl RecordCounts {
    /// Records that reached a terminal state.
    pub fn processed(&self) -> usize {
        self.done + self.failed
    }
}

/// The ordered records of a session.
pub struct RecordStore {
    records: Vec<ImageRecord>,
    previews: Box<dyn PreviewProvider>,
    max_records: usize,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new(previews: Box<dyn PreviewProvider>) -> Self {
        Self {
            records: Vec::new(),
            previews,
            max_records: MAX_RECORDS,
        }
    }

    /// Add images in order. Non-images and oversized files are skipped and
    /// reported. If the remaining images would take us over
    /// [`MAX_RECORDS`], nothing is added.
    #[instrument(level = "debug", skip_all, fields(count = files.len()))]
    pub fn add(&mut self, files: Vec<SourceImage>) -> Result<AddReport, AddError> {
        let mut accepted = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();
        for file in files {
            match file.validate() {
                Ok(()) => accepted.push(file),
                Err(err) => {
                    warn!("Skipping input: {err}");
                    rejected.push(err);
                }
            }
        }

        if accepted.is_empty() {
            return Err(ValidationError::NoImages.into());
        }
        if self.records.len() + accepted.len() > self.max_records {
            return Err(CapacityError {
                existing: self.records.len(),
                incoming: accepted.len(),
                max: self.max_records,
            }
            .into());
        }

        let mut added = Vec::with_capacity(accepted.len());
        for source in accepted {
            let id = Uuid::new_v4();
            let display_handle = match self.previews.create(id, &source) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    // A missing preview doesn't stop us from OCRing the image.
                    warn!(name = %source.name, "Could not create preview: {err:?}");
                    None
                }
            };
            self.records.push(ImageRecord {
                id,
                source,
                display_handle,
                extracted_text: None,
                status: RecordStatus::Pending,
                progress: 0,
                error: None,
            });
            added.push(id);
        }
        debug!(added = added.len(), total = self.records.len(), "Added records");
        Ok(AddReport { added, rejected })
    }

    /// Apply `update` to the record with `id`. Returns `false` if there is no
    /// such record.
    pub fn update(&mut self, id: RecordId, update: RecordUpdate) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                trace!(%id, ?update, "Updating record");
                record.apply(update);
                true
            }
            None => false,
        }
    }

    /// Remove a record, releasing its display handle.
    #[allow(dead_code)]
    pub fn remove(&mut self, id: RecordId) -> bool {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return false;
        };
        let record = self.records.remove(index);
        self.release(record);
        true
    }

    /// Remove every record, releasing every display handle.
    pub fn clear(&mut self) {
        let records = std::mem::take(&mut self.records);
        for record in records {
            self.release(record);
        }
    }

    fn release(&mut self, mut record: ImageRecord) {
        if let Some(handle) = record.display_handle.take() {
            self.previews.release(handle);
        }
    }

    /// Reset every failed record to pending. Returns how many were reset.
    pub fn reset_failed(&mut self) -> usize {
        let mut count = 0;
        for record in &mut self.records {
            if record.status == RecordStatus::Failed {
                record.apply(RecordUpdate::Reset);
                count += 1;
            }
        }
        count
    }

    /// The first pending record in store order.
    pub fn next_pending(&self) -> Option<&ImageRecord> {
        self.records
            .iter()
            .find(|r| r.status == RecordStatus::Pending)
    }

    #[allow(dead_code)]
    pub fn get(&self, id: RecordId) -> Option<&ImageRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// All records, in the order they were added.
    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn counts(&self) -> RecordCounts {
        let mut counts = RecordCounts {
            total: self.records.len(),
            ..RecordCounts::default()
        };
        for record in &self.records {
            match record.status {
                RecordStatus::Pending => counts.pending += 1,
                RecordStatus::InFlight => counts.in_flight += 1,
                RecordStatus::Done => counts.done += 1,
                RecordStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A cloneable handle to a [`RecordStore`] shared between the batch runner
/// and whoever is driving it.
///
/// The lock is synchronous and must never be held across an `.await`.
#[derive(Clone)]
pub struct SharedStore(Arc<Mutex<RecordStore>>);

impl SharedStore {
    pub fn new(store: RecordStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    /// Lock the store.
    pub fn lock(&self) -> MutexGuard<'_, RecordStore> {
        self.0.lock().expect("lock poisoned")
    }

    /// Convenience wrapper for [`RecordStore::update`].
    pub fn update(&self, id: RecordId, update: RecordUpdate) -> bool {
        self.lock().update(id, update)
    }
}

/// One output row describing a record.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RecordReport {
    /// Record id.
    pub id: String,

    /// The original file name.
    pub filename: String,

    /// Final OCR status.
    pub status: RecordStatus,

    /// Progress, from 0 to 100.
    pub progress: u8,

    /// Did this record pass the keyword filter?
    pub visible: bool,

    /// Extracted text, if OCR succeeded.
    pub text: Option<String>,

    /// Why OCR failed, if it did.
    pub error: Option<String>,
}
