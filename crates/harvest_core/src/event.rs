use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

/// Longest resumption cursor the metadata store accepts.
pub const MAX_PERSISTED_CURSOR_CHARS: usize = 255;

/// Outcome of one page request. Every listener must handle all five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Ok,
    NoMatchingQuery,
    ErrorRetry,
    ErrorFatal,
    StopSignalReceived,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ok => "OK",
            EventStatus::NoMatchingQuery => "NO_MATCHING_QUERY",
            EventStatus::ErrorRetry => "ERROR_RETRY",
            EventStatus::ErrorFatal => "ERROR_FATAL",
            EventStatus::StopSignalReceived => "STOP_SIGNAL_RECEIVED",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One non-deleted record extracted from a ListRecords page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub identifier: String,
    pub datestamp: DateTime<Utc>,
    pub set_specs: Vec<String>,
    /// Format `metadata` is expressed in: the storage schema after transformation,
    /// otherwise the harvested prefix.
    pub format: String,
    /// Serialized XML of the element inside `<metadata>`.
    pub metadata: String,
}

/// Everything one page produced.
///
/// Built fresh for every page and handed over by value, so a listener can never
/// see data from a page other than the one it is handling. Deleted identifiers
/// and ordinary records are kept disjoint: a deletion evicts a record with the
/// same identifier and a record is refused once its identifier is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestingEvent {
    pub status: EventStatus,
    pub origin_url: String,
    pub metadata_prefix: String,
    pub message: Option<String>,
    resumption_token: Option<String>,
    records: Vec<RecordMetadata>,
    deleted_identifiers: BTreeSet<String>,
    missing_identifiers: BTreeSet<String>,
    record_missing: bool,
}

impl HarvestingEvent {
    pub fn new(
        status: EventStatus,
        origin_url: impl Into<String>,
        metadata_prefix: impl Into<String>,
    ) -> Self {
        Self {
            status,
            origin_url: origin_url.into(),
            metadata_prefix: metadata_prefix.into(),
            message: None,
            resumption_token: None,
            records: Vec::new(),
            deleted_identifiers: BTreeSet::new(),
            missing_identifiers: BTreeSet::new(),
            record_missing: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_resumption_token(mut self, token: Option<String>) -> Self {
        self.resumption_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Adds a record; returns `false` if its identifier is already deleted in this page.
    pub fn push_record(&mut self, record: RecordMetadata) -> bool {
        if self.deleted_identifiers.contains(&record.identifier) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn push_deleted(&mut self, identifier: impl Into<String>) {
        let identifier = identifier.into();
        self.records.retain(|r| r.identifier != identifier);
        self.deleted_identifiers.insert(identifier);
    }

    pub fn push_missing(&mut self, identifier: impl Into<String>) {
        self.missing_identifiers.insert(identifier.into());
        self.record_missing = true;
    }

    pub fn records(&self) -> &[RecordMetadata] {
        &self.records
    }

    pub fn take_records(&mut self) -> Vec<RecordMetadata> {
        std::mem::take(&mut self.records)
    }

    pub fn deleted_identifiers(&self) -> &BTreeSet<String> {
        &self.deleted_identifiers
    }

    pub fn missing_identifiers(&self) -> &BTreeSet<String> {
        &self.missing_identifiers
    }

    pub fn is_record_missing(&self) -> bool {
        self.record_missing
    }

    /// Full cursor, exactly as the server sent it.
    pub fn resumption_token(&self) -> Option<&str> {
        self.resumption_token.as_deref()
    }

    /// Cursor as it may be stored: at most [`MAX_PERSISTED_CURSOR_CHARS`] characters.
    pub fn persisted_resumption_token(&self) -> Option<&str> {
        self.resumption_token.as_deref().map(truncate_cursor)
    }

    pub fn has_more_pages(&self) -> bool {
        self.resumption_token.is_some()
    }
}

/// Cuts a cursor to [`MAX_PERSISTED_CURSOR_CHARS`] characters on a char boundary.
pub fn truncate_cursor(token: &str) -> &str {
    match token.char_indices().nth(MAX_PERSISTED_CURSOR_CHARS) {
        Some((end, _)) => &token[..end],
        None => token,
    }
}
