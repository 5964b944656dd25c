//! Paging loop over one ListRecords sequence.
//!
//! A harvest call walks the resumption-token chain one page at a time and
//! reports every page, retry and terminal outcome to its listener as a
//! [`HarvestingEvent`]. Recoverable faults re-request the same page after an
//! exponentially growing sleep; the backoff state lives only for the duration
//! of one call.

use std::sync::{Arc, Mutex};

use harvest_core::{
    format_with_granularity, parse_datestamp, Backoff, EventStatus, HarvestingEvent,
    RecordMetadata, RetryDecision, RetryPolicy, DEFAULT_GRANULARITY,
};
use harvest_logging::{harvest_debug, harvest_error, harvest_info, harvest_warn};
use tokio_util::sync::CancellationToken;

use crate::decode::decode_xml;
use crate::fetch::{PageFetcher, ReqwestFetcher};
use crate::parse::{parse_response, MetadataNode, OaiResponse, OaiSet, RepositoryIdentity};
use crate::protocol::{OaiErrorCode, OaiRequest};
use crate::transform::{FormatTransformer, TransformParams};
use crate::{FaultClass, FaultKind, OaiError};

/// Arguments of one harvest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRequest {
    pub origin_url: String,
    pub set: Option<String>,
    pub metadata_prefix: String,
    /// Schema records are stored in; equal to the prefix when no transformation applies.
    pub storage_schema: String,
    pub from: Option<String>,
    pub until: Option<String>,
    /// Resume an interrupted sequence instead of starting from the first page.
    pub resumption_token: Option<String>,
    pub max_retries: u32,
}

impl HarvestRequest {
    pub fn new(origin_url: impl Into<String>, metadata_prefix: impl Into<String>) -> Self {
        let metadata_prefix = metadata_prefix.into();
        Self {
            origin_url: origin_url.into(),
            set: None,
            storage_schema: metadata_prefix.clone(),
            metadata_prefix,
            from: None,
            until: None,
            resumption_token: None,
            max_retries: RetryPolicy::default().max_retries,
        }
    }

    fn needs_transformation(&self) -> bool {
        !self.storage_schema.trim().is_empty() && self.storage_schema != self.metadata_prefix
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receives every event of a harvest call, in order.
#[async_trait::async_trait]
pub trait HarvestListener: Send {
    /// An error aborts the harvest call that produced the event.
    async fn on_event(&mut self, event: HarvestingEvent) -> Result<(), ListenerError>;
}

#[async_trait::async_trait]
pub trait Harvester: Send + Sync {
    async fn harvest(&self, request: &HarvestRequest, listener: &mut dyn HarvestListener);

    async fn identify(&self, origin_url: &str) -> Result<RepositoryIdentity, OaiError>;

    async fn list_sets(&self, origin_url: &str) -> Result<Vec<OaiSet>, OaiError>;

    /// Raises the stop signal; observed before the next page request.
    fn stop(&self);

    /// Clears the stop signal so the harvester can be reused.
    fn reset(&self);
}

#[derive(Debug, Default)]
struct StopSignal(Mutex<CancellationToken>);

impl StopSignal {
    fn current(&self) -> CancellationToken {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn raise(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    fn clear(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
    }
}

pub struct OaiHarvester {
    fetcher: Arc<dyn PageFetcher>,
    transformer: Option<Arc<dyn FormatTransformer>>,
    retry: RetryPolicy,
    stop: StopSignal,
}

impl OaiHarvester {
    pub fn new(fetcher: Arc<dyn PageFetcher>, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            transformer: None,
            retry,
            stop: StopSignal::default(),
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn FormatTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    async fn request(&self, base_url: &str, request: OaiRequest<'_>) -> Result<OaiResponse, OaiError> {
        let url = request.to_url(base_url)?;
        harvest_debug!("GET {url}");
        let output = self.fetcher.fetch(&url).await?;
        let decoded = decode_xml(&output.bytes, output.metadata.content_type.as_deref())
            .map_err(|err| OaiError::new(FaultKind::Decode, err.to_string()))?;
        parse_response(&decoded.xml)
    }

    async fn fetch_page(
        &self,
        request: &HarvestRequest,
        cursor: Option<&str>,
    ) -> Result<HarvestingEvent, OaiError> {
        let oai_request = match cursor {
            Some(resumption_token) => OaiRequest::ResumeListRecords { resumption_token },
            None => OaiRequest::ListRecords {
                metadata_prefix: &request.metadata_prefix,
                set: request.set.as_deref(),
                from: request.from.as_deref(),
                until: request.until.as_deref(),
            },
        };
        let response = self.request(&request.origin_url, oai_request).await?;
        if let Some(fault) = response.protocol_fault() {
            return Err(fault);
        }
        self.build_event(request, response)
    }

    fn build_event(
        &self,
        request: &HarvestRequest,
        response: OaiResponse,
    ) -> Result<HarvestingEvent, OaiError> {
        let mut event = HarvestingEvent::new(
            EventStatus::Ok,
            request.origin_url.clone(),
            request.metadata_prefix.clone(),
        )
        .with_resumption_token(response.resumption_token);

        for raw in response.records {
            if !raw.has_header {
                return Err(OaiError::new(
                    FaultKind::MissingStructure,
                    "record without <header>",
                ));
            }
            let identifier = raw
                .identifier
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    OaiError::new(FaultKind::MissingStructure, "record header without <identifier>")
                })?;
            if raw.deleted {
                event.push_deleted(identifier);
                continue;
            }
            let datestamp = raw.datestamp.unwrap_or_default();
            let datestamp = parse_datestamp(&datestamp)
                .map_err(|err| OaiError::new(FaultKind::Datestamp, format!("{identifier}: {err}")))?;

            let metadata = match raw.metadata {
                MetadataNode::Absent => {
                    event.push_missing(identifier);
                    continue;
                }
                MetadataNode::Empty => {
                    return Err(OaiError::new(
                        FaultKind::MissingStructure,
                        format!("<metadata> of {identifier} has no content"),
                    ));
                }
                MetadataNode::Xml(xml) => xml,
            };

            let (format, metadata) = if request.needs_transformation() {
                let params = TransformParams {
                    identifier: identifier.clone(),
                    timestamp: format_with_granularity(&datestamp, DEFAULT_GRANULARITY),
                };
                (request.storage_schema.clone(), self.transform(request, &metadata, &params)?)
            } else {
                (request.metadata_prefix.clone(), metadata)
            };

            event.push_record(RecordMetadata {
                identifier,
                datestamp,
                set_specs: raw.set_specs,
                format,
                metadata,
            });
        }
        Ok(event)
    }

    fn transform(
        &self,
        request: &HarvestRequest,
        metadata: &str,
        params: &TransformParams,
    ) -> Result<String, OaiError> {
        let transformer = self.transformer.as_ref().ok_or_else(|| {
            OaiError::new(
                FaultKind::Transform,
                format!(
                    "no transformer for {} -> {}",
                    request.metadata_prefix, request.storage_schema
                ),
            )
        })?;
        transformer
            .transform(&request.metadata_prefix, &request.storage_schema, metadata, params)
            .map_err(|err| OaiError::new(FaultKind::Transform, err.to_string()))
    }
}

impl Default for OaiHarvester {
    fn default() -> Self {
        Self::new(Arc::new(ReqwestFetcher::default()), RetryPolicy::default())
    }
}

fn event_for(request: &HarvestRequest, status: EventStatus) -> HarvestingEvent {
    HarvestingEvent::new(
        status,
        request.origin_url.clone(),
        request.metadata_prefix.clone(),
    )
}

#[async_trait::async_trait]
impl Harvester for OaiHarvester {
    async fn harvest(&self, request: &HarvestRequest, listener: &mut dyn HarvestListener) {
        let stop = self.stop.current();
        let mut backoff = Backoff::from_policy(&self.retry, request.max_retries);
        let mut cursor = request
            .resumption_token
            .clone()
            .filter(|t| !t.trim().is_empty());
        let mut first_page = cursor.is_none();
        let mut pages = 0u64;

        harvest_info!(
            "Harvesting {} (set: {}, prefix: {}, from: {})",
            request.origin_url,
            request.set.as_deref().unwrap_or("-"),
            request.metadata_prefix,
            request.from.as_deref().unwrap_or("-")
        );

        while first_page || cursor.is_some() {
            if stop.is_cancelled() {
                harvest_info!("Stop signal received after {pages} pages");
                let event = event_for(request, EventStatus::StopSignalReceived)
                    .with_message("stop signal received")
                    .with_resumption_token(cursor.clone());
                if let Err(err) = listener.on_event(event).await {
                    harvest_error!("{err}");
                }
                return;
            }

            match self.fetch_page(request, cursor.as_deref()).await {
                Ok(event) => {
                    backoff.reset();
                    first_page = false;
                    pages += 1;
                    let next = event.resumption_token().map(str::to_string);
                    harvest_debug!(
                        "Page {pages}: {} records, {} deleted, more: {}",
                        event.records().len(),
                        event.deleted_identifiers().len(),
                        next.is_some()
                    );
                    if let Err(err) = listener.on_event(event).await {
                        harvest_error!("Aborting harvest of {}: {err}", request.origin_url);
                        return;
                    }
                    cursor = next;
                }
                Err(err) => {
                    let (status, retry_after) = match err.classify() {
                        FaultClass::NoMatch => (EventStatus::NoMatchingQuery, None),
                        FaultClass::Fatal => (EventStatus::ErrorFatal, None),
                        FaultClass::Retry => match backoff.register_failure() {
                            RetryDecision::Retry { attempt, delay } => {
                                harvest_warn!(
                                    "Retry {attempt}/{} in {delay:?}: {err}",
                                    request.max_retries
                                );
                                (EventStatus::ErrorRetry, Some(delay))
                            }
                            RetryDecision::Exhausted { attempts } => {
                                harvest_error!("Giving up after {attempts} attempts: {err}");
                                (EventStatus::ErrorFatal, None)
                            }
                        },
                    };
                    if status == EventStatus::ErrorFatal {
                        harvest_error!("Harvest of {} failed: {err}", request.origin_url);
                    }

                    let event = event_for(request, status)
                        .with_message(err.to_string())
                        .with_resumption_token(cursor.clone());
                    if let Err(err) = listener.on_event(event).await {
                        harvest_error!("Aborting harvest of {}: {err}", request.origin_url);
                        return;
                    }

                    let Some(delay) = retry_after else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => {}
                    }
                }
            }
        }
        harvest_info!("Harvest of {} complete after {pages} pages", request.origin_url);
    }

    async fn identify(&self, origin_url: &str) -> Result<RepositoryIdentity, OaiError> {
        let response = self.request(origin_url, OaiRequest::Identify).await?;
        if let Some(fault) = response.protocol_fault() {
            return Err(fault);
        }
        response.identity.ok_or_else(|| {
            OaiError::new(FaultKind::MissingStructure, "Identify response without <Identify>")
        })
    }

    async fn list_sets(&self, origin_url: &str) -> Result<Vec<OaiSet>, OaiError> {
        let mut sets = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = OaiRequest::ListSets {
                resumption_token: cursor.as_deref(),
            };
            let response = self.request(origin_url, request).await?;
            if let Some(fault) = response.protocol_fault() {
                if fault.kind == FaultKind::Protocol(OaiErrorCode::NoSetHierarchy) {
                    return Ok(sets);
                }
                return Err(fault);
            }
            sets.extend(response.sets);
            match response.resumption_token {
                Some(token) => cursor = Some(token),
                None => return Ok(sets),
            }
        }
    }

    fn stop(&self) {
        self.stop.raise();
    }

    fn reset(&self) {
        self.stop.clear();
    }
}
