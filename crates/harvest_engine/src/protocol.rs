//! OAI-PMH verbs, arguments and error codes.

use url::Url;

use crate::{FaultKind, OaiError};

/// Error codes defined by OAI-PMH 2.0; anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OaiErrorCode {
    BadArgument,
    BadResumptionToken,
    BadVerb,
    CannotDisseminateFormat,
    IdDoesNotExist,
    NoRecordsMatch,
    NoMetadataFormats,
    NoSetHierarchy,
    Other(String),
}

impl OaiErrorCode {
    pub fn parse(code: &str) -> Self {
        match code.trim() {
            "badArgument" => OaiErrorCode::BadArgument,
            "badResumptionToken" => OaiErrorCode::BadResumptionToken,
            "badVerb" => OaiErrorCode::BadVerb,
            "cannotDisseminateFormat" => OaiErrorCode::CannotDisseminateFormat,
            "idDoesNotExist" => OaiErrorCode::IdDoesNotExist,
            "noRecordsMatch" => OaiErrorCode::NoRecordsMatch,
            "noMetadataFormats" => OaiErrorCode::NoMetadataFormats,
            "noSetHierarchy" => OaiErrorCode::NoSetHierarchy,
            other => OaiErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OaiErrorCode::BadArgument => "badArgument",
            OaiErrorCode::BadResumptionToken => "badResumptionToken",
            OaiErrorCode::BadVerb => "badVerb",
            OaiErrorCode::CannotDisseminateFormat => "cannotDisseminateFormat",
            OaiErrorCode::IdDoesNotExist => "idDoesNotExist",
            OaiErrorCode::NoRecordsMatch => "noRecordsMatch",
            OaiErrorCode::NoMetadataFormats => "noMetadataFormats",
            OaiErrorCode::NoSetHierarchy => "noSetHierarchy",
            OaiErrorCode::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OaiRequest<'a> {
    Identify,
    ListSets {
        resumption_token: Option<&'a str>,
    },
    /// First page of a ListRecords sequence.
    ListRecords {
        metadata_prefix: &'a str,
        set: Option<&'a str>,
        from: Option<&'a str>,
        until: Option<&'a str>,
    },
    /// Follow-up page; the token is exclusive with every other argument.
    ResumeListRecords {
        resumption_token: &'a str,
    },
}

impl OaiRequest<'_> {
    pub fn verb(&self) -> &'static str {
        match self {
            OaiRequest::Identify => "Identify",
            OaiRequest::ListSets { .. } => "ListSets",
            OaiRequest::ListRecords { .. } | OaiRequest::ResumeListRecords { .. } => "ListRecords",
        }
    }

    /// Appends the verb and its arguments to `base_url`.
    pub fn to_url(&self, base_url: &str) -> Result<Url, OaiError> {
        let mut url = Url::parse(base_url.trim())
            .map_err(|err| OaiError::new(FaultKind::InvalidUrl, format!("{base_url}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(OaiError::new(
                FaultKind::InvalidUrl,
                format!("unsupported scheme in {base_url}"),
            ));
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("verb", self.verb());
            match *self {
                OaiRequest::Identify => {}
                OaiRequest::ListSets { resumption_token } => {
                    if let Some(token) = resumption_token {
                        query.append_pair("resumptionToken", token);
                    }
                }
                OaiRequest::ListRecords {
                    metadata_prefix,
                    set,
                    from,
                    until,
                } => {
                    query.append_pair("metadataPrefix", metadata_prefix);
                    for (key, value) in [("set", set), ("from", from), ("until", until)] {
                        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                            query.append_pair(key, value);
                        }
                    }
                }
                OaiRequest::ResumeListRecords { resumption_token } => {
                    query.append_pair("resumptionToken", resumption_token);
                }
            }
        }
        Ok(url)
    }
}
