//! Response reset and problem serialization.
//!
//! Problem responses offer exactly two representations,
//! `application/problem+json` and `application/problem+xml`, picked from the
//! request's `Accept` header. JSON wins ties and is the fallback when nothing
//! matches.

use std::collections::HashSet;

use axum::body::Body;
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Response, StatusCode,
};
use mime::Mime;

use crate::{context::RequestHead, error::WriteError, problem::ProblemDetails, xml};

pub const APPLICATION_PROBLEM_JSON: &str = "application/problem+json";
pub const APPLICATION_PROBLEM_XML: &str = "application/problem+xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemFormat {
    Json,
    Xml,
}

impl ProblemFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => APPLICATION_PROBLEM_JSON,
            Self::Xml => APPLICATION_PROBLEM_XML,
        }
    }

    /// Pick the representation the client prefers.
    ///
    /// Each format takes the quality of its most specific matching media
    /// range; `q=0` excludes it.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let ranges: Vec<Mime> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|r| r.trim().parse::<Mime>().ok())
            .collect();

        if ranges.is_empty() {
            return Self::Json;
        }

        let json = quality(&ranges, Self::Json);
        let xml = quality(&ranges, Self::Xml);
        if xml > json {
            Self::Xml
        } else {
            Self::Json
        }
    }

    fn matches(self, range: &Mime) -> Option<u8> {
        if range.type_() == mime::STAR {
            return Some(0);
        }
        let family = match self {
            Self::Json => mime::JSON,
            Self::Xml => mime::XML,
        };
        if range.type_() == mime::APPLICATION && range.subtype() == mime::STAR {
            return Some(1);
        }
        let exact = range.subtype() == family || range.suffix() == Some(family);
        let type_ok = range.type_() == mime::APPLICATION
            || (self == Self::Xml && range.type_() == mime::TEXT);
        (exact && type_ok).then_some(2)
    }
}

fn quality(ranges: &[Mime], format: ProblemFormat) -> f32 {
    ranges
        .iter()
        .filter_map(|range| {
            let specificity = format.matches(range)?;
            let q = range
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((specificity, q))
        })
        .max_by_key(|(specificity, _)| *specificity)
        .map_or(0.0, |(_, q)| q)
}

/// A fresh response head for a problem.
///
/// Cache-defeating headers are always set. Headers of `previous` whose names
/// are allow-listed are carried over with all their values; everything else
/// is dropped.
pub fn clear_response(
    previous: Option<&HeaderMap>,
    allowed: &HashSet<HeaderName>,
    status: StatusCode,
) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    // Make sure problem responses are never cached.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));

    if let Some(previous) = previous {
        for (name, value) in previous {
            if allowed.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }

    response
}

/// Serialize `details` onto a cleared response.
///
/// The status is the payload's own status when set, else the cleared one.
pub fn write_problem(
    head: &RequestHead,
    cleared: Response<()>,
    details: &ProblemDetails,
) -> Result<Response<Body>, WriteError> {
    let format = ProblemFormat::negotiate(&head.headers);
    let bytes = match format {
        ProblemFormat::Json => serde_json::to_vec(details)?,
        ProblemFormat::Xml => xml::to_xml(details)?.into_bytes(),
    };

    let (mut parts, ()) = cleared.into_parts();
    if let Some(status) = details.status {
        parts.status = status;
    }
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));

    Ok(Response::from_parts(parts, Body::from(bytes)))
}
