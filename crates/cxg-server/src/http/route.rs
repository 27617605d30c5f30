// SPDX-License-Identifier: Apache-2.0

//! Dataset URL shapes and the operation table.

use crate::ops::Media;
use axum::extract::Query;
use axum::http::{Method, Uri};
use cxg_core::CxgError;
use std::collections::HashMap;

const API_MARKERS: [&str; 2] = ["/api/v0.3/", "/api/v0.2/"];
const CUSTOM_SEGMENT: &str = "custom-cxgs/";
const STORE_URI_SEGMENT: &str = "s3_uri";

/// Where the dataset of a request lives, as named by its URL prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `/{tag}/{dataset}/api/...`
    Dataroot { tag: String, dataset: String },
    /// `/{tag}/custom-cxgs/{path}/api/...`
    Custom { tag: String, dataset: String },
    /// `/s3_uri/{encoded uri}/api/...`
    StoreUri(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    S3Uri,
    Schema,
    Config,
    AnnotationsObs,
    AnnotationsVar,
    DataVar,
    Colors,
    DiffexpObs,
    DiffexpObs2,
    LayoutObs,
    Genesets,
    SummarizeVar,
    DatasetMetadata,
}

/// Outcome of matching a method against an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSupport {
    Allowed,
    /// Part of the API surface but never served (user mutations).
    NotImplemented,
    NotAllowed,
}

const OPS: [Op; 13] = [
    Op::S3Uri,
    Op::Schema,
    Op::Config,
    Op::AnnotationsObs,
    Op::AnnotationsVar,
    Op::DataVar,
    Op::Colors,
    Op::DiffexpObs,
    Op::DiffexpObs2,
    Op::LayoutObs,
    Op::Genesets,
    Op::SummarizeVar,
    Op::DatasetMetadata,
];

impl Op {
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        OPS.into_iter().find(|op| op.route() == path)
    }

    #[must_use]
    pub const fn route(self) -> &'static str {
        match self {
            Self::S3Uri => "s3_uri",
            Self::Schema => "schema",
            Self::Config => "config",
            Self::AnnotationsObs => "annotations/obs",
            Self::AnnotationsVar => "annotations/var",
            Self::DataVar => "data/var",
            Self::Colors => "colors",
            Self::DiffexpObs => "diffexp/obs",
            Self::DiffexpObs2 => "diffexp/obs2",
            Self::LayoutObs => "layout/obs",
            Self::Genesets => "genesets",
            Self::SummarizeVar => "summarize/var",
            Self::DatasetMetadata => "dataset-metadata",
        }
    }

    /// Media type of a successful response.
    #[must_use]
    pub const fn media(self) -> Media {
        match self {
            Self::AnnotationsObs
            | Self::AnnotationsVar
            | Self::DataVar
            | Self::DiffexpObs2
            | Self::LayoutObs
            | Self::SummarizeVar => Media::Matrix,
            _ => Media::Json,
        }
    }

    #[must_use]
    pub fn method_support(self, method: &Method) -> MethodSupport {
        let allowed = match self {
            Self::DiffexpObs | Self::DiffexpObs2 => *method == Method::POST,
            Self::DataVar => *method == Method::GET || *method == Method::PUT,
            Self::SummarizeVar => *method == Method::GET || *method == Method::POST,
            _ => *method == Method::GET,
        };
        if allowed {
            return MethodSupport::Allowed;
        }
        let mutation = match self {
            Self::Genesets => *method == Method::PUT,
            Self::AnnotationsObs => *method == Method::PUT || *method == Method::DELETE,
            _ => false,
        };
        if mutation {
            MethodSupport::NotImplemented
        } else {
            MethodSupport::NotAllowed
        }
    }

    /// Content type a request body must carry, if the method takes one.
    #[must_use]
    pub fn body_media(self, method: &Method) -> Option<&'static str> {
        match self {
            Self::DiffexpObs | Self::DiffexpObs2 if *method == Method::POST => {
                Some("application/json")
            }
            Self::DataVar if *method == Method::PUT => Some("application/json"),
            Self::SummarizeVar if *method == Method::POST => {
                Some("application/x-www-form-urlencoded")
            }
            _ => None,
        }
    }
}

/// Splits a request path into its dataset target and operation path.
/// Returns `None` for paths outside the dataset API.
#[must_use]
pub fn split_api_path(path: &str) -> Option<(Target, String)> {
    let (prefix, op) = API_MARKERS
        .iter()
        .filter_map(|marker| path.find(marker).map(|at| (at, marker.len())))
        .min_by_key(|(at, _)| *at)
        .map(|(at, len)| (&path[..at], &path[at + len..]))?;
    let op = op.trim_end_matches('/').to_string();
    let (first, rest) = prefix.trim_start_matches('/').split_once('/')?;
    if first.is_empty() || rest.is_empty() {
        return None;
    }
    if first == STORE_URI_SEGMENT {
        return decode_segment(rest).map(|uri| (Target::StoreUri(uri), op));
    }
    let tag = first.to_string();
    match rest.strip_prefix(CUSTOM_SEGMENT) {
        Some(dataset) if !dataset.is_empty() => Some((
            Target::Custom {
                tag,
                dataset: dataset.to_string(),
            },
            op,
        )),
        Some(_) => None,
        None => Some((
            Target::Dataroot {
                tag,
                dataset: rest.to_string(),
            },
            op,
        )),
    }
}

/// Percent-decodes one path segment. `+` stays literal, as in paths.
fn decode_segment(raw: &str) -> Option<String> {
    let escaped = raw.replace('+', "%2B").replace('&', "%26");
    let uri: Uri = format!("/?v={escaped}").parse().ok()?;
    let Query(mut values) = Query::<HashMap<String, String>>::try_from_uri(&uri).ok()?;
    values.remove("v").filter(|v| !v.is_empty())
}

/// Parses `a=1&b=2` into ordered pairs, keeping repeated keys.
pub fn parse_pairs(raw: Option<&str>) -> Result<Vec<(String, String)>, CxgError> {
    let raw = match raw {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(Vec::new()),
    };
    let uri: Uri = format!("/?{raw}")
        .parse()
        .map_err(|_| CxgError::filter("malformed query string"))?;
    Query::<Vec<(String, String)>>::try_from_uri(&uri)
        .map(|Query(pairs)| pairs)
        .map_err(|e| CxgError::filter(format!("malformed query string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_prefixes_are_classified() {
        assert_eq!(
            split_api_path("/d/pbmc3k.cxg/api/v0.3/schema"),
            Some((
                Target::Dataroot {
                    tag: "d".to_string(),
                    dataset: "pbmc3k.cxg".to_string()
                },
                "schema".to_string()
            ))
        );
        assert_eq!(
            split_api_path("/d/nested/pbmc3k.cxg/api/v0.2/annotations/obs/"),
            Some((
                Target::Dataroot {
                    tag: "d".to_string(),
                    dataset: "nested/pbmc3k.cxg".to_string()
                },
                "annotations/obs".to_string()
            ))
        );
        assert_eq!(
            split_api_path("/u/custom-cxgs/userID-7/a.cxg/api/v0.3/config"),
            Some((
                Target::Custom {
                    tag: "u".to_string(),
                    dataset: "userID-7/a.cxg".to_string()
                },
                "config".to_string()
            ))
        );
        assert_eq!(
            split_api_path("/s3_uri/s3%3A%2F%2Fcells%2Fprod%2Fa+b.cxg/api/v0.3/s3_uri"),
            Some((
                Target::StoreUri("s3://cells/prod/a+b.cxg".to_string()),
                "s3_uri".to_string()
            ))
        );
        assert_eq!(split_api_path("/health"), None);
        assert_eq!(split_api_path("/d/api/v0.3/schema"), None);
        assert_eq!(split_api_path("/u/custom-cxgs//api/v0.3/schema").map(|r| r.1), None);
    }

    #[test]
    fn methods_map_to_support() {
        assert_eq!(Op::from_path("data/var"), Some(Op::DataVar));
        assert_eq!(Op::from_path("data/obs"), None);
        assert_eq!(
            Op::DataVar.method_support(&Method::PUT),
            MethodSupport::Allowed
        );
        assert_eq!(
            Op::Genesets.method_support(&Method::PUT),
            MethodSupport::NotImplemented
        );
        assert_eq!(
            Op::AnnotationsObs.method_support(&Method::DELETE),
            MethodSupport::NotImplemented
        );
        assert_eq!(
            Op::Schema.method_support(&Method::POST),
            MethodSupport::NotAllowed
        );
        assert_eq!(
            Op::DiffexpObs.method_support(&Method::GET),
            MethodSupport::NotAllowed
        );
        assert_eq!(Op::DiffexpObs2.media(), Media::Matrix);
        assert_eq!(Op::Colors.media(), Media::Json);
    }

    #[test]
    fn repeated_query_keys_are_kept_in_order() {
        let pairs = parse_pairs(Some("var%3Agene=A&var%3Agene=B&method=mean")).expect("pairs");
        assert_eq!(
            pairs,
            vec![
                ("var:gene".to_string(), "A".to_string()),
                ("var:gene".to_string(), "B".to_string()),
                ("method".to_string(), "mean".to_string()),
            ]
        );
        assert!(parse_pairs(None).expect("empty").is_empty());
    }
}
