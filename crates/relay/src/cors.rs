// Browser access to the session-action endpoint.

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Board front-ends served by the usual dev servers.
const LOCAL_BOARD_ORIGINS: &str = "http://localhost:3000,http://localhost:5173,http://127.0.0.1:5173";

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginPolicy {
    Anyone,
    Listed(Vec<HeaderValue>),
}

impl OriginPolicy {
    fn parse(configured: Option<&str>) -> Self {
        match configured.map(str::trim) {
            Some("*") => Self::Anyone,
            Some(list) => Self::Listed(split_origins(list)),
            None => Self::Listed(split_origins(LOCAL_BOARD_ORIGINS)),
        }
    }
}

fn split_origins(list: &str) -> Vec<HeaderValue> {
    list.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

/// `"*"` opens the relay to any origin without credentials; a comma-separated
/// list allows exactly those origins; nothing configured allows local boards.
pub fn cors_layer(configured: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, REQUEST_ID])
        .expose_headers([REQUEST_ID])
        .max_age(Duration::from_secs(600));

    match OriginPolicy::parse(configured) {
        OriginPolicy::Anyone => layer.allow_origin(AllowOrigin::any()),
        OriginPolicy::Listed(origins) => layer.allow_origin(origins).allow_credentials(true),
    }
}
