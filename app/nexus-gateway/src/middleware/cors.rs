//! CORS handling driven by the dynamic configuration

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, Response, StatusCode};
use axum::middleware::Next;
use std::sync::Arc;

use crate::dynamic::DynamicConfigHolder;

/// Apply the configured CORS policy; `OPTIONS` preflights short-circuit
/// with 204.
pub async fn cors(
    State(holder): State<Arc<DynamicConfigHolder>>,
    request: Request,
    next: Next,
) -> Response<Body> {
    let cfg = holder.load();
    if !cfg.cors.enabled {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if origin.is_empty() {
        return next.run(request).await;
    }

    let allow_all = cfg.cors.allow_origins.iter().any(|o| o == "*");
    let allowed = allow_all || cfg.cors.allow_origins.iter().any(|o| *o == origin);
    let is_preflight = request.method() == Method::OPTIONS;

    let mut response = if is_preflight {
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("static response")
    } else {
        next.run(request).await
    };

    if allowed {
        let headers = response.headers_mut();
        // the wildcard origin cannot be combined with credentials
        if allow_all && !cfg.cors.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        } else if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }

        if let Ok(value) = HeaderValue::from_str(&cfg.cors.allow_methods.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }
        if let Ok(value) = HeaderValue::from_str(&cfg.cors.allow_headers.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
        if let Ok(value) = HeaderValue::from_str(&cfg.cors.max_age_sec.to_string()) {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, value);
        }
        if cfg.cors.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }

    response
}
