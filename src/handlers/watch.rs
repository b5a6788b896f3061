//! Watch handlers.
//!
//! A watch response is a stream of newline-delimited JSON events,
//! `{"type":"ADDED","object":{...}}`.  A registry error ends the stream
//! after a final `ERROR` event carrying a `Status`.  Streams are closed by
//! the server after [`WATCH_TIMEOUT`]; clients resume from the last
//! resource version they saw.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Extension,
};
use bytes::Bytes;
use futures::{future, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use super::{RequestContext, SelectorParams};
use crate::api::{ApiVersion, Object, Versioned};
use crate::errors::ApiError;
use crate::metrics::record_watch_event;
use crate::watch::{Event, EventType, WatchStream};
use crate::AppState;

/// Longest time a single watch stays open.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn encode_line<S: Serialize>(value: &S) -> Option<Bytes> {
    match serde_json::to_vec(value) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(e) => {
            warn!("dropping unencodable watch event: {}", e);
            None
        }
    }
}

/// Render a watch stream as a chunked NDJSON response.
pub fn watch_response<T: Object>(
    stream: WatchStream<T>,
    version: ApiVersion,
    resource: &'static str,
) -> Response {
    let lines = stream
        .take_until(tokio::time::sleep(WATCH_TIMEOUT))
        .scan(false, move |failed, item| {
            if *failed {
                return future::ready(None);
            }
            let line = match item {
                Ok(event) => {
                    record_watch_event(resource, event.kind.as_str());
                    encode_line(&Event::new(event.kind, Versioned::new(version, event.object)))
                }
                Err(e) => {
                    *failed = true;
                    debug!("watch on {} ended: {}", resource, e);
                    record_watch_event(resource, EventType::Error.as_str());
                    encode_line(&Event::new(EventType::Error, ApiError::from(e).to_status()))
                }
            };
            future::ready(Some(line))
        })
        .filter_map(future::ready)
        .map(Ok::<_, Infallible>);

    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(lines),
    )
        .into_response()
}

/// `GET /watch/services`
pub async fn watch_services(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Query(params): Query<SelectorParams>,
) -> Result<Response, ApiError> {
    let stream = state
        .services
        .watch_services(
            &ctx,
            params.label_selector()?,
            params.field_selector()?,
            params.resource_version()?,
        )
        .await?;
    Ok(watch_response(stream, version, "services"))
}

/// `GET /watch/endpoints`
pub async fn watch_endpoints(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Query(params): Query<SelectorParams>,
) -> Result<Response, ApiError> {
    let stream = state
        .services
        .watch_endpoints(
            &ctx,
            params.label_selector()?,
            params.field_selector()?,
            params.resource_version()?,
        )
        .await?;
    Ok(watch_response(stream, version, "endpoints"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Service;
    use crate::registry::RegistryError;
    use futures::stream;

    async fn body_lines(resp: Response) -> Vec<serde_json::Value> {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_events_are_newline_delimited() {
        let events = crate::watch::from_events(vec![
            Event::new(EventType::Added, Service::new("a", 80)),
            Event::new(EventType::Deleted, Service::new("a", 80)),
        ]);
        let lines = body_lines(watch_response(events, ApiVersion::V1beta2, "services")).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "ADDED");
        assert_eq!(lines[0]["object"]["kind"], "Service");
        assert_eq!(lines[0]["object"]["apiVersion"], "v1beta2");
        assert_eq!(lines[0]["object"]["metadata"]["name"], "a");
        assert_eq!(lines[1]["type"], "DELETED");
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let events: WatchStream<Service> = stream::iter(vec![
            Err(RegistryError::Expired {
                message: "gone".into(),
            }),
            Ok(Event::new(EventType::Added, Service::new("late", 80))),
        ])
        .boxed();
        let lines = body_lines(watch_response(events, ApiVersion::V1beta1, "services")).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "ERROR");
        assert_eq!(lines[0]["object"]["code"], 410);
    }
}
