//! SSE (Server-Sent Events) streaming of page updates.
//!
//! Converts the broadcast of [`PageUpdate`]s into an SSE stream: one `page`
//! event per update, with a `lagged` event when a slow client missed some.

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::cache::PageUpdate;

/// Convert an update receiver into an SSE stream.
pub fn updates_to_sse_stream(
    rx: broadcast::Receiver<PageUpdate>,
    request_id: String,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    BroadcastStream::new(rx).filter_map(move |update| match update {
        Ok(update) => match Event::default().event("page").json_data(&update) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!(request_id = %request_id, "Dropping unserializable update: {e}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!(request_id = %request_id, missed, "SSE client lagging behind updates");
            Some(Ok(Event::default().event("lagged").data(missed.to_string())))
        }
    })
}
