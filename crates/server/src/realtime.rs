//! Server-sent-events bridge to the change broadcaster.
//!
//! `GET /api/realtime` subscribes a sink and streams its messages as
//! SSE: a `connected` marker first, then `message` events carrying the
//! serialized `{collection, action, data}` payload, with `ping`
//! keep-alives from the broadcaster's heartbeat. When the client goes
//! away the receiver drops and the broadcaster evicts the sink on its
//! next write.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::Stream;
use plinth_engine::FeedMessage;
use tracing::debug;

use crate::state::AppState;

/// `GET /api/realtime`.
pub async fn subscribe(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (sink_id, rx) = state.broadcaster.subscribe();
    debug!(sink_id, "realtime client connected");

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        let event = match message {
            FeedMessage::Connected => Event::default().event("connected").data("{}"),
            FeedMessage::Ping => Event::default().event("ping").data("{}"),
            FeedMessage::Event(payload) => Event::default().event("message").data(&*payload),
        };
        Some((Ok(event), rx))
    });

    Sse::new(stream)
}
