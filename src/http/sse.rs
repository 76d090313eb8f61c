//! Server-sent event framing for session streams

use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{stream, Stream};
use serde_json::json;

use crate::mcp::codec::encode;
use crate::transport::{session::SessionId, stream::StreamReceiver};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

struct Writer {
    receiver: StreamReceiver,
    opening: Option<Event>,
    next_id: u64,
}

pub fn opening_event(session_id: &SessionId) -> Event {
    Event::default()
        .event("session")
        .data(json!({ "sessionId": session_id.as_str() }).to_string())
}

/// Opening `session` frame followed by one `message` frame per queued item.
/// The stream ends when the receiver reports the stream finished; dropping it
/// early detaches the stream from its session.
pub fn event_stream(
    session_id: &SessionId,
    receiver: StreamReceiver,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let writer = Writer {
        receiver,
        opening: Some(opening_event(session_id)),
        next_id: 0,
    };

    stream::unfold(writer, |mut writer| async move {
        if let Some(opening) = writer.opening.take() {
            return Some((Ok(opening), writer));
        }

        let message = writer.receiver.next_message().await?;
        writer.next_id += 1;
        let data = String::from_utf8_lossy(&encode(&message)).into_owned();
        let event = Event::default()
            .event("message")
            .id(writer.next_id.to_string())
            .data(data);
        Some((Ok(event), writer))
    })
}

pub fn sse_response(
    session_id: &SessionId,
    receiver: StreamReceiver,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(session_id, receiver))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
