//! WebSocket frame handling
//!
//! Maps what the socket yields onto relay session events.

use std::fmt;

use axum::extract::ws::Message;

use crate::relay::ConnectionEvent;

/// Translate one read from the socket into a session event
///
/// Pings are answered by axum itself, so control frames produce no event.
/// Binary payloads are decoded lossily so the relay only ever sees text.
pub fn frame_to_event<E: fmt::Display>(
    frame: Option<Result<Message, E>>,
) -> Option<ConnectionEvent> {
    match frame {
        Some(Ok(Message::Text(text))) => Some(ConnectionEvent::Message(text.as_str().to_owned())),
        Some(Ok(Message::Binary(data))) => Some(ConnectionEvent::Message(
            String::from_utf8_lossy(&data).into_owned(),
        )),
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => None,
        Some(Ok(Message::Close(_))) | None => Some(ConnectionEvent::Closed),
        Some(Err(e)) => Some(ConnectionEvent::Error(e.to_string())),
    }
}
