//! Server-Sent Events for kernel state.
//!
//! `GET /kernels/{id}/events` — one `state` event per lifecycle transition,
//! starting with the kernel's current state. The stream ends after the kernel
//! is deleted.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;

use crate::error::ApiError;
use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

/// `GET /kernels/{id}/events` — SSE state stream.
pub async fn kernel_events(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections").into_response();
    }

    let subscription = match state.registry.subscribe(&id).await {
        Ok(s) => s,
        Err(e) => return ApiError::from(e).into_response(),
    };
    state.sse_connections.fetch_add(1, Ordering::Relaxed);

    let stream = futures::stream::unfold(subscription, |mut sub| async move {
        let event = sub.next().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok(Event::default().event("state").data(data)), sub))
    });

    let stream = DropCounterStream {
        inner: Box::pin(stream),
        counter: state.sse_connections.clone(),
        decremented: false,
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15)))
        .into_response()
}

/// Decrements the SSE connection counter once, when the stream ends or is
/// dropped.
struct DropCounterStream<S> {
    inner: std::pin::Pin<Box<S>>,
    counter: Arc<AtomicU32>,
    decremented: bool,
}

impl<S> DropCounterStream<S> {
    fn release(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let std::task::Poll::Ready(None) = &result {
            self.release();
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}
