//! Body wrapper for responses the middleware let through.
//!
//! Once a response head is handed to the server it is on the wire. An error
//! that surfaces later, while the body streams, can no longer be turned into
//! a problem response; [`StartedBody`] logs it and passes it on unchanged.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

use crate::middleware::log_response_started;

pin_project! {
    #[derive(Debug)]
    pub struct StartedBody<B> {
        #[pin]
        inner: B,
    }
}

impl<B> StartedBody<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B> Body for StartedBody<B>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                log_response_started(&e);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
