//! Per-request execution context.
//!
//! Every storage operation receives a [`RequestContext`]. It carries the
//! caller identity used by the user-scoped operations and a cancellation
//! token that aborts in-flight backend calls.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::storage::{StorageError, StorageResult};

/// Header carrying the caller identity.
pub const USER_ID_HEADER: &str = "User-Id";

/// Identity and cancellation scope of a single request.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    user_id: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Creates an anonymous context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from request headers, reading [`USER_ID_HEADER`]
    /// case-insensitively. Blank values are ignored.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let user_id = headers
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(USER_ID_HEADER))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Self {
            user_id,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Ties this context to an externally owned token, e.g. one cancelled on
    /// client disconnect or process shutdown.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the caller identity, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Returns the caller identity or a validation error for user-scoped
    /// operations invoked without one.
    pub fn require_user_id(&self) -> StorageResult<&str> {
        self.user_id().ok_or_else(|| {
            StorageError::Validation(format!("{} header is required", USER_ID_HEADER))
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drives `fut` to completion unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            result = fut => result,
        }
    }
}
