//! Transport abstraction for exchanging sync requests/responses with a
//! remote peer. No concrete HTTP (or other network) client lives in this
//! workspace's dependency graph, so callers inject their own.

use std::time::Duration;

use crate::error::SyncError;

use super::backoff::AbortSignal;
use super::{SyncRequest, SyncResponse};

/// Sends a sync request to `remote` and waits for the response, honoring
/// `timeout` and `abort`.
///
/// Implementations should map connection failures to
/// [`SyncError::Network`], a response that arrives after `timeout` to
/// [`SyncError::Timeout`], a non-success status from the remote to
/// [`SyncError::RemoteServer`], and a malformed response body to
/// [`SyncError::Protocol`].
pub trait SyncTransport {
    /// Perform one request/response round trip.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] variant describing why the round trip did
    /// not produce a usable response.
    fn send_sync_request(
        &mut self,
        remote: &str,
        request: &SyncRequest,
        timeout: Duration,
        abort: &AbortSignal,
    ) -> Result<SyncResponse, SyncError>;
}
