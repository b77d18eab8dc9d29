// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared HTTP plumbing for the clients.

use std::time::Duration;

use reqwest::{Response, StatusCode};

use crate::error::{ClientError, Result};

/// Build a reqwest client with the given timeout.
pub(crate) fn build_client(timeout: Duration, accept_invalid_certs: bool) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?;
    Ok(client)
}

/// Turn a non-success response into a ClientError.
///
/// 404 becomes [`ClientError::NotFound`] so delete-by-id callers can
/// treat it as "already gone".
pub(crate) async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(format!("{}: {}", what, body.trim())));
    }

    Err(ClientError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn trim_base(url: &str) -> &str {
    url.trim_end_matches('/')
}
