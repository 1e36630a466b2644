//! JSON-RPC forwarding over the upstream's WebSocket endpoint, with
//! `X-User` and `X-Forwarded-For` headers populated per request (§4.1,
//! §6).

use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use url::Url;

use crate::error::ClioError;

/// Forward timeout (§5 "Timeouts").
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens one WebSocket connection, sends `request` with the forwarding
/// headers set, and returns the first response frame parsed as JSON.
///
/// A real forwarding source keeps its WebSocket connection open across
/// calls; this function models one forward as one short-lived connection,
/// which is sufficient to express the header and timeout contract the
/// spec states without depending on a long-lived connection-pool type this
/// crate does not otherwise need.
pub async fn forward(
    ws_url: &Url,
    request: &Value,
    client_ip: &str,
    x_user: &str,
) -> Result<Value, ClioError> {
    let mut client_request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| ClioError::Internal(format!("invalid forwarding url: {e}")))?;
    let headers = client_request.headers_mut();
    headers.insert(
        "X-User",
        x_user
            .parse()
            .map_err(|_| ClioError::BadRequest("invalid X-User header".into()))?,
    );
    headers.insert(
        "X-Forwarded-For",
        client_ip
            .parse()
            .map_err(|_| ClioError::BadRequest("invalid client ip".into()))?,
    );

    let body = request.to_string();

    let work = async {
        let (mut stream, _response) = tokio_tungstenite::connect_async(client_request)
            .await
            .context("failed to connect to forwarding source")?;
        stream
            .send(Message::Text(body))
            .await
            .context("failed to send forwarded request")?;
        let frame = stream
            .next()
            .await
            .context("forwarding source closed the connection")?
            .context("forwarding source sent a transport error")?;
        let text = frame
            .into_text()
            .context("forwarding source sent a non-text frame")?;
        serde_json::from_str::<Value>(&text).context("forwarding source returned invalid JSON")
    };

    match tokio::time::timeout(FORWARD_TIMEOUT, work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ClioError::Unavailable(format!("{e:#}"))),
        Err(_) => Err(ClioError::Unavailable("forward timed out".into())),
    }
}
