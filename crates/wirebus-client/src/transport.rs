//! Socket establishment for the client managers.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use wirebus_core::error::{BusError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// TLS knobs carried per connection entry. `wss://` URLs negotiate TLS via
/// native-tls; `insecure_skip_verify` disables certificate validation for
/// self-signed development endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
}

/// Append identity query parameters to the endpoint URL. Query parameters
/// are the canonical identity channel for the client side; encoding and
/// merging with any pre-existing query is delegated to `url`.
pub(crate) fn endpoint_url(url: &str, api_key: &str, platform: &str) -> Result<String> {
    let mut endpoint = Url::parse(url)
        .map_err(|e| BusError::BadRequest(format!("invalid endpoint url {url}: {e}")))?;
    endpoint
        .query_pairs_mut()
        .append_pair("api_key", api_key)
        .append_pair("platform", platform);
    Ok(endpoint.into())
}

/// Establish a WebSocket connection within `timeout_ms`.
pub(crate) async fn connect(url: &str, tls: &TlsOptions, timeout_ms: u64) -> Result<WsStream> {
    let attempt = async {
        if tls.insecure_skip_verify {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| BusError::Transport(format!("tls connector: {e}")))?;
            let (stream, _resp) = connect_async_tls_with_config(
                url,
                None,
                false,
                Some(Connector::NativeTls(connector)),
            )
            .await
            .map_err(|e| BusError::Transport(format!("connect {url} failed: {e}")))?;
            Ok(stream)
        } else {
            let (stream, _resp) = connect_async(url)
                .await
                .map_err(|e| BusError::Transport(format!("connect {url} failed: {e}")))?;
            Ok(stream)
        }
    };
    tokio::time::timeout(Duration::from_millis(timeout_ms), attempt)
        .await
        .map_err(|_| BusError::Transport(format!("connect {url} timed out after {timeout_ms}ms")))?
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn endpoint_url_appends_identity() {
        assert_eq!(
            endpoint_url("ws://h:1/v1/bus", "k1", "qq").unwrap(),
            "ws://h:1/v1/bus?api_key=k1&platform=qq"
        );
        assert_eq!(
            endpoint_url("ws://h:1/v1/bus?x=1", "k 1", "qq").unwrap(),
            "ws://h:1/v1/bus?x=1&api_key=k+1&platform=qq"
        );
    }

    #[test]
    fn reserved_characters_are_encoded() {
        assert_eq!(
            endpoint_url("ws://h:1/v1/bus", "a&b=c", "p").unwrap(),
            "ws://h:1/v1/bus?api_key=a%26b%3Dc&platform=p"
        );
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(matches!(
            endpoint_url("not a url", "k", "p"),
            Err(BusError::BadRequest(_))
        ));
    }
}
