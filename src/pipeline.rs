use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::headers::RequestHead;
use crate::lists::{AliasKind, BlacklistEntry, BlockReason};
use crate::onion;
use crate::respond;
use crate::splice;
use crate::state::ServiceState;

/// How often a stalled request re-checks the halt flag.
const HALT_POLL: Duration = Duration::from_millis(100);

/// Accept loop for the HTTP port.
pub async fn run_listener(state: Arc<ServiceState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    serve_connection(state, stream, peer.ip()).await;
                });
            }
            Err(e) => {
                warn!("HTTP accept error: {e} (continuing)");
            }
        }
    }
}

/// Handle one inbound HTTP connection start to finish.
///
/// Every failure is answered on the spot and scoped to this connection.
pub async fn serve_connection<S>(state: Arc<ServiceState>, mut stream: S, client_ip: IpAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = match RequestHead::read(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            debug!("rejected request from {client_ip}: {e}");
            respond::bad_request(&mut stream, "Malformed HTTP request").await;
            return;
        }
    };

    let Some(host_header) = head.single_header("host").map(str::to_string) else {
        respond::bad_request(&mut stream, "Exactly one non-empty Host header is required").await;
        return;
    };
    let Some((label, port_text)) = state.split_host(&host_header) else {
        respond::bad_request(
            &mut stream,
            "Host is not under the suffix this gateway serves",
        )
        .await;
        return;
    };

    // Stall here while the operator edits the lists; requests resume when the
    // halt flag clears.
    while state.halted() {
        tokio::time::sleep(HALT_POLL).await;
    }

    // Only the last label is eligible as an alias; a trailing ".onion" the
    // browser carried along does not count as one.
    let lowered = label.to_ascii_lowercase();
    let alias_key = lowered
        .strip_suffix(".onion")
        .unwrap_or(&lowered)
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_string();
    let host = match state.lists.alias_for(&alias_key) {
        Some(alias) => match alias.kind {
            AliasKind::Redirect => {
                let location = format!(
                    "http://{}.{}{}",
                    alias.onion, state.config.suffix, head.target
                );
                respond::redirect(&mut stream, &location).await;
                return;
            }
            AliasKind::Rewrite => alias.onion,
        },
        None => match onion::normalize(&label) {
            Some(host) => host,
            None if onion::is_v2(&label) => {
                respond::gone_v2(&mut stream).await;
                return;
            }
            None => {
                respond::bad_request(&mut stream, "Host is not a v3 onion address").await;
                return;
            }
        },
    };

    if let Some(entry) = state.lists.blacklisted(&host) {
        answer_blocked(&mut stream, &entry).await;
        return;
    }

    let port: u16 = match &port_text {
        None => 80,
        Some(text) => match text.parse() {
            Ok(port) if port != 0 => port,
            _ => {
                respond::bad_request(&mut stream, "Invalid port in Host header").await;
                return;
            }
        },
    };

    let forwarded_host = if port == 80 || port == 443 {
        host.clone()
    } else {
        format!("{host}:{port}")
    };
    head.replace_host(&forwarded_host);
    head.strip_headers(&state.config.rejected_headers);

    let mut upstream = match state.dialer.open(&host, port, &client_ip.to_string()).await {
        Ok(upstream) => upstream,
        Err(e @ ProxyError::DialTimeout(_)) => {
            warn!("tunnel to {host}:{port} timed out");
            respond::gateway_timeout(&mut stream, &e.to_string()).await;
            return;
        }
        Err(e) => {
            warn!("tunnel to {host}:{port} failed: {e}");
            respond::service_unavailable(&mut stream, &e.to_string()).await;
            return;
        }
    };

    if let Err(e) = upstream.write_all(&head.forward_block()).await {
        debug!("failed to forward headers to {host}:{port}: {e}");
        return;
    }

    splice::splice(stream, upstream).await;
}

/// Answer a blacklisted host with the entry's block page.
async fn answer_blocked<S: AsyncWrite + Unpin>(stream: &mut S, entry: &BlacklistEntry) {
    let subject = if entry.name.is_empty() {
        entry.domain.clone()
    } else {
        entry.name.clone()
    };
    match entry.reason {
        BlockReason::LegalReasons => {
            let mut detail = format!("{subject} is unavailable for legal reasons.");
            if !entry.url.is_empty() {
                detail.push_str(&format!(" See {} for details.", entry.url));
            }
            let url = (!entry.url.is_empty()).then_some(entry.url.as_str());
            respond::legal_block(stream, &detail, url).await;
        }
        BlockReason::Forbidden => {
            let detail = format!("Access to {subject} is forbidden on this gateway.");
            respond::forbidden(stream, &detail).await;
        }
    }
}
