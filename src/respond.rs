use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Escape text for embedding into the canned HTML bodies.
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, message_html: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n\
         <body>\n<h1>{title}</h1>\n<p>{message_html}</p>\n</body>\n</html>\n"
    )
}

/// Write a full response and half-close the sending side.
///
/// Reports success as a bool; a failed write is logged and swallowed because
/// by this point there is nothing useful left to tell the client.
async fn send<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    extra_headers: &[(&str, String)],
    body: String,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store, max-age=0\r\n\
         Connection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let result = async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body.as_bytes()).await?;
        stream.shutdown().await
    }
    .await;

    match result {
        Ok(()) => true,
        Err(e) => {
            debug!("failed to write {status} response: {e}");
            false
        }
    }
}

pub async fn bad_request<S: AsyncWrite + Unpin>(stream: &mut S, detail: &str) -> bool {
    let body = page("400 Bad Request", &html_escape(detail));
    send(stream, 400, "Bad Request", &[], body).await
}

pub async fn forbidden<S: AsyncWrite + Unpin>(stream: &mut S, detail: &str) -> bool {
    let body = page("403 Forbidden", &html_escape(detail));
    send(stream, 403, "Forbidden", &[], body).await
}

pub async fn gone_v2<S: AsyncWrite + Unpin>(stream: &mut S) -> bool {
    let body = page(
        "410 Gone",
        "This is a version 2 onion address. Version 2 onion services were \
         retired by the Tor network and can no longer be reached.",
    );
    send(stream, 410, "Gone", &[], body).await
}

/// 451 with an optional `Link: <url>; rel="blocked-by"` header.
pub async fn legal_block<S: AsyncWrite + Unpin>(
    stream: &mut S,
    detail: &str,
    url: Option<&str>,
) -> bool {
    let body = page("451 Unavailable For Legal Reasons", &html_escape(detail));
    match url {
        Some(url) => {
            let link = [("Link", format!("<{url}>; rel=\"blocked-by\""))];
            send(stream, 451, "Unavailable For Legal Reasons", &link, body).await
        }
        None => send(stream, 451, "Unavailable For Legal Reasons", &[], body).await,
    }
}

pub async fn service_unavailable<S: AsyncWrite + Unpin>(stream: &mut S, detail: &str) -> bool {
    let body = page("503 Service Unavailable", &html_escape(detail));
    send(stream, 503, "Service Unavailable", &[], body).await
}

pub async fn gateway_timeout<S: AsyncWrite + Unpin>(stream: &mut S, detail: &str) -> bool {
    let body = page("504 Gateway Timeout", &html_escape(detail));
    send(stream, 504, "Gateway Timeout", &[], body).await
}

pub async fn redirect<S: AsyncWrite + Unpin>(stream: &mut S, location: &str) -> bool {
    let escaped = html_escape(location);
    let body = page(
        "307 Temporary Redirect",
        &format!("Redirecting to <a href=\"{escaped}\">{escaped}</a>."),
    );
    let headers = [("Location", location.to_string())];
    send(stream, 307, "Temporary Redirect", &headers, body).await
}
