use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// Longest accepted request or header line, terminator excluded.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Parsed request line plus headers, read one byte at a time.
///
/// The reader never buffers past the blank line: whatever follows the header
/// block stays in the socket for the splice phase. The original text of every
/// line is retained so the request can be forwarded verbatim.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub protocol: String,
    headers: Vec<(String, String)>,
    raw_lines: Vec<String>,
}

impl RequestHead {
    /// Read and parse a request head off `reader`.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let request_line = read_line(reader).await?;
        let fields: Vec<&str> = request_line.split(' ').collect();
        let [method, target, protocol] = fields.as_slice() else {
            return Err(ProxyError::Protocol(format!(
                "request line is not '<method> <target> <protocol>': {request_line:?}"
            )));
        };
        if method.is_empty() || target.is_empty() || protocol.is_empty() {
            return Err(ProxyError::Protocol(
                "request line has an empty field".to_string(),
            ));
        }
        let (method, target, protocol) = (
            method.to_string(),
            target.to_string(),
            protocol.to_string(),
        );

        let mut raw_lines = vec![request_line];
        let mut headers = Vec::new();
        loop {
            let line = read_line(reader).await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::Protocol(format!("header line has no colon: {line:?}")))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            raw_lines.push(line);
        }

        Ok(Self {
            method,
            target,
            protocol,
            headers,
            raw_lines,
        })
    }

    /// The value of `name`, only when the header occurs exactly once and is
    /// non-empty.
    pub fn single_header(&self, name: &str) -> Option<&str> {
        let mut matches = self.headers.iter().filter(|(n, _)| n == name);
        let (_, value) = matches.next()?;
        if matches.next().is_some() || value.is_empty() {
            return None;
        }
        Some(value)
    }

    /// Overwrite every Host header line with `Host: <new_host>`.
    pub fn replace_host(&mut self, new_host: &str) {
        for line in self.raw_lines.iter_mut().skip(1) {
            if line.trim_start().to_ascii_lowercase().starts_with("host:") {
                *line = format!("Host: {new_host}");
            }
        }
        for (name, value) in self.headers.iter_mut() {
            if name == "host" {
                *value = new_host.to_string();
            }
        }
    }

    /// Drop every header whose lowercased name is in `names`.
    pub fn strip_headers(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut index = 0;
        self.raw_lines.retain(|line| {
            index += 1;
            if index == 1 {
                return true;
            }
            match line.split_once(':') {
                Some((name, _)) => !names.contains(&name.trim().to_ascii_lowercase()),
                None => true,
            }
        });
        self.headers.retain(|(name, _)| !names.contains(name));
    }

    /// The header block as it goes over the tunnel: every retained line joined
    /// by CRLF plus the terminating blank line.
    pub fn forward_block(&self) -> Vec<u8> {
        let mut block = self.raw_lines.join("\r\n").into_bytes();
        block.extend_from_slice(b"\r\n\r\n");
        block
    }
}

/// Read a single CRLF-terminated line, one byte per read.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProxyError::Protocol(
                    "connection closed before end of headers".to_string(),
                ));
            }
            Err(e) => return Err(ProxyError::Io(e)),
        };
        if byte == b'\n' && line.last() == Some(&b'\r') {
            line.pop();
            break;
        }
        if line.len() >= MAX_LINE_BYTES {
            return Err(ProxyError::Protocol(format!(
                "header line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        line.push(byte);
    }
    String::from_utf8(line)
        .map_err(|_| ProxyError::Protocol("header line is not valid UTF-8".to_string()))
}
