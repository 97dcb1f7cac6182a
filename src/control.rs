use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::lists::{AliasEntry, AliasKind, BlacklistEntry, BlockReason};
use crate::onion;
use crate::state::ServiceState;
use crate::vault;

/// Control protocol version reported by `VERSION`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum spacing between AUTH attempts, process-wide.
const AUTH_DELAY: Duration = Duration::from_millis(500);

/// One command's response: payload lines plus the OK/ERR terminator.
struct Reply {
    lines: Vec<String>,
    ok: bool,
    close: bool,
}

impl Reply {
    fn ok() -> Self {
        Self {
            lines: Vec::new(),
            ok: true,
            close: false,
        }
    }

    fn ok_with(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
            ok: true,
            close: false,
        }
    }

    fn payload(lines: Vec<String>) -> Self {
        Self {
            lines,
            ok: true,
            close: false,
        }
    }

    fn err(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
            ok: false,
            close: false,
        }
    }

    /// Bare `ERR`, used for commands we do not recognize.
    fn unknown() -> Self {
        Self {
            lines: Vec::new(),
            ok: false,
            close: false,
        }
    }

    fn closing() -> Self {
        Self {
            lines: Vec::new(),
            ok: true,
            close: true,
        }
    }
}

/// Accept loop for the control port.
pub async fn run_listener(state: Arc<ServiceState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("control connection from {peer}");
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(state, stream).await {
                        debug!("control connection from {peer} ended: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("control accept error: {e} (continuing)");
            }
        }
    }
}

/// Run the line protocol over one connection until EXIT or disconnect.
pub async fn serve_connection<S>(state: Arc<ServiceState>, stream: S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let greeting = Reply::ok_with(format!("Http2Socks {}", env!("CARGO_PKG_HOMEPAGE")));
    write_reply(&mut write_half, &greeting).await?;

    let mut authed = false;
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            return Ok(());
        }
        let line = buf.trim_end_matches('\n').trim_end_matches('\r');
        let reply = dispatch(&state, line, &mut authed).await;
        write_reply(&mut write_half, &reply).await?;
        if reply.close {
            return Ok(());
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> std::io::Result<()> {
    let mut out = String::new();
    for line in &reply.lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(if reply.ok { "OK" } else { "ERR" });
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await
}

async fn dispatch(state: &ServiceState, line: &str, authed: &mut bool) -> Reply {
    let command = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
    match command.as_str() {
        "NOOP" => Reply::ok(),
        "EXIT" => Reply::closing(),
        "VERSION" => Reply::ok_with(PROTOCOL_VERSION.to_string()),
        "AUTH" => auth(state, line, authed).await,
        "INFO" => info_reply(state, *authed),
        "HALT" | "CONT" | "BLRELOAD" | "ALRELOAD" | "BLLIST" | "ALLIST" | "BLADD" | "ALADD"
        | "BLREMOVE" | "ALREMOVE" | "BLSAVE" | "ALSAVE"
            if !*authed =>
        {
            Reply::err("Authentication required")
        }
        "HALT" => {
            if state.set_halted(true) {
                Reply::ok_with("Request processing was already halted")
            } else {
                Reply::ok_with("Request processing halted")
            }
        }
        "CONT" => {
            if state.set_halted(false) {
                Reply::ok_with("Request processing resumed")
            } else {
                Reply::ok_with("Request processing was not halted")
            }
        }
        "BLRELOAD" => {
            match state
                .lists
                .load_blacklist(state.config.blacklist_path.as_deref())
            {
                Ok(count) => Reply::ok_with(format!("Loaded {count} blacklist entries")),
                Err(e) => Reply::err(e.to_string()),
            }
        }
        "ALRELOAD" => match state.lists.load_aliases(state.config.alias_path.as_deref()) {
            Ok(count) => Reply::ok_with(format!("Loaded {count} aliases")),
            Err(e) => Reply::err(e.to_string()),
        },
        "BLLIST" => Reply::payload(text_lines(&state.lists.blacklist_ini_text())),
        "ALLIST" => Reply::payload(text_lines(&state.lists.aliases_ini_text())),
        "BLADD" => bl_add(state, &arguments(line)),
        "ALADD" => al_add(state, &arguments(line)),
        "BLREMOVE" => bl_remove(state, &arguments(line)),
        "ALREMOVE" => al_remove(state, &arguments(line)),
        "BLSAVE" => {
            match state
                .lists
                .save_blacklist(state.config.blacklist_path.as_deref())
            {
                Ok(()) => Reply::ok_with("Blacklist saved"),
                Err(e) => Reply::err(e.to_string()),
            }
        }
        "ALSAVE" => match state.lists.save_aliases(state.config.alias_path.as_deref()) {
            Ok(()) => Reply::ok_with("Aliases saved"),
            Err(e) => Reply::err(e.to_string()),
        },
        _ => Reply::unknown(),
    }
}

/// Positional arguments after the command token. Consecutive spaces produce
/// empty tokens, which is how a client skips an optional argument.
fn arguments(line: &str) -> Vec<&str> {
    line.split(' ').skip(1).collect()
}

fn text_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

async fn auth(state: &ServiceState, line: &str, authed: &mut bool) -> Reply {
    // One attempt at a time, at least half a second apart, across every
    // control connection.
    {
        let _gate = state.auth_gate.lock().await;
        tokio::time::sleep(AUTH_DELAY).await;
    }

    if *authed {
        return Reply::err("User already authenticated");
    }

    let candidate = line.split_once(' ').map(|(_, rest)| rest).unwrap_or("");
    let password_ok = state
        .config
        .password
        .as_deref()
        .is_some_and(|record| vault::verify(candidate, record));
    let cookie_ok = state
        .cookie
        .as_deref()
        .is_some_and(|cookie| cookie == candidate);

    if password_ok || cookie_ok {
        *authed = true;
        Reply::ok_with("User authenticated")
    } else {
        warn!("control authentication failed");
        Reply::err("Authentication failed")
    }
}

fn info_reply(state: &ServiceState, authed: bool) -> Reply {
    let mut lines = vec![format!("AUTH={}", u8::from(authed))];
    if authed {
        lines.push(format!("HALT={}", u8::from(state.halted())));
        lines.push(format!("BL={}", state.lists.blacklist_len()));
        lines.push(format!("AL={}", state.lists.aliases_len()));
        lines.push(format!(
            "BLFILE={}",
            u8::from(state.config.blacklist_path.is_some())
        ));
        lines.push(format!(
            "ALFILE={}",
            u8::from(state.config.alias_path.is_some())
        ));
    }
    Reply::payload(lines)
}

fn bl_add(state: &ServiceState, args: &[&str]) -> Reply {
    let Some(domain) = args.first().filter(|d| !d.is_empty()) else {
        return Reply::err("BLADD requires a domain");
    };
    let name = onion::url_decode(args.get(1).copied().unwrap_or(""));
    let notes = onion::url_decode(args.get(2).copied().unwrap_or(""));
    let reason = match args.get(3).copied().filter(|r| !r.is_empty()) {
        Some(raw) => match BlockReason::parse(raw) {
            Ok(reason) => reason,
            Err(e) => return Reply::err(e.to_string()),
        },
        None => BlockReason::Forbidden,
    };
    let url = args.get(4).copied().unwrap_or("");

    match BlacklistEntry::new(domain, &name, &notes, reason, url) {
        Ok(entry) => {
            let domain = entry.domain.clone();
            state.lists.add_blacklist(entry);
            Reply::ok_with(format!("Blacklisted {domain}"))
        }
        Err(e) => Reply::err(e.to_string()),
    }
}

fn al_add(state: &ServiceState, args: &[&str]) -> Reply {
    let Some(onion_host) = args.first().filter(|a| !a.is_empty()) else {
        return Reply::err("ALADD requires an onion address");
    };
    let Some(alias) = args.get(1).filter(|a| !a.is_empty()) else {
        return Reply::err("ALADD requires an alias");
    };
    let kind = match args.get(2).copied().filter(|k| !k.is_empty()) {
        Some(raw) => match AliasKind::parse(raw) {
            Ok(kind) => kind,
            Err(e) => return Reply::err(e.to_string()),
        },
        None => AliasKind::Rewrite,
    };

    match AliasEntry::new(alias, onion_host, kind) {
        Ok(entry) => {
            let summary = format!("Aliased {} as {}", entry.onion, entry.alias);
            state.lists.add_alias(entry);
            Reply::ok_with(summary)
        }
        Err(e) => Reply::err(e.to_string()),
    }
}

fn bl_remove(state: &ServiceState, args: &[&str]) -> Reply {
    let Some(raw) = args.first().filter(|d| !d.is_empty()) else {
        return Reply::err("BLREMOVE requires a domain");
    };
    let Some(domain) = onion::normalize(raw) else {
        return Reply::err(format!("'{raw}' is not a v3 onion address"));
    };
    if state.lists.remove_blacklist(&domain) {
        Reply::ok_with(format!("Removed {domain}"))
    } else {
        Reply::ok_with(format!("No blacklist entry for {domain}"))
    }
}

fn al_remove(state: &ServiceState, args: &[&str]) -> Reply {
    let Some(raw) = args.first().filter(|d| !d.is_empty()) else {
        return Reply::err("ALREMOVE requires a domain");
    };
    let Some(domain) = onion::normalize(raw) else {
        return Reply::err(format!("'{raw}' is not a v3 onion address"));
    };
    if state.lists.remove_alias_target(&domain) {
        Reply::ok_with(format!("Removed aliases for {domain}"))
    } else {
        Reply::ok_with(format!("No alias for {domain}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_config;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn read_reply(&mut self) -> (Vec<String>, bool) {
            let mut lines = Vec::new();
            loop {
                let mut buf = String::new();
                let n = self.reader.read_line(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed mid-reply");
                match buf.trim_end() {
                    "OK" => return (lines, true),
                    "ERR" => return (lines, false),
                    other => lines.push(other.to_string()),
                }
            }
        }

        async fn send(&mut self, command: &str) -> (Vec<String>, bool) {
            self.writer
                .write_all(format!("{command}\r\n").as_bytes())
                .await
                .unwrap();
            self.read_reply().await
        }
    }

    async fn connect(state: Arc<ServiceState>) -> Client {
        let (server_end, client_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_connection(state, server_end).await;
        });
        let (read_half, writer) = tokio::io::split(client_end);
        let mut client = Client {
            reader: BufReader::new(read_half),
            writer,
        };
        let (greeting, ok) = client.read_reply().await;
        assert!(ok);
        assert!(greeting[0].starts_with("Http2Socks "));
        client
    }

    fn cookie_state() -> Arc<ServiceState> {
        let state = ServiceState::assemble(test_config("example.com"), Some("s3cret".into()));
        Arc::new(state.unwrap())
    }

    fn temp_path(stem: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "http2socks-ctl-{stem}-{}-{}.ini",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn onion_of(c: char) -> String {
        format!("{}.onion", c.to_string().repeat(56))
    }

    #[tokio::test]
    async fn unauthenticated_surface() {
        let mut client = connect(cookie_state()).await;

        assert_eq!(client.send("NOOP").await, (vec![], true));
        assert_eq!(client.send("VERSION").await, (vec!["1".to_string()], true));
        assert_eq!(
            client.send("INFO").await,
            (vec!["AUTH=0".to_string()], true)
        );
        assert_eq!(
            client.send("HALT").await,
            (vec!["Authentication required".to_string()], false)
        );
        // unknown commands answer a bare ERR
        assert_eq!(client.send("FROBNICATE").await, (vec![], false));
        // lowercase commands dispatch the same
        assert_eq!(client.send("noop").await, (vec![], true));
    }

    #[tokio::test]
    async fn cookie_auth_and_throttle() {
        let mut client = connect(cookie_state()).await;

        let started = Instant::now();
        let (lines, ok) = client.send("AUTH wrong").await;
        assert!(!ok);
        assert_eq!(lines, vec!["Authentication failed".to_string()]);

        let (lines, ok) = client.send("AUTH s3cret").await;
        assert!(ok);
        assert_eq!(lines, vec!["User authenticated".to_string()]);
        // two gated attempts cannot finish in under a second
        assert!(started.elapsed() >= Duration::from_millis(1000));

        let (lines, ok) = client.send("AUTH s3cret").await;
        assert!(!ok);
        assert_eq!(lines, vec!["User already authenticated".to_string()]);

        let (lines, ok) = client.send("INFO").await;
        assert!(ok);
        assert_eq!(
            lines,
            vec!["AUTH=1", "HALT=0", "BL=0", "AL=0", "BLFILE=0", "ALFILE=0"]
        );
    }

    #[tokio::test]
    async fn password_auth_preserves_embedded_spaces() {
        let mut config = test_config("example.com");
        config.password = Some(vault::hash("two words"));
        let state = Arc::new(ServiceState::assemble(config, None).unwrap());
        let mut client = connect(state).await;

        let (_, ok) = client.send("AUTH two words").await;
        assert!(ok);
    }

    #[tokio::test]
    async fn halt_and_cont_toggle_the_flag() {
        let state = cookie_state();
        let mut client = connect(state.clone()).await;
        client.send("AUTH s3cret").await;

        let (lines, ok) = client.send("HALT").await;
        assert!(ok);
        assert_eq!(lines, vec!["Request processing halted".to_string()]);
        assert!(state.halted());

        let (lines, ok) = client.send("HALT").await;
        assert!(ok);
        assert_eq!(
            lines,
            vec!["Request processing was already halted".to_string()]
        );

        let (_, ok) = client.send("CONT").await;
        assert!(ok);
        assert!(!state.halted());
    }

    #[tokio::test]
    async fn bladd_save_and_reread() {
        let path = temp_path("save");
        let mut config = test_config("example.com");
        config.blacklist_path = Some(path.clone());
        let state = Arc::new(ServiceState::assemble(config, Some("s3cret".into())).unwrap());
        let mut client = connect(state.clone()).await;
        client.send("AUTH s3cret").await;

        let domain = onion_of('d');
        let (_, ok) = client
            .send(&format!("BLADD {domain} Test%20Name  451 https://ex"))
            .await;
        assert!(ok);
        let (_, ok) = client.send("BLSAVE").await;
        assert!(ok);

        let saved = ini::Ini::load_from_file(&path).unwrap();
        let section = saved.section(Some(domain.as_str())).unwrap();
        assert_eq!(section.get("Name"), Some("Test Name"));
        assert_eq!(section.get("Reason"), Some("451"));
        assert_eq!(section.get("URL"), Some("https://ex"));
        assert_eq!(section.get("Notes"), None);

        // BLLIST serves the same snapshot over the wire
        let (lines, ok) = client.send("BLLIST").await;
        assert!(ok);
        assert!(lines.contains(&format!("[{domain}]")));
        assert!(lines.contains(&"Name=Test Name".to_string()));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn bladd_rejects_bad_entries() {
        let state = cookie_state();
        let mut client = connect(state.clone()).await;
        client.send("AUTH s3cret").await;

        let (lines, ok) = client.send("BLADD not-an-onion").await;
        assert!(!ok);
        assert!(!lines.is_empty());
        let (_, ok) = client.send(&format!("BLADD {} x x 500", onion_of('a'))).await;
        assert!(!ok);
        assert_eq!(state.lists.blacklist_len(), 0);
    }

    #[tokio::test]
    async fn aladd_and_alremove_round_trip() {
        let state = cookie_state();
        let mut client = connect(state.clone()).await;
        client.send("AUTH s3cret").await;

        let onion = onion_of('c');
        let (_, ok) = client.send(&format!("ALADD {onion} short 1")).await;
        assert!(ok);
        let alias = state.lists.alias_for("short").unwrap();
        assert_eq!(alias.kind, AliasKind::Redirect);
        assert_eq!(alias.onion, onion);

        // default type is rewrite, and the onion key evicts the old entry
        let (_, ok) = client.send(&format!("ALADD {onion} other")).await;
        assert!(ok);
        assert!(state.lists.alias_for("short").is_none());
        assert_eq!(state.lists.alias_for("other").unwrap().kind, AliasKind::Rewrite);

        let (_, ok) = client.send(&format!("ALREMOVE www.{onion}")).await;
        assert!(ok);
        assert_eq!(state.lists.aliases_len(), 0);

        let (_, ok) = client.send("ALREMOVE not%20an%20onion").await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn blremove_normalizes_its_argument() {
        let state = cookie_state();
        let mut client = connect(state.clone()).await;
        client.send("AUTH s3cret").await;

        let domain = onion_of('e');
        client.send(&format!("BLADD {domain}")).await;
        assert_eq!(state.lists.blacklist_len(), 1);

        let upper = domain.to_ascii_uppercase();
        let (_, ok) = client.send(&format!("BLREMOVE www.{upper}")).await;
        assert!(ok);
        assert_eq!(state.lists.blacklist_len(), 0);
    }

    #[tokio::test]
    async fn reload_failure_reports_err_and_keeps_table() {
        let mut config = test_config("example.com");
        config.blacklist_path = Some(temp_path("missing"));
        let state = Arc::new(ServiceState::assemble(config, Some("s3cret".into())).unwrap());
        state.lists.add_blacklist(
            BlacklistEntry::new(&onion_of('f'), "", "", BlockReason::Forbidden, "").unwrap(),
        );
        let mut client = connect(state.clone()).await;
        client.send("AUTH s3cret").await;

        let (lines, ok) = client.send("BLRELOAD").await;
        assert!(!ok);
        assert!(!lines.is_empty());
        assert_eq!(state.lists.blacklist_len(), 1);
    }

    #[tokio::test]
    async fn save_without_configured_file_fails() {
        let state = cookie_state();
        let mut client = connect(state).await;
        client.send("AUTH s3cret").await;

        let (_, ok) = client.send("BLSAVE").await;
        assert!(!ok);
        let (_, ok) = client.send("ALSAVE").await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn exit_closes_the_connection() {
        let mut client = connect(cookie_state()).await;
        let (_, ok) = client.send("EXIT").await;
        assert!(ok);

        let mut buf = String::new();
        let n = client.reader.read_line(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
