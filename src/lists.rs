use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use ini::Ini;
use regex::Regex;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::onion;

/// How an alias maps onto its onion address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    /// Transparently rewrite the Host header and forward.
    Rewrite,
    /// Answer 307 pointing the browser at the full onion host.
    Redirect,
}

impl AliasKind {
    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "0" => Ok(Self::Rewrite),
            "1" => Ok(Self::Redirect),
            _ if input.eq_ignore_ascii_case("rewrite") => Ok(Self::Rewrite),
            _ if input.eq_ignore_ascii_case("redirect") => Ok(Self::Redirect),
            _ => Err(ProxyError::Validation(format!(
                "unknown alias type '{input}' (expected 0, 1, Rewrite or Redirect)"
            ))),
        }
    }

    fn as_ini(self) -> &'static str {
        match self {
            Self::Rewrite => "0",
            Self::Redirect => "1",
        }
    }
}

/// Why a domain is blocked, and which status code announces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Forbidden,
    LegalReasons,
}

impl BlockReason {
    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "403" => Ok(Self::Forbidden),
            "451" => Ok(Self::LegalReasons),
            _ if input.eq_ignore_ascii_case("forbidden") => Ok(Self::Forbidden),
            _ if input.eq_ignore_ascii_case("legalreasons") => Ok(Self::LegalReasons),
            _ => Err(ProxyError::Validation(format!(
                "unknown block reason '{input}' (expected 403 or 451)"
            ))),
        }
    }

    pub fn status(self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::LegalReasons => 451,
        }
    }

    fn as_ini(self) -> &'static str {
        match self {
            Self::Forbidden => "403",
            Self::LegalReasons => "451",
        }
    }
}

fn alias_label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("alias pattern"))
}

/// A short DNS label standing in for a full onion address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    /// Lowercased DNS label, unique across the table.
    pub alias: String,
    /// Normalized onion target, also unique across the table.
    pub onion: String,
    pub kind: AliasKind,
}

impl AliasEntry {
    pub fn new(alias: &str, onion_host: &str, kind: AliasKind) -> Result<Self> {
        if !alias_label_pattern().is_match(alias) {
            return Err(ProxyError::Validation(format!(
                "alias '{alias}' may only contain letters, digits, '_' and '-'"
            )));
        }
        if alias.starts_with('-') {
            return Err(ProxyError::Validation(format!(
                "alias '{alias}' must not start with '-'"
            )));
        }
        if alias.contains("--") {
            return Err(ProxyError::Validation(format!(
                "alias '{alias}' must not contain '--'"
            )));
        }
        let onion = onion::normalize(onion_host).ok_or_else(|| {
            ProxyError::Validation(format!("'{onion_host}' is not a v3 onion address"))
        })?;
        Ok(Self {
            alias: alias.to_ascii_lowercase(),
            onion,
            kind,
        })
    }

    fn write_into(&self, ini: &mut Ini) {
        ini.set_to(Some(&self.alias), "Onion".to_string(), self.onion.clone());
        ini.set_to(Some(&self.alias), "Type".to_string(), self.kind.as_ini().to_string());
    }
}

/// A blocked onion domain plus the operator-facing block description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    /// Normalized onion address, the table key.
    pub domain: String,
    /// Display name shown on the block page; may be empty.
    pub name: String,
    /// Operator-private notes, never shown to clients.
    pub notes: String,
    pub reason: BlockReason,
    /// Absolute URL explaining the block; may be empty.
    pub url: String,
}

impl BlacklistEntry {
    pub fn new(
        domain: &str,
        name: &str,
        notes: &str,
        reason: BlockReason,
        url: &str,
    ) -> Result<Self> {
        let domain = onion::normalize(domain).ok_or_else(|| {
            ProxyError::Validation(format!("'{domain}' is not a v3 onion address"))
        })?;
        for (field, value) in [("name", name), ("notes", notes)] {
            if value.contains(['\r', '\n']) {
                return Err(ProxyError::Validation(format!(
                    "{field} must not contain line breaks"
                )));
            }
        }
        if !url.is_empty() {
            Url::parse(url)
                .map_err(|e| ProxyError::Validation(format!("'{url}' is not an absolute URL: {e}")))?;
        }
        Ok(Self {
            domain,
            name: name.to_string(),
            notes: notes.to_string(),
            reason,
            url: url.to_string(),
        })
    }

    fn write_into(&self, ini: &mut Ini) {
        if !self.name.is_empty() {
            ini.set_to(Some(&self.domain), "Name".to_string(), self.name.clone());
        }
        if !self.notes.is_empty() {
            ini.set_to(Some(&self.domain), "Notes".to_string(), self.notes.clone());
        }
        ini.set_to(
            Some(&self.domain),
            "Reason".to_string(),
            self.reason.as_ini().to_string(),
        );
        if !self.url.is_empty() {
            ini.set_to(Some(&self.domain), "URL".to_string(), self.url.clone());
        }
    }
}

/// Thread-safe alias and blacklist tables.
///
/// Reloads build a fresh table outside the lock and swap it in, so a parse
/// failure never disturbs the tables a request might be consulting.
#[derive(Debug, Default)]
pub struct ListsStore {
    blacklist: Mutex<HashMap<String, BlacklistEntry>>,
    aliases: Mutex<HashMap<String, AliasEntry>>,
}

impl ListsStore {
    /// Replace the blacklist from an INI file. `None` clears the table.
    pub fn load_blacklist(&self, path: Option<&Path>) -> Result<usize> {
        let Some(path) = path else {
            self.blacklist.lock().unwrap().clear();
            return Ok(0);
        };
        let ini = Ini::load_from_file(path)
            .map_err(|e| ProxyError::ListParse(format!("{}: {e}", path.display())))?;

        let mut table = HashMap::new();
        for (section, props) in ini.iter() {
            let Some(domain) = section else { continue };
            let reason = BlockReason::parse(props.get("Reason").unwrap_or("403"))
                .map_err(|e| ProxyError::ListParse(format!("[{domain}]: {e}")))?;
            let entry = BlacklistEntry::new(
                domain,
                props.get("Name").unwrap_or(""),
                props.get("Notes").unwrap_or(""),
                reason,
                props.get("URL").unwrap_or(""),
            )
            .map_err(|e| ProxyError::ListParse(format!("[{domain}]: {e}")))?;
            if table.insert(entry.domain.clone(), entry).is_some() {
                return Err(ProxyError::ListParse(format!(
                    "duplicate blacklist domain in [{domain}]"
                )));
            }
        }

        let count = table.len();
        *self.blacklist.lock().unwrap() = table;
        Ok(count)
    }

    /// Replace the alias table from an INI file. `None` clears the table.
    pub fn load_aliases(&self, path: Option<&Path>) -> Result<usize> {
        let Some(path) = path else {
            self.aliases.lock().unwrap().clear();
            return Ok(0);
        };
        let ini = Ini::load_from_file(path)
            .map_err(|e| ProxyError::ListParse(format!("{}: {e}", path.display())))?;

        let mut table = HashMap::new();
        let mut seen_onions = HashSet::new();
        for (section, props) in ini.iter() {
            let Some(alias) = section else { continue };
            let onion_host = props.get("Onion").unwrap_or("");
            let kind = match props.get("Type") {
                Some(raw) => AliasKind::parse(raw)
                    .map_err(|e| ProxyError::ListParse(format!("[{alias}]: {e}")))?,
                None => AliasKind::Rewrite,
            };
            let entry = AliasEntry::new(alias, onion_host, kind)
                .map_err(|e| ProxyError::ListParse(format!("[{alias}]: {e}")))?;
            if !seen_onions.insert(entry.onion.clone()) {
                return Err(ProxyError::ListParse(format!(
                    "duplicate alias target {} in [{alias}]",
                    entry.onion
                )));
            }
            if table.insert(entry.alias.clone(), entry).is_some() {
                return Err(ProxyError::ListParse(format!(
                    "duplicate alias label in [{alias}]"
                )));
            }
        }

        let count = table.len();
        *self.aliases.lock().unwrap() = table;
        Ok(count)
    }

    /// Serialize the blacklist to its configured file.
    pub fn save_blacklist(&self, path: Option<&Path>) -> Result<()> {
        let Some(path) = path else {
            return Err(ProxyError::Validation(
                "no blacklist file is configured".to_string(),
            ));
        };
        self.blacklist_ini()
            .write_to_file(path)
            .map_err(|e| ProxyError::Io(e))
    }

    /// Serialize the alias table to its configured file.
    pub fn save_aliases(&self, path: Option<&Path>) -> Result<()> {
        let Some(path) = path else {
            return Err(ProxyError::Validation(
                "no alias file is configured".to_string(),
            ));
        };
        self.aliases_ini()
            .write_to_file(path)
            .map_err(|e| ProxyError::Io(e))
    }

    fn blacklist_ini(&self) -> Ini {
        let table = self.blacklist.lock().unwrap();
        let mut domains: Vec<&String> = table.keys().collect();
        domains.sort();
        let mut ini = Ini::new();
        for domain in domains {
            table[domain].write_into(&mut ini);
        }
        ini
    }

    fn aliases_ini(&self) -> Ini {
        let table = self.aliases.lock().unwrap();
        let mut labels: Vec<&String> = table.keys().collect();
        labels.sort();
        let mut ini = Ini::new();
        for label in labels {
            table[label].write_into(&mut ini);
        }
        ini
    }

    /// INI-formatted snapshot of the blacklist.
    pub fn blacklist_ini_text(&self) -> String {
        ini_to_string(&self.blacklist_ini())
    }

    /// INI-formatted snapshot of the alias table.
    pub fn aliases_ini_text(&self) -> String {
        ini_to_string(&self.aliases_ini())
    }

    pub fn add_blacklist(&self, entry: BlacklistEntry) {
        self.blacklist
            .lock()
            .unwrap()
            .insert(entry.domain.clone(), entry);
    }

    /// Remove by normalized domain; reports whether an entry existed.
    pub fn remove_blacklist(&self, domain: &str) -> bool {
        self.blacklist.lock().unwrap().remove(domain).is_some()
    }

    /// Insert an alias, evicting any entry that shares its label or target.
    pub fn add_alias(&self, entry: AliasEntry) {
        let mut table = self.aliases.lock().unwrap();
        table.retain(|_, existing| existing.onion != entry.onion);
        table.insert(entry.alias.clone(), entry);
    }

    /// Remove every alias pointing at the given normalized onion target.
    pub fn remove_alias_target(&self, onion_host: &str) -> bool {
        let mut table = self.aliases.lock().unwrap();
        let before = table.len();
        table.retain(|_, entry| entry.onion != onion_host);
        table.len() != before
    }

    pub fn blacklisted(&self, onion_host: &str) -> Option<BlacklistEntry> {
        self.blacklist.lock().unwrap().get(onion_host).cloned()
    }

    pub fn alias_for(&self, label: &str) -> Option<AliasEntry> {
        self.aliases.lock().unwrap().get(label).cloned()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.lock().unwrap().len()
    }

    pub fn aliases_len(&self) -> usize {
        self.aliases.lock().unwrap().len()
    }
}

fn ini_to_string(ini: &Ini) -> String {
    let mut buf = Vec::new();
    // writing to a Vec cannot fail
    let _ = ini.write_to(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn onion_of(c: char) -> String {
        format!("{}.onion", c.to_string().repeat(56))
    }

    fn temp_path(stem: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "http2socks-{stem}-{}-{}.ini",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn alias_label_validation() {
        let onion = onion_of('a');
        assert!(AliasEntry::new("Short_1-x", &onion, AliasKind::Rewrite).is_ok());
        assert!(AliasEntry::new("", &onion, AliasKind::Rewrite).is_err());
        assert!(AliasEntry::new("-leading", &onion, AliasKind::Rewrite).is_err());
        assert!(AliasEntry::new("dou--ble", &onion, AliasKind::Rewrite).is_err());
        assert!(AliasEntry::new("dot.ted", &onion, AliasKind::Rewrite).is_err());
        assert!(AliasEntry::new("spa ce", &onion, AliasKind::Rewrite).is_err());

        let entry = AliasEntry::new("MixedCase", &onion, AliasKind::Rewrite).unwrap();
        assert_eq!(entry.alias, "mixedcase");
        assert_eq!(entry.onion, onion);
    }

    #[test]
    fn blacklist_entry_validation() {
        let onion = onion_of('b');
        assert!(BlacklistEntry::new(&onion, "ok", "ok", BlockReason::Forbidden, "").is_ok());
        assert!(BlacklistEntry::new("not-an-onion", "", "", BlockReason::Forbidden, "").is_err());
        assert!(BlacklistEntry::new(&onion, "line\nbreak", "", BlockReason::Forbidden, "").is_err());
        assert!(BlacklistEntry::new(&onion, "", "line\rbreak", BlockReason::Forbidden, "").is_err());
        assert!(BlacklistEntry::new(&onion, "", "", BlockReason::LegalReasons, "not a url").is_err());
        assert!(
            BlacklistEntry::new(&onion, "", "", BlockReason::LegalReasons, "/relative").is_err()
        );
        assert!(
            BlacklistEntry::new(&onion, "", "", BlockReason::LegalReasons, "https://ex/why").is_ok()
        );
    }

    #[test]
    fn reason_and_kind_parsing() {
        assert_eq!(BlockReason::parse("403").unwrap(), BlockReason::Forbidden);
        assert_eq!(BlockReason::parse("451").unwrap(), BlockReason::LegalReasons);
        assert_eq!(
            BlockReason::parse("forbidden").unwrap(),
            BlockReason::Forbidden
        );
        assert!(BlockReason::parse("404").is_err());

        assert_eq!(AliasKind::parse("0").unwrap(), AliasKind::Rewrite);
        assert_eq!(AliasKind::parse("1").unwrap(), AliasKind::Redirect);
        assert_eq!(AliasKind::parse("Redirect").unwrap(), AliasKind::Redirect);
        assert!(AliasKind::parse("2").is_err());
    }

    #[test]
    fn alias_table_keeps_both_keys_unique() {
        let store = ListsStore::default();
        store.add_alias(AliasEntry::new("one", &onion_of('a'), AliasKind::Rewrite).unwrap());
        store.add_alias(AliasEntry::new("two", &onion_of('b'), AliasKind::Rewrite).unwrap());

        // same label, new target: replaces "one"
        store.add_alias(AliasEntry::new("one", &onion_of('c'), AliasKind::Rewrite).unwrap());
        assert_eq!(store.aliases_len(), 2);
        assert_eq!(store.alias_for("one").unwrap().onion, onion_of('c'));

        // new label, target already claimed by "two": evicts "two"
        store.add_alias(AliasEntry::new("three", &onion_of('b'), AliasKind::Redirect).unwrap());
        assert_eq!(store.aliases_len(), 2);
        assert!(store.alias_for("two").is_none());
        assert_eq!(store.alias_for("three").unwrap().onion, onion_of('b'));
    }

    #[test]
    fn blacklist_add_then_remove_leaves_no_entry() {
        let store = ListsStore::default();
        let domain = onion_of('d');
        store.add_blacklist(
            BlacklistEntry::new(&domain, "", "", BlockReason::Forbidden, "").unwrap(),
        );
        assert!(store.blacklisted(&domain).is_some());
        assert!(store.remove_blacklist(&domain));
        assert!(store.blacklisted(&domain).is_none());
        assert!(!store.remove_blacklist(&domain));
    }

    #[test]
    fn remove_alias_target_drops_matching_entries() {
        let store = ListsStore::default();
        store.add_alias(AliasEntry::new("one", &onion_of('a'), AliasKind::Rewrite).unwrap());
        assert!(store.remove_alias_target(&onion_of('a')));
        assert_eq!(store.aliases_len(), 0);
        assert!(!store.remove_alias_target(&onion_of('a')));
    }

    #[test]
    fn blacklist_save_load_round_trip() {
        let store = ListsStore::default();
        store.add_blacklist(
            BlacklistEntry::new(
                &onion_of('e'),
                "Example Site",
                "internal note",
                BlockReason::LegalReasons,
                "https://ex/why",
            )
            .unwrap(),
        );
        store.add_blacklist(
            BlacklistEntry::new(&onion_of('f'), "", "", BlockReason::Forbidden, "").unwrap(),
        );

        let path = temp_path("bl");
        store.save_blacklist(Some(&path)).unwrap();

        let restored = ListsStore::default();
        assert_eq!(restored.load_blacklist(Some(&path)).unwrap(), 2);
        let entry = restored.blacklisted(&onion_of('e')).unwrap();
        assert_eq!(entry.name, "Example Site");
        assert_eq!(entry.notes, "internal note");
        assert_eq!(entry.reason, BlockReason::LegalReasons);
        assert_eq!(entry.url, "https://ex/why");
        assert_eq!(
            restored.blacklisted(&onion_of('f')).unwrap().reason,
            BlockReason::Forbidden
        );
        assert_eq!(restored.blacklist_ini_text(), store.blacklist_ini_text());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn alias_save_load_round_trip() {
        let store = ListsStore::default();
        store.add_alias(AliasEntry::new("news", &onion_of('a'), AliasKind::Redirect).unwrap());
        store.add_alias(AliasEntry::new("mail", &onion_of('b'), AliasKind::Rewrite).unwrap());

        let path = temp_path("al");
        store.save_aliases(Some(&path)).unwrap();

        let restored = ListsStore::default();
        assert_eq!(restored.load_aliases(Some(&path)).unwrap(), 2);
        assert_eq!(restored.alias_for("news").unwrap().kind, AliasKind::Redirect);
        assert_eq!(restored.alias_for("mail").unwrap().kind, AliasKind::Rewrite);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn failed_reload_keeps_existing_table() {
        let store = ListsStore::default();
        store.add_blacklist(
            BlacklistEntry::new(&onion_of('a'), "", "", BlockReason::Forbidden, "").unwrap(),
        );

        let path = temp_path("bad");
        std::fs::write(&path, "[not-an-onion]\nReason=403\n").unwrap();
        assert!(store.load_blacklist(Some(&path)).is_err());
        assert_eq!(store.blacklist_len(), 1);
        assert!(store.blacklisted(&onion_of('a')).is_some());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_without_path_clears_table() {
        let store = ListsStore::default();
        store.add_blacklist(
            BlacklistEntry::new(&onion_of('a'), "", "", BlockReason::Forbidden, "").unwrap(),
        );
        assert_eq!(store.load_blacklist(None).unwrap(), 0);
        assert_eq!(store.blacklist_len(), 0);
    }

    #[test]
    fn save_without_path_fails() {
        let store = ListsStore::default();
        assert!(store.save_blacklist(None).is_err());
        assert!(store.save_aliases(None).is_err());
    }

    #[test]
    fn duplicate_alias_target_fails_load() {
        let path = temp_path("dup");
        let onion = onion_of('a');
        std::fs::write(
            &path,
            format!("[one]\nOnion={onion}\nType=0\n[two]\nOnion={onion}\nType=1\n"),
        )
        .unwrap();
        let store = ListsStore::default();
        assert!(store.load_aliases(Some(&path)).is_err());
        assert_eq!(store.aliases_len(), 0);

        std::fs::remove_file(&path).ok();
    }
}
