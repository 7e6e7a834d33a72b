// Peer config blocks inside the daemon configuration file

//! Peer config store
//!
//! The daemon configuration file is the source of truth for peer membership.
//! Each peer lives in a block delimited by `# BEGIN_PEER <name>` and
//! `# END_PEER <name>`; a peer is disabled by prefixing every line of its
//! block with `# `.
//!
//! The free functions in this module are pure text transforms so they can be
//! tested without a filesystem. [`PeerConfigStore`] applies them to the file
//! and asks the daemon to resync.

use crate::daemon::Daemon;
use crate::error::{validate_name, Error, Result};
use crate::state_file::write_atomic;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use wireguard_control::Key;

const BEGIN_MARKER: &str = "# BEGIN_PEER ";
const END_MARKER: &str = "# END_PEER ";
const DISABLE_MARKER: &str = "# ";

/// Byte offsets of one peer block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockSpan {
    /// Start of the BEGIN line
    start: usize,
    /// Start of the first content line
    content_start: usize,
    /// Start of the END line
    content_end: usize,
    /// End of the END line, including its newline
    end: usize,
}

/// One peer as described by the config text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
    pub public_key: Option<String>,
    pub allowed_ips: Option<String>,
    pub blocked: bool,
}

/// Iterate lines with their byte offset, keeping line endings
fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line))
    })
}

fn marker_name<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.trim_end().strip_prefix(marker).map(str::trim)
}

fn find_block(text: &str, name: &str) -> Option<BlockSpan> {
    let mut begin: Option<(usize, usize)> = None;

    for (offset, line) in lines_with_offsets(text) {
        match begin {
            None => {
                if marker_name(line, BEGIN_MARKER) == Some(name) {
                    begin = Some((offset, offset + line.len()));
                }
            }
            Some((start, content_start)) => {
                if marker_name(line, END_MARKER) == Some(name) {
                    return Some(BlockSpan {
                        start,
                        content_start,
                        content_end: offset,
                        end: offset + line.len(),
                    });
                }
            }
        }
    }

    None
}

fn is_disabled_line(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn content_is_blocked(content: &str) -> bool {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .all(is_disabled_line)
}

fn block_content<'a>(text: &'a str, name: &str) -> Result<(BlockSpan, &'a str)> {
    let span = find_block(text, name).ok_or_else(|| Error::NotFound(name.to_string()))?;
    Ok((span, &text[span.content_start..span.content_end]))
}

fn splice(text: &str, span: BlockSpan, content: &str) -> String {
    let mut out = String::with_capacity(text.len() + content.len());
    out.push_str(&text[..span.content_start]);
    out.push_str(content);
    out.push_str(&text[span.content_end..]);
    out
}

/// Whether every non-empty line of the peer's block is in disabled form
pub fn is_blocked(text: &str, name: &str) -> Result<bool> {
    let (_, content) = block_content(text, name)?;
    Ok(content_is_blocked(content))
}

/// Prefix every active, non-empty line of the peer's block with the disable marker
pub fn block_text(text: &str, name: &str) -> Result<String> {
    let (span, content) = block_content(text, name)?;

    let blocked: String = content
        .split_inclusive('\n')
        .map(|line| {
            if line.trim().is_empty() || is_disabled_line(line) {
                line.to_string()
            } else {
                format!("{}{}", DISABLE_MARKER, line)
            }
        })
        .collect();

    Ok(splice(text, span, &blocked))
}

/// Remove one disable marker from every disabled line of the peer's block
pub fn unblock_text(text: &str, name: &str) -> Result<String> {
    let (span, content) = block_content(text, name)?;

    let unblocked: String = content
        .split_inclusive('\n')
        .map(|line| {
            let indent = line.len() - line.trim_start().len();
            let (lead, rest) = line.split_at(indent);
            match rest
                .strip_prefix(DISABLE_MARKER)
                .or_else(|| rest.strip_prefix('#'))
            {
                Some(stripped) => format!("{}{}", lead, stripped),
                None => line.to_string(),
            }
        })
        .collect();

    Ok(splice(text, span, &unblocked))
}

/// Drop the peer's block entirely; text without the block is returned unchanged
pub fn remove_block(text: &str, name: &str) -> String {
    match find_block(text, name) {
        Some(span) => {
            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..span.start]);
            out.push_str(&text[span.end..]);
            out
        }
        None => text.to_string(),
    }
}

/// Value of a `Key = value` directive, also when the line is disabled
fn directive<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let line = line.trim_start().trim_start_matches('#').trim();
    let (k, v) = line.split_once('=')?;
    if k.trim() == key {
        Some(v.trim())
    } else {
        None
    }
}

/// All peers in the config text, in file order
pub fn peers(text: &str) -> Vec<PeerEntry> {
    let mut entries = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for (_, line) in lines_with_offsets(text) {
        if let Some((name, body)) = current.as_mut() {
            if marker_name(line, END_MARKER) == Some(name.as_str()) {
                let content = body.concat();
                let find = |key: &str| {
                    body.iter()
                        .find_map(|l| directive(l, key))
                        .map(str::to_string)
                };
                entries.push(PeerEntry {
                    name: name.clone(),
                    public_key: find("PublicKey").filter(|k| Key::from_base64(k).is_ok()),
                    allowed_ips: find("AllowedIPs"),
                    blocked: content_is_blocked(&content),
                });
                current = None;
            } else {
                body.push(line);
            }
        } else if let Some(name) = marker_name(line, BEGIN_MARKER) {
            current = Some((name.to_string(), Vec::new()));
        }
    }

    entries
}

/// Map of public key -> peer name for every block with a valid key
pub fn key_index(text: &str) -> HashMap<String, String> {
    peers(text)
        .into_iter()
        .filter_map(|entry| entry.public_key.map(|key| (key, entry.name)))
        .collect()
}

/// Reads and rewrites the daemon config file and triggers daemon resyncs
pub struct PeerConfigStore<D> {
    path: PathBuf,
    interface: String,
    daemon: Arc<D>,
    /// Serializes read-modify-write-resync of the shared file across peers
    file_lock: Mutex<()>,
}

impl<D: Daemon> PeerConfigStore<D> {
    /// Create a store for `path`, resynced as `interface`
    pub fn new(path: PathBuf, interface: String, daemon: Arc<D>) -> Result<Self> {
        validate_name(&interface)?;
        Ok(Self {
            path,
            interface,
            daemon,
            file_lock: Mutex::new(()),
        })
    }

    /// The daemon this store resyncs
    pub fn daemon(&self) -> &Arc<D> {
        &self.daemon
    }

    /// Path of the daemon config file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current config text
    pub fn read(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }

    /// Whether the peer's block is fully disabled
    pub fn is_blocked(&self, name: &str) -> Result<bool> {
        is_blocked(&self.read()?, name)
    }

    /// All peers currently in the config file
    pub fn peers(&self) -> Result<Vec<PeerEntry>> {
        Ok(peers(&self.read()?))
    }

    /// Disable the peer's block and resync the daemon
    pub async fn block(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.rewrite(name, block_text).await?;
        log::info!("Blocked peer {}", name);
        Ok(())
    }

    /// Re-enable the peer's block and resync the daemon
    pub async fn unblock(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.rewrite(name, unblock_text).await?;
        log::info!("Unblocked peer {}", name);
        Ok(())
    }

    /// Remove the peer's block and resync the daemon; absent blocks are a no-op
    pub async fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _guard = self.file_lock.lock().await;

        let text = self.read()?;
        if find_block(&text, name).is_none() {
            log::debug!("Peer {} already absent from {:?}", name, self.path);
            return Ok(());
        }

        self.commit(&text, &remove_block(&text, name)).await?;
        log::info!("Removed peer {} from {:?}", name, self.path);
        Ok(())
    }

    /// Ask the daemon to reload the config file
    pub async fn resync(&self) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        self.resync_locked().await
    }

    async fn rewrite(&self, name: &str, transform: fn(&str, &str) -> Result<String>) -> Result<()> {
        let _guard = self.file_lock.lock().await;

        let text = self.read()?;
        let updated = transform(&text, name)?;
        self.commit(&text, &updated).await
    }

    /// Write `updated` and resync; on a failed resync the previous text is restored
    async fn commit(&self, previous: &str, updated: &str) -> Result<()> {
        if updated != previous {
            write_atomic(&self.path, updated)?;
        }

        if let Err(e) = self.resync_locked().await {
            if updated != previous {
                if let Err(restore) = write_atomic(&self.path, previous) {
                    log::error!("Failed to restore {:?} after failed resync: {}", self.path, restore);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn resync_locked(&self) -> Result<()> {
        let stripped = self.daemon.strip(&self.path).await?;

        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(stripped.as_bytes())?;
        temp.flush()?;

        self.daemon.syncconf(&self.interface, temp.path()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::daemon::PeerStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    pub const KEY_ALICE: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBA=";
    pub const KEY_BOB: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCA=";

    pub fn sample_config() -> String {
        format!(
            "[Interface]\n\
             PrivateKey = server\n\
             Address = 10.8.0.1/24\n\
             ListenPort = 51820\n\
             \n\
             # BEGIN_PEER alice\n\
             [Peer]\n\
             PublicKey = {KEY_ALICE}\n\
             PresharedKey = psk_alice\n\
             AllowedIPs = 10.8.0.2/32\n\
             # END_PEER alice\n\
             \n\
             # BEGIN_PEER alice2\n\
             [Peer]\n\
             PublicKey = not-a-key\n\
             AllowedIPs = 10.8.0.4/32\n\
             # END_PEER alice2\n\
             \n\
             # BEGIN_PEER bob\n\
             [Peer]\n\
             PublicKey = {KEY_BOB}\n\
             AllowedIPs = 10.8.0.3/32, fd00::3/128\n\
             # END_PEER bob\n"
        )
    }

    /// In-memory daemon recording resyncs
    #[derive(Default)]
    pub struct FakeDaemon {
        pub stats: StdMutex<HashMap<String, Vec<PeerStats>>>,
        pub fail_resync: AtomicBool,
        pub fail_query: AtomicBool,
        pub resyncs: AtomicUsize,
    }

    impl FakeDaemon {
        pub fn set_transfer(&self, interface: &str, key: &str, rx: u64, tx: u64) {
            let mut stats = self.stats.lock().unwrap();
            let peers = stats.entry(interface.to_string()).or_default();
            peers.retain(|p| p.public_key != key);
            peers.push(PeerStats {
                public_key: key.to_string(),
                endpoint: Some("198.51.100.4:40000".to_string()),
                latest_handshake: Some(1_760_000_000),
                rx_bytes: rx,
                tx_bytes: tx,
            });
        }
    }

    #[async_trait]
    impl Daemon for FakeDaemon {
        async fn interfaces(&self) -> Result<Vec<String>> {
            if self.fail_query.load(Ordering::SeqCst) {
                return Err(Error::daemon("wg show interfaces", "exit status 1"));
            }
            let mut names: Vec<String> = self.stats.lock().unwrap().keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        async fn peers(&self, interface: &str) -> Result<Vec<PeerStats>> {
            if self.fail_query.load(Ordering::SeqCst) {
                return Err(Error::daemon("wg show dump", "exit status 1"));
            }
            Ok(self
                .stats
                .lock()
                .unwrap()
                .get(interface)
                .cloned()
                .unwrap_or_default())
        }

        async fn strip(&self, config_file: &Path) -> Result<String> {
            Ok(fs::read_to_string(config_file)?)
        }

        async fn syncconf(&self, interface: &str, _stripped: &Path) -> Result<()> {
            if self.fail_resync.load(Ordering::SeqCst) {
                return Err(Error::daemon(format!("wg syncconf {interface}"), "exit status 1"));
            }
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn block_of<'a>(text: &'a str, name: &str) -> &'a str {
        let span = find_block(text, name).unwrap();
        &text[span.content_start..span.content_end]
    }

    #[test]
    fn test_find_block_exact_name() {
        let text = sample_config();
        assert!(block_of(&text, "alice").contains(KEY_ALICE));
        assert!(block_of(&text, "alice2").contains("not-a-key"));
        assert!(find_block(&text, "ali").is_none());
        assert!(find_block(&text, "carol").is_none());
    }

    #[test]
    fn test_is_blocked_missing_peer() {
        let err = is_blocked(&sample_config(), "carol").unwrap_err();
        assert!(matches!(err, Error::NotFound(name) if name == "carol"));
    }

    #[test]
    fn test_block_only_touches_target() {
        let text = sample_config();
        let blocked = block_text(&text, "alice").unwrap();

        assert!(is_blocked(&blocked, "alice").unwrap());
        assert!(!is_blocked(&blocked, "alice2").unwrap());
        assert!(!is_blocked(&blocked, "bob").unwrap());
        assert_eq!(
            block_of(&blocked, "alice"),
            format!(
                "# [Peer]\n# PublicKey = {KEY_ALICE}\n# PresharedKey = psk_alice\n# AllowedIPs = 10.8.0.2/32\n"
            )
        );
        assert_eq!(block_of(&blocked, "bob"), block_of(&text, "bob"));
    }

    #[test]
    fn test_unblock_is_left_inverse_of_block() {
        let text = sample_config();
        for name in ["alice", "alice2", "bob"] {
            let blocked = block_text(&text, name).unwrap();
            assert_ne!(blocked, text);
            assert_eq!(unblock_text(&blocked, name).unwrap(), text);
        }
    }

    #[test]
    fn test_inverse_preserves_blank_lines_and_crlf() {
        let text = "# BEGIN_PEER dave\r\n[Peer]\r\n\r\n  PublicKey = k\r\nAllowedIPs = 10.8.0.9/32\r\n# END_PEER dave\r\n";
        let blocked = block_text(text, "dave").unwrap();
        assert!(is_blocked(&blocked, "dave").unwrap());
        assert_eq!(unblock_text(&blocked, "dave").unwrap(), text);
    }

    #[test]
    fn test_block_is_idempotent() {
        let text = sample_config();
        let once = block_text(&text, "bob").unwrap();
        let twice = block_text(&once, "bob").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_partially_disabled_is_active() {
        let text = "# BEGIN_PEER eve\n# [Peer]\nPublicKey = k\n# END_PEER eve\n";
        assert!(!is_blocked(text, "eve").unwrap());

        let blocked = block_text(text, "eve").unwrap();
        assert_eq!(
            blocked,
            "# BEGIN_PEER eve\n# [Peer]\n# PublicKey = k\n# END_PEER eve\n"
        );
    }

    #[test]
    fn test_unblock_accepts_bare_hash_marker() {
        let text = "# BEGIN_PEER eve\n#[Peer]\n#PublicKey = k\n# END_PEER eve\n";
        assert!(is_blocked(text, "eve").unwrap());
        assert_eq!(
            unblock_text(text, "eve").unwrap(),
            "# BEGIN_PEER eve\n[Peer]\nPublicKey = k\n# END_PEER eve\n"
        );
    }

    #[test]
    fn test_empty_block_is_vacuously_blocked() {
        let text = "# BEGIN_PEER ghost\n\n# END_PEER ghost\n";
        assert!(is_blocked(text, "ghost").unwrap());
    }

    #[test]
    fn test_unterminated_block_not_found() {
        let text = "# BEGIN_PEER frank\n[Peer]\nPublicKey = k\n";
        assert!(matches!(block_text(text, "frank"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_remove_block() {
        let text = sample_config();
        let removed = remove_block(&text, "alice");
        assert!(find_block(&removed, "alice").is_none());
        assert!(find_block(&removed, "alice2").is_some());
        assert!(find_block(&removed, "bob").is_some());
        assert!(!removed.contains(KEY_ALICE));

        // Absent peer leaves the text alone
        assert_eq!(remove_block(&removed, "alice"), removed);
    }

    #[test]
    fn test_peers_listing() {
        let text = block_text(&sample_config(), "bob").unwrap();
        let entries = peers(&text);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alice", "alice2", "bob"]);

        assert_eq!(entries[0].public_key.as_deref(), Some(KEY_ALICE));
        assert_eq!(entries[0].allowed_ips.as_deref(), Some("10.8.0.2/32"));
        assert!(!entries[0].blocked);

        // Invalid keys are not indexed
        assert_eq!(entries[1].public_key, None);

        // Directives are still readable while blocked
        assert_eq!(entries[2].public_key.as_deref(), Some(KEY_BOB));
        assert_eq!(entries[2].allowed_ips.as_deref(), Some("10.8.0.3/32, fd00::3/128"));
        assert!(entries[2].blocked);
    }

    #[test]
    fn test_key_index() {
        let index = key_index(&sample_config());
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(KEY_ALICE).map(String::as_str), Some("alice"));
        assert_eq!(index.get(KEY_BOB).map(String::as_str), Some("bob"));
    }

    fn store_with(daemon: Arc<FakeDaemon>) -> (tempfile::TempDir, PeerConfigStore<FakeDaemon>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("awg0.conf");
        fs::write(&path, sample_config()).unwrap();
        let store = PeerConfigStore::new(path, "awg0".to_string(), daemon).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_block_unblock_roundtrip() {
        let daemon = Arc::new(FakeDaemon::default());
        let (_dir, store) = store_with(daemon.clone());

        store.block("alice").await.unwrap();
        assert!(store.is_blocked("alice").unwrap());
        assert!(!store.is_blocked("bob").unwrap());

        store.unblock("alice").await.unwrap();
        assert_eq!(store.read().unwrap(), sample_config());
        assert_eq!(daemon.resyncs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_block_missing_peer() {
        let daemon = Arc::new(FakeDaemon::default());
        let (_dir, store) = store_with(daemon.clone());

        let err = store.block("carol").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.read().unwrap(), sample_config());
        assert_eq!(daemon.resyncs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_resync_failure_surfaces() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.fail_resync.store(true, Ordering::SeqCst);
        let (_dir, store) = store_with(daemon);

        let err = store.block("alice").await.unwrap_err();
        assert!(matches!(err, Error::DaemonCallFailed { .. }));
        assert_eq!(store.read().unwrap(), sample_config());
        assert!(!store.is_blocked("alice").unwrap());
    }

    #[tokio::test]
    async fn test_store_failed_unblock_keeps_block() {
        let daemon = Arc::new(FakeDaemon::default());
        let (_dir, store) = store_with(daemon.clone());
        store.block("bob").await.unwrap();
        let blocked = store.read().unwrap();

        daemon.fail_resync.store(true, Ordering::SeqCst);
        assert!(store.unblock("bob").await.is_err());
        assert_eq!(store.read().unwrap(), blocked);

        daemon.fail_resync.store(false, Ordering::SeqCst);
        store.unblock("bob").await.unwrap();
        assert_eq!(store.read().unwrap(), sample_config());
    }

    #[tokio::test]
    async fn test_store_failed_remove_keeps_block() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.fail_resync.store(true, Ordering::SeqCst);
        let (_dir, store) = store_with(daemon);

        assert!(store.remove("alice").await.is_err());
        assert_eq!(store.read().unwrap(), sample_config());
    }

    #[tokio::test]
    async fn test_store_rejects_unsafe_name() {
        let daemon = Arc::new(FakeDaemon::default());
        let (_dir, store) = store_with(daemon);
        assert!(matches!(
            store.block("alice\n# END_PEER alice").await,
            Err(Error::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_store_remove_idempotent() {
        let daemon = Arc::new(FakeDaemon::default());
        let (_dir, store) = store_with(daemon.clone());

        store.remove("alice").await.unwrap();
        store.remove("alice").await.unwrap();
        let names: Vec<String> = store.peers().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["alice2", "bob"]);
        assert_eq!(daemon.resyncs.load(Ordering::SeqCst), 1);
    }
}
