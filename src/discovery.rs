//! Service discovery: find processes started with `NAME=<label>` in their
//! environment, figure out which TCP port each one listens on, and cache
//! the resulting `name → port` mapping.
//!
//! Discovery is a pure function of OS state. It never fails a connection:
//! scan errors are logged and the previous mapping is retained.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{process::Command, sync::Mutex};
use tracing::{debug, warn};

/// Well-known debugger ports that are never the service's real port.
const DEBUG_PORTS: [u16; 3] = [9229, 9222, 5858];

/// First port of the OS ephemeral range.
const EPHEMERAL_START: u16 = 49152;

/// Environment variable that registers a process with the proxy.
const NAME_VAR: &str = "NAME";

/// One discovered process/port pair belonging to a named service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub port: u16,
    pub pid: u32,
    pub command: String,
}

/// Which external tool enumerates listening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DiscoveryCommand {
    /// `lsof -nP -iTCP -sTCP:LISTEN`
    Lsof,
    /// `ss -ltnpH`
    Ss,
}

impl Default for DiscoveryCommand {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Ss
        } else {
            Self::Lsof
        }
    }
}

impl DiscoveryCommand {
    fn program(&self) -> &'static str {
        match self {
            Self::Lsof => "lsof",
            Self::Ss => "ss",
        }
    }
}

impl std::fmt::Display for DiscoveryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A listening socket attributed to a process.
#[derive(Debug, PartialEq, Eq)]
struct Listener {
    pid: u32,
    port: u16,
    command: String,
}

/// Scans the local host and returns one entry per discovered service.
pub async fn scan(command: DiscoveryCommand) -> Result<Vec<ServiceEntry>, DiscoveryError> {
    let listeners = list_listeners(command).await?;
    debug!(sockets = listeners.len(), "enumerated listening sockets");

    // Deduplicate ports per pid.
    let mut by_pid: BTreeMap<u32, (BTreeSet<u16>, String)> = BTreeMap::new();
    for l in listeners {
        let entry = by_pid.entry(l.pid).or_insert_with(|| (BTreeSet::new(), l.command));
        entry.0.insert(l.port);
    }

    // Group pids by their NAME value; a process without NAME is ignored.
    let mut by_name: BTreeMap<String, (BTreeSet<u16>, u32, String)> = BTreeMap::new();
    for (pid, (ports, command)) in by_pid {
        let Some(name) = read_service_name(pid).await else {
            continue;
        };
        debug!(%name, pid, ?ports, "found named process");
        let entry = by_name
            .entry(name)
            .or_insert_with(|| (BTreeSet::new(), pid, command.clone()));
        entry.0.extend(ports);
        // Last writer wins on the representative pid.
        entry.1 = pid;
        entry.2 = command;
    }

    let entries = by_name
        .into_iter()
        .filter_map(|(name, (ports, pid, command))| {
            select_port(&ports).map(|port| ServiceEntry {
                name,
                port,
                pid,
                command,
            })
        })
        .collect();
    Ok(entries)
}

/// Builds the routing mapping from scan results.
pub fn build_mapping(entries: &[ServiceEntry]) -> HashMap<String, u16> {
    entries
        .iter()
        .map(|e| (e.name.clone(), e.port))
        .collect()
}

/// Picks the service port from the union of a name's listening ports:
/// drop debugger ports and the ephemeral range, take the smallest
/// survivor, and fall back to the smallest overall when nothing survives.
fn select_port(ports: &BTreeSet<u16>) -> Option<u16> {
    ports
        .iter()
        .copied()
        .find(|p| !DEBUG_PORTS.contains(p) && *p < EPHEMERAL_START)
        .or_else(|| ports.iter().copied().next())
}

async fn list_listeners(command: DiscoveryCommand) -> Result<Vec<Listener>, DiscoveryError> {
    let output = match command {
        DiscoveryCommand::Lsof => {
            Command::new("lsof")
                .args(["-nP", "-iTCP", "-sTCP:LISTEN"])
                .output()
                .await
        }
        DiscoveryCommand::Ss => Command::new("ss").args(["-ltnpH"]).output().await,
    }
    .map_err(|source| DiscoveryError::Spawn {
        command: command.program(),
        source,
    })?;

    // lsof exits non-zero when no socket matches; whatever made it to
    // stdout is still valid.
    if !output.status.success() {
        debug!(command = command.program(), status = ?output.status, "discovery command exited non-zero");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(match command {
        DiscoveryCommand::Lsof => parse_lsof(&stdout),
        DiscoveryCommand::Ss => parse_ss(&stdout),
    })
}

/// Parses `lsof -nP -iTCP -sTCP:LISTEN` output.
fn parse_lsof(output: &str) -> Vec<Listener> {
    let mut listeners = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue; // header line
        };
        let addr = if fields.last() == Some(&"(LISTEN)") {
            fields[fields.len() - 2]
        } else {
            fields[fields.len() - 1]
        };
        let Some(port) = addr.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        listeners.push(Listener {
            pid,
            port,
            command: fields[0].to_string(),
        });
    }
    listeners
}

/// Parses `ss -ltnpH` output. Sockets without process attribution (e.g.
/// other users' processes) are skipped.
fn parse_ss(output: &str) -> Vec<Listener> {
    let mut listeners = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] == "State" {
            continue;
        }
        let Some(port) = fields[3]
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let Some(process) = fields.iter().find(|f| f.contains("pid=")) else {
            continue;
        };
        let Some(pid) = process
            .split("pid=")
            .nth(1)
            .map(|rest| rest.chars().take_while(char::is_ascii_digit).collect::<String>())
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        let command = process
            .split("((\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap_or("")
            .to_string();
        listeners.push(Listener { pid, port, command });
    }
    listeners
}

/// Reads the `NAME` value from a process's environment.
///
/// Prefers `/proc/<pid>/environ` (NUL-separated, unambiguous) and falls
/// back to `ps eww`, whose single-line output needs heuristic splitting.
async fn read_service_name(pid: u32) -> Option<String> {
    if let Ok(environ) = tokio::fs::read(format!("/proc/{pid}/environ")).await {
        return env_from_environ(&environ);
    }
    let output = Command::new("ps")
        .args(["eww", "-o", "command=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    env_value(&String::from_utf8_lossy(&output.stdout), NAME_VAR)
}

fn env_from_environ(environ: &[u8]) -> Option<String> {
    environ
        .split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| entry.strip_prefix("NAME=").map(ToOwned::to_owned))
}

/// Extracts an environment value from a `ps eww` command line.
///
/// The line holds the command followed by all env vars, space-separated,
/// with values that may themselves contain spaces. Assignments are
/// recognized at *space, identifier, `=`* boundaries; everything up to
/// the next boundary belongs to the preceding value. A value containing a
/// literal ` KEY=` sequence mis-splits (accepted limitation).
fn env_value(line: &str, key: &str) -> Option<String> {
    let line = line.trim_end();
    let bytes = line.as_bytes();
    let mut starts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if (i == 0 || bytes[i - 1] == b' ')
            && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_')
        {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'=' {
                starts.push(i);
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }

    for (idx, &start) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|&next| next)
            .unwrap_or(line.len());
        let segment = line[start..end].trim_end();
        if let Some((k, v)) = segment.split_once('=')
            && k == key
        {
            return Some(v.to_string());
        }
    }
    None
}

/// The cached `name → port` mapping.
///
/// Readers get an `Arc` snapshot that is swapped atomically on refresh,
/// so a half-built map is never observable. Refresh runs under the lock:
/// concurrent callers queue behind one scan and reuse its result.
pub struct ServiceMap {
    command: DiscoveryCommand,
    ttl: Duration,
    state: Mutex<CacheState>,
}

struct CacheState {
    mapping: Arc<HashMap<String, u16>>,
    refreshed_at: Option<Instant>,
}

impl ServiceMap {
    pub fn new(command: DiscoveryCommand, ttl: Duration) -> Self {
        Self {
            command,
            ttl,
            state: Mutex::new(CacheState {
                mapping: Arc::new(HashMap::new()),
                refreshed_at: None,
            }),
        }
    }

    /// A mapping that never rescans; used when routes are known up front.
    pub fn fixed(mapping: HashMap<String, u16>) -> Self {
        Self {
            command: DiscoveryCommand::default(),
            ttl: Duration::MAX,
            state: Mutex::new(CacheState {
                mapping: Arc::new(mapping),
                refreshed_at: Some(Instant::now()),
            }),
        }
    }

    /// Returns the current mapping, rescanning when the TTL has lapsed.
    ///
    /// On scan failure the previous mapping is retained and the timestamp
    /// still advances, so a broken discovery tool cannot hot-loop.
    pub async fn mapping(&self) -> Arc<HashMap<String, u16>> {
        let mut state = self.state.lock().await;
        let fresh = state
            .refreshed_at
            .is_some_and(|at| at.elapsed() <= self.ttl);
        if fresh {
            return state.mapping.clone();
        }
        match scan(self.command).await {
            Ok(entries) => {
                debug!(services = entries.len(), "discovery scan complete");
                state.mapping = Arc::new(build_mapping(&entries));
            }
            Err(err) => warn!("service discovery failed: {err}"),
        }
        state.refreshed_at = Some(Instant::now());
        state.mapping.clone()
    }
}
