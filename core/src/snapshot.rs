//! Durable, compacting append-log of cluster state (component M)
//!
//! Single-writer, append-only text log, grounded on the same load/atomic-save
//! discipline used elsewhere in this codebase for on-disk state (write to a
//! temp file, `rename` into place) but line-oriented instead of JSON, using
//! `alive: NAME ADDR:PORT` / `not-alive: NAME` / `clock: N` records.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{MeshError, Result};
use crate::member::MemberEventKind;

/// In-memory projection of the log, rebuilt on open by reconstructing the
/// alive-set and the three clock values.
#[derive(Debug, Clone, Default)]
pub struct SnapshotState {
    pub alive: HashMap<String, String>,
    pub last_clock: u64,
    pub last_event_clock: u64,
    pub last_query_clock: u64,
    pub left: bool,
}

/// One event the snapshotter can be asked to record. Mirrors the event sink
/// kinds the node forwards to this component.
pub enum SnapshotEvent {
    Member { kind: MemberEventKind, name: String, addr: Option<String> },
    UserEventClock(u64),
    QueryClock(u64),
    StatusClock(u64),
}

/// Append-only, periodically compacted snapshot writer/reader.
pub struct Snapshotter {
    path: PathBuf,
    max_size_bytes: u64,
    state: SnapshotState,
}

impl Snapshotter {
    /// Open (or create) the snapshot at `path`, replaying any existing
    /// content into [`SnapshotState`].
    pub fn open(path: impl AsRef<Path>, max_size_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            Self::replay(&path)?
        } else {
            SnapshotState::default()
        };
        Ok(Self {
            path,
            max_size_bytes,
            state,
        })
    }

    pub fn alive_nodes(&self) -> Vec<String> {
        self.state.alive.keys().cloned().collect()
    }

    /// Parsed addresses for every alive node recorded at open time, used as
    /// rejoin hints on restart. Records with an unparseable or empty address
    /// (e.g. a placeholder member never authoritatively confirmed) are
    /// skipped rather than failing the whole recovery.
    pub fn alive_addrs(&self) -> Vec<SocketAddr> {
        self.state
            .alive
            .values()
            .filter_map(|addr| addr.parse().ok())
            .collect()
    }

    pub fn last_clock(&self) -> u64 {
        self.state.last_clock
    }

    pub fn last_event_clock(&self) -> u64 {
        self.state.last_event_clock
    }

    pub fn last_query_clock(&self) -> u64 {
        self.state.last_query_clock
    }

    fn replay(path: &Path) -> Result<SnapshotState> {
        let file = File::open(path)?;
        let mut state = SnapshotState::default();
        for line in BufReader::new(file).lines() {
            let line = line?;
            Self::apply_line(&mut state, &line);
        }
        Ok(state)
    }

    fn apply_line(state: &mut SnapshotState, line: &str) {
        if let Some(rest) = line.strip_prefix("alive: ") {
            if let Some((name, addr)) = rest.split_once(' ') {
                state.alive.insert(name.to_string(), addr.to_string());
            }
        } else if let Some(name) = line.strip_prefix("not-alive: ") {
            state.alive.remove(name);
        } else if let Some(n) = line.strip_prefix("clock: ") {
            if let Ok(n) = n.parse() {
                state.last_clock = n;
            }
        } else if let Some(n) = line.strip_prefix("event-clock: ") {
            if let Ok(n) = n.parse() {
                state.last_event_clock = n;
            }
        } else if let Some(n) = line.strip_prefix("query-clock: ") {
            if let Ok(n) = n.parse() {
                state.last_query_clock = n;
            }
        } else if line == "leave" {
            state.left = true;
        }
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Apply one event: update in-memory projection and append its record.
    /// Non-blocking by construction (no awaiting); if the caller also tees
    /// this event upstream and that forward is slow, the forward is dropped
    /// but this call still writes to disk.
    pub fn record(&mut self, event: SnapshotEvent) -> Result<()> {
        match event {
            SnapshotEvent::Member { kind, name, addr } => match kind {
                MemberEventKind::Join => {
                    let addr = addr.unwrap_or_default();
                    self.state.alive.insert(name.clone(), addr.clone());
                    self.append_line(&format!("alive: {name} {addr}"))?;
                }
                MemberEventKind::Leave | MemberEventKind::Failed | MemberEventKind::Reap => {
                    self.state.alive.remove(&name);
                    self.append_line(&format!("not-alive: {name}"))?;
                }
                MemberEventKind::Update => {}
            },
            SnapshotEvent::UserEventClock(n) => {
                self.state.last_event_clock = n;
                self.append_line(&format!("event-clock: {n}"))?;
            }
            SnapshotEvent::QueryClock(n) => {
                self.state.last_query_clock = n;
                self.append_line(&format!("query-clock: {n}"))?;
            }
            SnapshotEvent::StatusClock(n) => {
                self.state.last_clock = n;
                self.append_line(&format!("clock: {n}"))?;
            }
        }

        if self.file_size().unwrap_or(0) > self.max_size_bytes {
            self.compact()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Rewrite the log to contain only the current alive-set and last clock
    /// values, atomically replacing the file.
    pub fn compact(&self) -> Result<()> {
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = File::create(&tmp)?;
        for (name, addr) in &self.state.alive {
            writeln!(file, "alive: {name} {addr}")?;
        }
        writeln!(file, "clock: {}", self.state.last_clock)?;
        writeln!(file, "event-clock: {}", self.state.last_event_clock)?;
        writeln!(file, "query-clock: {}", self.state.last_query_clock)?;
        if self.state.left {
            writeln!(file, "leave")?;
        }
        file.flush()?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            MeshError::Io(e)
        })?;
        Ok(())
    }

    /// `Leave()`: clear the file when `rejoin_after_leave` is false,
    /// otherwise append a `leave` marker and keep prior content.
    pub fn leave(&mut self, rejoin_after_leave: bool) -> Result<()> {
        self.state.left = true;
        if rejoin_after_leave {
            self.append_line("leave")?;
        } else {
            self.state = SnapshotState::default();
            self.state.left = true;
            File::create(&self.path)?;
        }
        Ok(())
    }

    pub fn flush_warn_on_error(&self) {
        if let Err(e) = fs::metadata(&self.path) {
            warn!(error = %e, "snapshot file missing during flush check");
        }
    }
}
