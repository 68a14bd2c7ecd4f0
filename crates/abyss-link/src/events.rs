//! Event system for UI decoupling.
//!
//! Lets a CLI or app screen follow a transfer without tight coupling to the
//! protocol core.

use std::fmt;

/// OTA state machine phases as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    Begun,
    Transferring,
    Completed,
    Aborted,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaPhase::Idle => write!(f, "Idle"),
            OtaPhase::Begun => write!(f, "Begun"),
            OtaPhase::Transferring => write!(f, "Transferring"),
            OtaPhase::Completed => write!(f, "Completed"),
            OtaPhase::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Transfer progress; monotonically non-decreasing until completion or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

/// Events emitted by link and OTA sessions.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// OTA phase changed.
    PhaseChanged { from: OtaPhase, to: OtaPhase },
    /// OTA transfer progress.
    Progress(OtaProgress),
    /// A request attempt failed and will be retried after backoff.
    Retrying { attempt: u32, max: u32 },
    /// Chunk pulled during a history transfer.
    ChunkPulled { kind: u8, index: u32, len: usize },
}

/// Observer trait for receiving link events.
pub trait LinkObserver: Send + Sync {
    fn on_event(&self, event: &LinkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LinkObserver for NullObserver {
    fn on_event(&self, _event: &LinkEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LinkObserver for TracingObserver {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "OTA phase changed");
            }
            LinkEvent::Progress(p) => {
                let pct = if p.total_bytes > 0 {
                    p.bytes_sent * 100 / p.total_bytes
                } else {
                    0
                };
                tracing::debug!(
                    sent = p.bytes_sent,
                    total = p.total_bytes,
                    progress = %format!("{}%", pct),
                    "OTA progress"
                );
            }
            LinkEvent::Retrying { attempt, max } => {
                tracing::warn!(attempt = attempt, max = max, "retrying request");
            }
            LinkEvent::ChunkPulled { kind, index, len } => {
                tracing::debug!(kind = kind, index = index, len = len, "chunk pulled");
            }
        }
    }
}
