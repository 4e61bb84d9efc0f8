//! Folding of raw filesystem events
//!
//! The OS reports bursts of fine-grained events (create, write, chmod) for
//! a single change. Events for the same path that arrive within a short
//! window fold into one; an event for a different path flushes the pending
//! one.

use notify::event::CreateKind;
use notify::EventKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Simplified event kind
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RawKind {
    /// A directory was created
    Create,
    /// Anything else
    Write,
}

impl RawKind {
    pub fn from_notify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Access(_) => None,
            EventKind::Create(CreateKind::Folder) => Some(RawKind::Create),
            _ => Some(RawKind::Write),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawKind,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: RawKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Every path of a notify event as raw events
    pub fn from_notify(event: notify::Event) -> Vec<RawEvent> {
        let Some(kind) = RawKind::from_notify(&event.kind) else {
            return Vec::new();
        };
        event
            .paths
            .into_iter()
            .map(|path| RawEvent { path, kind })
            .collect()
    }
}

#[derive(Debug)]
struct Pending {
    event: RawEvent,
    started: Instant,
    folded: usize,
}

#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    max: usize,
    pending: Option<Pending>,
}

impl Coalescer {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max: max.max(1),
            pending: None,
        }
    }

    /// Add an event; returns whatever must be processed now
    pub fn push(&mut self, event: RawEvent, now: Instant) -> Option<RawEvent> {
        if let Some(pending) = &mut self.pending {
            let open = now.duration_since(pending.started) < self.window && pending.folded < self.max;
            if open && pending.event.path == event.path {
                if event.kind == RawKind::Create {
                    pending.event.kind = RawKind::Create;
                }
                pending.folded += 1;
                return None;
            }
        }
        self.pending
            .replace(Pending {
                event,
                started: now,
                folded: 1,
            })
            .map(|p| p.event)
    }

    /// When the pending event must be flushed
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.started + self.window)
    }

    pub fn flush(&mut self) -> Option<RawEvent> {
        self.pending.take().map(|p| p.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, ModifyKind};

    fn coalescer() -> Coalescer {
        Coalescer::new(Duration::from_millis(10), 3)
    }

    #[test]
    fn test_simplify_kinds() {
        assert_eq!(
            RawKind::from_notify(&EventKind::Create(CreateKind::Folder)),
            Some(RawKind::Create)
        );
        assert_eq!(
            RawKind::from_notify(&EventKind::Create(CreateKind::File)),
            Some(RawKind::Write)
        );
        assert_eq!(
            RawKind::from_notify(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(RawKind::Write)
        );
        assert_eq!(
            RawKind::from_notify(&EventKind::Access(notify::event::AccessKind::Any)),
            None
        );
    }

    #[test]
    fn test_same_path_folds() {
        let mut c = coalescer();
        let now = Instant::now();
        assert_eq!(c.push(RawEvent::new("/d", RawKind::Create), now), None);
        assert_eq!(c.push(RawEvent::new("/d", RawKind::Write), now), None);
        assert_eq!(c.flush(), Some(RawEvent::new("/d", RawKind::Create)));
        assert_eq!(c.flush(), None);
    }

    #[test]
    fn test_other_path_flushes() {
        let mut c = coalescer();
        let now = Instant::now();
        c.push(RawEvent::new("/a", RawKind::Write), now);
        let out = c.push(RawEvent::new("/b", RawKind::Write), now);
        assert_eq!(out, Some(RawEvent::new("/a", RawKind::Write)));
        assert_eq!(c.flush(), Some(RawEvent::new("/b", RawKind::Write)));
    }

    #[test]
    fn test_window_and_run_length() {
        let mut c = coalescer();
        let now = Instant::now();
        c.push(RawEvent::new("/a", RawKind::Write), now);
        let late = now + Duration::from_millis(20);
        assert!(c.push(RawEvent::new("/a", RawKind::Write), late).is_some());

        let mut c = coalescer();
        for _ in 0..3 {
            assert!(c.push(RawEvent::new("/a", RawKind::Write), now).is_none());
        }
        assert!(c.push(RawEvent::new("/a", RawKind::Write), now).is_some());
        assert_eq!(c.deadline(), Some(now + Duration::from_millis(10)));
    }
}
