//! Tracking skip checks.
//!
//! The gate answers "should anything be tracked right now?" before an event
//! reaches a queue, and again before the primary queue re-sends events one
//! by one after a failed batch.

use std::fmt;
use std::sync::Arc;

use crate::host::BrowsingContext;
use crate::patterns::matching_skip_pattern;

/// Why an event was not tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Running without a browsing context (server-side render).
    NoBrowsingContext,
    /// The `disabled` option is set.
    Disabled,
    /// The visitor was classified as automated traffic.
    Bot,
    /// The current path matches this skip pattern.
    SkipPattern(String),
    /// The caller-supplied filter rejected the event.
    Filtered,
    /// The caller-supplied filter panicked.
    FilterPanicked,
    /// The sampling draw discarded the event.
    SampledOut,
    /// A vital was reported with `track_performance` off.
    PerformanceTrackingDisabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBrowsingContext => write!(f, "no browsing context"),
            Self::Disabled => write!(f, "tracking disabled"),
            Self::Bot => write!(f, "bot detected"),
            Self::SkipPattern(pattern) => write!(f, "path matches skip pattern {pattern}"),
            Self::Filtered => write!(f, "rejected by filter"),
            Self::FilterPanicked => write!(f, "filter panicked"),
            Self::SampledOut => write!(f, "sampled out"),
            Self::PerformanceTrackingDisabled => write!(f, "performance tracking disabled"),
        }
    }
}

/// Environment-level skip checks shared by the tracker and its queues.
pub struct TrackingGate {
    host: Option<Arc<dyn BrowsingContext>>,
    disabled: bool,
    is_likely_bot: bool,
    skip_patterns: Vec<String>,
}

impl TrackingGate {
    #[must_use]
    pub fn new(
        host: Option<Arc<dyn BrowsingContext>>,
        disabled: bool,
        is_likely_bot: bool,
        skip_patterns: Vec<String>,
    ) -> Self {
        Self {
            host,
            disabled,
            is_likely_bot,
            skip_patterns,
        }
    }

    /// Returns why tracking should be skipped right now, if it should.
    ///
    /// The path check reads the current location, so the answer changes as
    /// the page navigates.
    #[must_use]
    pub fn skip_reason(&self) -> Option<SkipReason> {
        let Some(host) = &self.host else {
            return Some(SkipReason::NoBrowsingContext);
        };
        if self.disabled {
            return Some(SkipReason::Disabled);
        }
        if self.is_likely_bot {
            return Some(SkipReason::Bot);
        }

        let location = host.location();
        matching_skip_pattern(location.path(), &self.skip_patterns)
            .map(|pattern| SkipReason::SkipPattern(pattern.to_string()))
    }
}
