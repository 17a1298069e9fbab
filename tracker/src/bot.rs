//! Automated-traffic classification.
//!
//! A visitor is classified once, when the tracker is constructed, from the
//! user agent and from markers that automation drivers leave behind. The
//! verdict is latched for the lifetime of the tracker.
//!
//! Separately, one-shot listeners record whether a genuine interaction
//! (pointer move, scroll, key press) has happened. That signal is exposed
//! for reporting but does not revise the latched verdict.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use crate::host::{AutomationMarkers, BrowsingContext, InteractionKind};

static HEADLESS_CHROME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\bHeadlessChrome\b").ok());

static PHANTOMJS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\bPhantomJS\b").ok());

/// Returns `true` if the user agent belongs to a known headless browser.
#[must_use]
pub fn is_headless_user_agent(user_agent: &str) -> bool {
    [&*HEADLESS_CHROME, &*PHANTOMJS]
        .into_iter()
        .flatten()
        .any(|re| re.is_match(user_agent))
}

/// Combines the user-agent check with the automation markers.
#[must_use]
pub fn detect_bot(user_agent: &str, markers: &AutomationMarkers) -> bool {
    markers.navigator_webdriver
        || markers.window_webdriver
        || is_headless_user_agent(user_agent)
        || markers.call_phantom
        || markers.phantom
        || markers.selenium
        || markers.webdriver_attribute.as_deref() == Some("true")
}

/// Latched bot verdict plus the informational interaction signal.
#[derive(Debug, Clone)]
pub struct BotFilter {
    is_likely_bot: bool,
    has_interacted: Arc<AtomicBool>,
}

impl BotFilter {
    /// Classifies the visitor of `host`.
    ///
    /// Detection is skipped, and the visitor treated as human, when
    /// `ignore_bot_detection` is set or there is no browsing context.
    #[must_use]
    pub fn new(host: Option<&dyn BrowsingContext>, ignore_bot_detection: bool) -> Self {
        let is_likely_bot = match host {
            Some(host) if !ignore_bot_detection => {
                detect_bot(&host.user_agent(), &host.automation_markers())
            }
            _ => false,
        };

        if is_likely_bot {
            info!("Bot detected, tracking will be skipped");
        }

        Self {
            is_likely_bot,
            has_interacted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers one-shot, passive interaction listeners with `host`.
    pub fn setup_bot_detection(&self, host: &dyn BrowsingContext) {
        for kind in InteractionKind::ALL {
            let flag = Arc::clone(&self.has_interacted);
            host.add_interaction_listener(
                kind,
                Box::new(move || {
                    if !flag.swap(true, Ordering::SeqCst) {
                        debug!(?kind, "First user interaction observed");
                    }
                }),
            );
        }
    }

    /// The verdict latched at construction.
    #[must_use]
    pub fn is_likely_bot(&self) -> bool {
        self.is_likely_bot
    }

    /// Whether a genuine interaction has been observed.
    #[must_use]
    pub fn has_interacted(&self) -> bool {
        self.has_interacted.load(Ordering::SeqCst)
    }

    /// Records an interaction reported directly by the host glue.
    pub fn record_interaction(&self) {
        self.has_interacted.store(true, Ordering::SeqCst);
    }
}
