//! Host page capabilities.
//!
//! The tracker never touches a concrete browser. Everything it needs from the
//! page it is running in (location, document metadata, navigator data,
//! storage, the beacon primitive, interaction listeners) is reached through
//! the [`BrowsingContext`] trait. A tracker constructed without a browsing
//! context behaves like a server-side render: it skips every event and never
//! persists identity.
//!
//! [`StaticPage`] is an in-memory implementation used by the command-line
//! harness and by tests.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use reqwest::Url;
use thiserror::Error;

use crate::storage::{KeyValueStore, MemoryStore};

/// Errors raised by host implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// A navigation target could not be resolved against the current URL.
    #[error("invalid URL '{target}': {message}")]
    InvalidUrl { target: String, message: String },
}

/// Markers that automation drivers leave in the page environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutomationMarkers {
    /// `navigator.webdriver`
    pub navigator_webdriver: bool,
    /// `window.webdriver`
    pub window_webdriver: bool,
    /// `window.callPhantom`
    pub call_phantom: bool,
    /// `window._phantom`
    pub phantom: bool,
    /// `window.selenium`
    pub selenium: bool,
    /// Value of the `webdriver` attribute on the document element, if any.
    pub webdriver_attribute: Option<String>,
}

/// User interactions that mark a visitor as a likely human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    PointerMove,
    Scroll,
    KeyDown,
}

impl InteractionKind {
    /// All kinds the bot filter listens for.
    pub const ALL: [InteractionKind; 3] = [Self::PointerMove, Self::Scroll, Self::KeyDown];
}

/// One-shot handler invoked on the first matching interaction.
pub type InteractionHandler = Box<dyn FnOnce() + Send + 'static>;

/// Best-effort background delivery primitive (`navigator.sendBeacon`).
pub trait Beacon: Send + Sync {
    /// Queues `body` for delivery to `url`. Returns whether the host accepted
    /// the request, not whether it reached the collector.
    fn send_beacon(&self, url: &str, body: Vec<u8>) -> bool;
}

/// The page and environment a tracker instance runs in.
pub trait BrowsingContext: Send + Sync {
    /// Current document URL.
    fn location(&self) -> Url;

    fn title(&self) -> String;

    /// Document referrer, `None` when empty.
    fn referrer(&self) -> Option<String>;

    /// Inner window size in CSS pixels.
    fn viewport(&self) -> Option<(u32, u32)>;

    /// IANA timezone name.
    fn timezone(&self) -> Option<String>;

    fn language(&self) -> Option<String>;

    fn user_agent(&self) -> String;

    fn automation_markers(&self) -> AutomationMarkers;

    /// Indefinite-lifetime storage, `None` when unavailable.
    fn local_storage(&self) -> Option<Arc<dyn KeyValueStore>>;

    /// Session-scoped storage, `None` when unavailable.
    fn session_storage(&self) -> Option<Arc<dyn KeyValueStore>>;

    /// Background delivery primitive, `None` when unsupported.
    fn beacon(&self) -> Option<Arc<dyn Beacon>>;

    /// Registers a passive listener that runs at most once.
    fn add_interaction_listener(&self, kind: InteractionKind, handler: InteractionHandler);
}

#[derive(Debug, Clone)]
struct PageState {
    url: Url,
    title: String,
    referrer: Option<String>,
    viewport: Option<(u32, u32)>,
    timezone: Option<String>,
    language: Option<String>,
    user_agent: String,
    markers: AutomationMarkers,
}

/// In-memory page with mutable location and dispatchable interactions.
pub struct StaticPage {
    state: RwLock<PageState>,
    local: Option<Arc<dyn KeyValueStore>>,
    session: Option<Arc<dyn KeyValueStore>>,
    beacon: Option<Arc<dyn Beacon>>,
    listeners: Mutex<Vec<(InteractionKind, InteractionHandler)>>,
}

impl StaticPage {
    /// Creates a page at `url` with in-memory storage and no beacon support.
    ///
    /// # Example
    ///
    /// ```
    /// use databuddy_tracker::host::{BrowsingContext, StaticPage};
    /// use reqwest::Url;
    ///
    /// let page = StaticPage::new(Url::parse("https://example.com/pricing").unwrap())
    ///     .with_title("Pricing");
    ///
    /// assert_eq!(page.location().path(), "/pricing");
    /// assert_eq!(page.title(), "Pricing");
    /// ```
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            state: RwLock::new(PageState {
                url,
                title: String::new(),
                referrer: None,
                viewport: None,
                timezone: None,
                language: None,
                user_agent: format!("databuddy-tracker/{}", env!("CARGO_PKG_VERSION")),
                markers: AutomationMarkers::default(),
            }),
            local: Some(Arc::new(MemoryStore::new())),
            session: Some(Arc::new(MemoryStore::new())),
            beacon: None,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn state_mut(&mut self) -> &mut PageState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.state_mut().title = title.into();
        self
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.state_mut().referrer = Some(referrer.into());
        self
    }

    #[must_use]
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.state_mut().viewport = Some((width, height));
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.state_mut().timezone = Some(timezone.into());
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.state_mut().language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.state_mut().user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_automation_markers(mut self, markers: AutomationMarkers) -> Self {
        self.state_mut().markers = markers;
        self
    }

    /// Replaces local storage; `None` makes it unavailable.
    #[must_use]
    pub fn with_local_storage(mut self, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        self.local = store;
        self
    }

    /// Replaces session storage; `None` makes it unavailable.
    #[must_use]
    pub fn with_session_storage(mut self, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        self.session = store;
        self
    }

    #[must_use]
    pub fn with_beacon(mut self, beacon: Arc<dyn Beacon>) -> Self {
        self.beacon = Some(beacon);
        self
    }

    /// Resolves `target` against the current URL and makes it the location.
    ///
    /// # Errors
    ///
    /// Returns `HostError::InvalidUrl` if `target` cannot be resolved.
    pub fn navigate(&self, target: &str) -> Result<(), HostError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let next = state.url.join(target).map_err(|e| HostError::InvalidUrl {
            target: target.to_string(),
            message: e.to_string(),
        })?;
        state.url = next;
        Ok(())
    }

    /// Fires an interaction, running and removing every listener for `kind`.
    ///
    /// Returns the number of listeners that ran.
    pub fn dispatch_interaction(&self, kind: InteractionKind) -> usize {
        let fired: Vec<InteractionHandler> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            let (matching, rest): (Vec<_>, Vec<_>) =
                listeners.drain(..).partition(|(k, _)| *k == kind);
            *listeners = rest;
            matching.into_iter().map(|(_, handler)| handler).collect()
        };

        let count = fired.len();
        for handler in fired {
            handler();
        }
        count
    }

    fn read(&self) -> PageState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BrowsingContext for StaticPage {
    fn location(&self) -> Url {
        self.read().url
    }

    fn title(&self) -> String {
        self.read().title
    }

    fn referrer(&self) -> Option<String> {
        self.read().referrer.filter(|r| !r.is_empty())
    }

    fn viewport(&self) -> Option<(u32, u32)> {
        self.read().viewport
    }

    fn timezone(&self) -> Option<String> {
        self.read().timezone
    }

    fn language(&self) -> Option<String> {
        self.read().language
    }

    fn user_agent(&self) -> String {
        self.read().user_agent
    }

    fn automation_markers(&self) -> AutomationMarkers {
        self.read().markers
    }

    fn local_storage(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.local.clone()
    }

    fn session_storage(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.session.clone()
    }

    fn beacon(&self) -> Option<Arc<dyn Beacon>> {
        self.beacon.clone()
    }

    fn add_interaction_listener(&self, kind: InteractionKind, handler: InteractionHandler) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, handler));
    }
}
