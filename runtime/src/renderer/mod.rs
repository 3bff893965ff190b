//! Renderer abstraction for browser automation.
//!
//! Defines the `Renderer` and `RenderContext` traits that abstract over
//! the browser engine (currently Chromium via chromiumoxide). Everything
//! above this seam (session management, form protocol, extraction) talks
//! only to these traits, which is what lets the orchestrator be driven by a
//! scripted renderer in tests.

pub mod chromium;
pub mod reaper;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How an element is located.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locator {
    XPath(String),
    Css(String),
}

impl Locator {
    pub fn xpath(expr: impl Into<String>) -> Self {
        Self::XPath(expr.into())
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn expression(&self) -> &str {
        match self {
            Self::XPath(e) | Self::Css(e) => e,
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::XPath(e) => write!(f, "xpath:{e}"),
            Self::Css(e) => write!(f, "css:{e}"),
        }
    }
}

/// How to empty an input before typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Reset the value directly.
    Plain,
    /// Select the whole value and delete it with a keystroke, for widgets
    /// that ignore a direct reset.
    SelectAllDelete,
}

/// Browser identity for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    pub viewport: (u32, u32),
    /// Private profile directory; also marks the session's processes for
    /// orphan reaping.
    pub profile_dir: PathBuf,
}

/// A browser engine that can launch isolated sessions.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Launch a fresh browser with the given identity.
    async fn launch(&self, identity: &Identity) -> Result<Box<dyn RenderContext>>;
    /// Kill browser processes whose profile lives under `scope`. Returns the
    /// number of processes killed.
    async fn reap_orphans(&self, scope: &Path) -> usize;
    /// Fail early when the engine cannot run at all.
    async fn preflight(&self) -> Result<()> {
        Ok(())
    }
}

/// One live browser session with a single page.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Navigate the page and wait for it to load.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;
    async fn reload(&mut self, timeout: Duration) -> Result<()>;
    /// Cheap liveness check; fails when the browser stopped responding.
    async fn probe(&mut self) -> Result<()>;
    /// Dismiss a pending native dialog. Returns whether one was open.
    async fn dismiss_dialog(&mut self) -> Result<bool>;
    /// Whether at least one element matches right now.
    async fn is_present(&mut self, locator: &Locator) -> Result<bool>;
    async fn clear(&mut self, locator: &Locator, mode: ClearMode) -> Result<()>;
    async fn type_text(&mut self, locator: &Locator, text: &str) -> Result<()>;
    async fn click(&mut self, locator: &Locator) -> Result<()>;
    /// Serialized HTML of the current browsing context.
    async fn document_html(&mut self) -> Result<String>;
    /// Switch into the first iframe whose id contains `marker`. Returns
    /// false, leaving the context unchanged, when none exists.
    async fn enter_frame(&mut self, marker: &str) -> Result<bool>;
    /// Return to the top-level document.
    async fn exit_frame(&mut self) -> Result<()>;
    /// Wipe cookies and web storage.
    async fn clear_state(&mut self) -> Result<()>;
    /// PNG of the current page.
    async fn screenshot(&mut self) -> Result<Vec<u8>>;
    /// Quit the browser and release its resources.
    async fn shutdown(self: Box<Self>) -> Result<()>;
}
