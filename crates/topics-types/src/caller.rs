//! Caller and contributor identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An `(app, sdk)` caller. An empty sdk means the app called directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppSdk {
    pub app: String,
    pub sdk: String,
}

impl AppSdk {
    pub fn new(app: impl Into<String>, sdk: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            sdk: sdk.into(),
        }
    }

    /// Caller key for an app calling without an SDK.
    pub fn app_only(app: impl Into<String>) -> Self {
        Self::new(app, "")
    }

    pub fn is_app_only(&self) -> bool {
        self.sdk.is_empty()
    }
}

impl fmt::Display for AppSdk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_app_only() {
            write!(f, "{}", self.app)
        } else {
            write!(f, "{}/{}", self.app, self.sdk)
        }
    }
}

/// Member of a top topic's contributor set.
///
/// `Padding` marks a regular top-topic slot that no real app was
/// classified into; it was filled only to reach the configured count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contributor {
    App(String),
    Padding,
}

impl Contributor {
    pub fn app(app: impl Into<String>) -> Self {
        Contributor::App(app.into())
    }

    pub fn is_padding(&self) -> bool {
        matches!(self, Contributor::Padding)
    }

    /// The contributing app, if this is a real contributor.
    pub fn app_id(&self) -> Option<&str> {
        match self {
            Contributor::App(app) => Some(app),
            Contributor::Padding => None,
        }
    }
}
