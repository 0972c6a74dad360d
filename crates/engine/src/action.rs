//! Browser actions and the executor boundary
//!
//! Every low-level interaction the engine can record or replay is one case of
//! [`ActionInput`]. Executors perform them against a live browser context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// Viewport coordinate, serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate(pub i32, pub i32);

impl Coordinate {
    pub fn x(&self) -> i32 {
        self.0
    }

    pub fn y(&self) -> i32 {
        self.1
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }
}

fn default_scroll_amount() -> u32 {
    3
}

/// A single browser action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionInput {
    /// Capture the full page
    Screenshot,

    /// Move the pointer without clicking
    MouseMove { coordinate: Coordinate },

    LeftClick {
        #[serde(default)]
        coordinate: Option<Coordinate>,
    },

    RightClick {
        #[serde(default)]
        coordinate: Option<Coordinate>,
    },

    DoubleClick {
        #[serde(default)]
        coordinate: Option<Coordinate>,
    },

    /// Press at `start`, drag, release at `coordinate`
    LeftClickDrag {
        start: Coordinate,
        coordinate: Coordinate,
    },

    /// Type text with keyboard simulation
    Type { text: String },

    /// Press a key or chord, e.g. `Enter` or `Control+A`
    Key { text: String },

    Scroll {
        #[serde(default)]
        coordinate: Option<Coordinate>,
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
    },

    /// Wait for a fixed amount of time
    Wait { duration_ms: u64 },

    /// Navigate to a URL
    Navigate { url: String },

    /// Query the structural fingerprint of the element at a point
    Fingerprint { coordinate: Coordinate },
}

impl ActionInput {
    /// Short name used in logs and recorded steps
    pub fn name(&self) -> &'static str {
        match self {
            ActionInput::Screenshot => "screenshot",
            ActionInput::MouseMove { .. } => "mouse_move",
            ActionInput::LeftClick { .. } => "left_click",
            ActionInput::RightClick { .. } => "right_click",
            ActionInput::DoubleClick { .. } => "double_click",
            ActionInput::LeftClickDrag { .. } => "left_click_drag",
            ActionInput::Type { .. } => "type",
            ActionInput::Key { .. } => "key",
            ActionInput::Scroll { .. } => "scroll",
            ActionInput::Wait { .. } => "wait",
            ActionInput::Navigate { .. } => "navigate",
            ActionInput::Fingerprint { .. } => "fingerprint",
        }
    }

    /// Actions that only observe the page and leave it untouched.
    pub fn is_observation(&self) -> bool {
        matches!(
            self,
            ActionInput::Screenshot | ActionInput::Fingerprint { .. }
        )
    }

    /// Target of a pointer move, the only action validated by fingerprint.
    pub fn pointer_target(&self) -> Option<Coordinate> {
        match self {
            ActionInput::MouseMove { coordinate } => Some(*coordinate),
            _ => None,
        }
    }
}

/// Image captured by an action, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCapture {
    pub media_type: String,
    pub data: String,
}

/// Page state reported alongside an action result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Result of executing an action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub metadata: ActionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageCapture>,
}

/// One browser context able to perform actions.
#[async_trait]
pub trait ActionExecutor: Send {
    async fn execute(&mut self, input: &ActionInput) -> EngineResult<ActionOutput>;

    /// Fingerprint of the element currently rendered at `coordinate`.
    async fn fingerprint_at(&mut self, coordinate: Coordinate) -> EngineResult<String> {
        let output = self
            .execute(&ActionInput::Fingerprint { coordinate })
            .await?;
        output.metadata.fingerprint.ok_or_else(|| {
            EngineError::Executor(format!("no element found at {}", coordinate))
        })
    }

    /// Close the underlying browser context.
    async fn release(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// Hands out one browser context per test file.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn acquire(&self) -> EngineResult<Box<dyn ActionExecutor>>;
}
