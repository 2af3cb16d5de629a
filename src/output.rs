//! Outputs announced by the display server
//!
//! Output properties arrive as a burst of geometry, mode and scale events
//! terminated by `done`. Pending values are applied atomically on `done`.

use log::debug;

use crate::protocol::{BufferTransform, OutputId, OutputListener, Rect};

#[derive(Debug, Clone, Default, PartialEq)]
struct OutputState {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    refresh: i32,
    scale: i32,
    transform: BufferTransform,
    make: String,
    model: String,
}

/// A monitor the server told us about.
#[derive(Debug, Clone)]
pub struct Output {
    id: OutputId,
    current: OutputState,
    pending: OutputState,
    initialized: bool,
}

impl Output {
    pub fn new(id: OutputId) -> Self {
        let state = OutputState {
            scale: 1,
            ..OutputState::default()
        };
        Self {
            id,
            current: state.clone(),
            pending: state,
            initialized: false,
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Whether a `done` event has been received.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Position and current mode size in the global space.
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.current.x,
            self.current.y,
            self.current.width.max(0) as u32,
            self.current.height.max(0) as u32,
        )
    }

    pub fn scale_factor(&self) -> u32 {
        self.current.scale.max(1) as u32
    }

    /// Refresh rate in mHz.
    pub fn refresh(&self) -> i32 {
        self.current.refresh
    }

    pub fn transform(&self) -> BufferTransform {
        self.current.transform
    }

    pub fn make(&self) -> &str {
        &self.current.make
    }

    pub fn model(&self) -> &str {
        &self.current.model
    }
}

impl OutputListener for Output {
    fn geometry(&mut self, x: i32, y: i32, make: &str, model: &str, transform: BufferTransform) {
        self.pending.x = x;
        self.pending.y = y;
        self.pending.make = make.to_string();
        self.pending.model = model.to_string();
        self.pending.transform = transform;
    }

    fn mode(&mut self, current: bool, width: i32, height: i32, refresh: i32) {
        // Only the current mode describes the output.
        if current {
            self.pending.width = width;
            self.pending.height = height;
            self.pending.refresh = refresh;
        }
    }

    fn scale(&mut self, factor: i32) {
        self.pending.scale = factor;
    }

    fn done(&mut self) {
        self.current = self.pending.clone();
        self.initialized = true;
        debug!(
            "🖥️ Output {:?}: {}x{}@{} scale {} ({} {})",
            self.id,
            self.current.width,
            self.current.height,
            self.current.refresh,
            self.current.scale,
            self.current.make,
            self.current.model
        );
    }
}
