#[cfg(test)]
use std::sync::{Arc, Mutex};

use anyhow::Result;
#[cfg(test)]
use anyhow::anyhow;
use log::trace;

/// Raw pixel channels, in the byte order of [`Color::to_bytes`](crate::command::Color::to_bytes).
pub type Pixel = [u8; 4];

/// Output stage for the pixel buffer (WS2812-style data line).
pub trait PixelWriter: Send {
    /// Pushes a full frame to the strip.
    fn write(&mut self, frame: &[Pixel]) -> Result<()>;
}

/// Backend that only traces frames; used when no strip is attached.
#[derive(Debug, Default)]
pub struct LogPixelWriter {
    frames: u64,
}

impl PixelWriter for LogPixelWriter {
    fn write(&mut self, frame: &[Pixel]) -> Result<()> {
        self.frames += 1;
        trace!("frame {}: {} pixels, first {:02x?}", self.frames, frame.len(), frame.first());
        Ok(())
    }
}

/// Backend that keeps every frame it was given.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingPixelWriter {
    frames: Arc<Mutex<Vec<Vec<Pixel>>>>,
}

#[cfg(test)]
impl RecordingPixelWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<Pixel>> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl PixelWriter for RecordingPixelWriter {
    fn write(&mut self, frame: &[Pixel]) -> Result<()> {
        self.frames
            .lock()
            .map_err(|_| anyhow!("frame recorder poisoned"))?
            .push(frame.to_vec());
        Ok(())
    }
}
