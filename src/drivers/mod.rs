//! Hardware access seams.
//!
//! The daemon never touches GPIO, ADC or the LED data line directly. It talks
//! to these traits, and the binary wires in a backend. The host backends
//! provided here log frames and expose shared levels so the control logic can
//! run (and be tested) without the physical board.

pub mod gpio;
pub mod pixel;

pub use gpio::{AnalogInput, DigitalInput, DigitalOutput, FixedAnalogInput, LogDigitalOutput, SharedLevel};
pub use pixel::{LogPixelWriter, Pixel, PixelWriter};
#[cfg(test)]
pub use pixel::RecordingPixelWriter;
