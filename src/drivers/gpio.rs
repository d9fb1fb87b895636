use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU16, Ordering},
};

use anyhow::Result;
use log::debug;

/// 10-bit style analog input (ambient light sensor).
pub trait AnalogInput: Send + Sync {
    fn read(&self) -> Result<u16>;
}

/// Digital input pin. `true` means electrically high.
pub trait DigitalInput: Send + Sync {
    fn is_high(&self) -> Result<bool>;
}

/// Digital output pin.
pub trait DigitalOutput: Send + Sync {
    fn set(&self, high: bool) -> Result<()>;
}

/// Analog input returning an externally controlled reading.
#[derive(Debug, Clone, Default)]
pub struct FixedAnalogInput(Arc<AtomicU16>);

impl FixedAnalogInput {
    pub fn new(value: u16) -> Self {
        Self(Arc::new(AtomicU16::new(value)))
    }

    pub fn set(&self, value: u16) {
        self.0.store(value, Ordering::Relaxed);
    }
}

impl AnalogInput for FixedAnalogInput {
    fn read(&self) -> Result<u16> {
        Ok(self.0.load(Ordering::Relaxed))
    }
}

/// Shared logic level usable as input or output.
#[derive(Debug, Clone)]
pub struct SharedLevel(Arc<AtomicBool>);

impl SharedLevel {
    pub fn new(high: bool) -> Self {
        Self(Arc::new(AtomicBool::new(high)))
    }

    pub fn level(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, high: bool) {
        self.0.store(high, Ordering::Relaxed);
    }
}

impl DigitalInput for SharedLevel {
    fn is_high(&self) -> Result<bool> {
        Ok(self.level())
    }
}

impl DigitalOutput for SharedLevel {
    fn set(&self, high: bool) -> Result<()> {
        self.set_level(high);
        Ok(())
    }
}

/// Output that logs level changes.
#[derive(Debug, Default)]
pub struct LogDigitalOutput {
    name: &'static str,
    level: AtomicBool,
}

impl LogDigitalOutput {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            level: AtomicBool::new(false),
        }
    }
}

impl DigitalOutput for LogDigitalOutput {
    fn set(&self, high: bool) -> Result<()> {
        if self.level.swap(high, Ordering::Relaxed) != high {
            debug!("{} -> {}", self.name, if high { "on" } else { "off" });
        }
        Ok(())
    }
}
