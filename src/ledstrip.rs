//! LED strip controller.
//!
//! Owns the pixel buffer and the backend that pushes frames to the strip.
//! Color commands are resolved against the strip and handed to a single fade
//! worker running on the task manager; a newer batch interrupts the fade in
//! flight and continues from wherever it stopped.

use std::ops::Range;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    sync::{Mutex, watch},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{Color, ColorCommand, CommandError, parse_commands, parse_json_commands},
    config::ConfigStore,
    drivers::{Pixel, PixelWriter},
    event::{Event, EventBus},
    fade::Fade,
    providers::mqtt::MqttHandle,
    task_manager::TaskManager,
};

pub const TOPIC_LED_STATUS: &str = "mqtt_topic_led_status";
pub const TOPIC_LED_CONTROL: &str = "mqtt_topic_led_control";

/// Batch applied when a request carries no commands.
pub const DEFAULT_COMMAND: (&str, &str) = ("all", "#00ff00");

const FADE_TASK: &str = "LedStrip";

/// `{"message": ...}` body returned to HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Resolved batch: pixel span and color, in request order.
type Targets = Vec<(Range<usize>, Color)>;

struct Strip {
    pixels: Vec<Pixel>,
    writer: Box<dyn PixelWriter>,
}

impl Strip {
    fn show(&mut self, frame: Vec<Pixel>) {
        self.pixels = frame;
        if let Err(e) = self.writer.write(&self.pixels) {
            warn!("Failed to write LED frame: {e:#}");
        }
    }
}

/// Pixel buffer plus the fade machinery driving it.
///
/// Batches only become frames once [`LedStrip::start`] registered the fade
/// worker; until then the newest batch waits.
///
/// # Example
///
/// ```no_run
/// use neopixeld::config::ConfigStore;
/// use neopixeld::drivers::LogPixelWriter;
/// use neopixeld::event::EventBus;
/// use neopixeld::ledstrip::LedStrip;
/// use neopixeld::task_manager::TaskManager;
/// use serde_json::json;
///
/// # async fn example() -> anyhow::Result<()> {
/// let strip = LedStrip::new(60, Box::new(LogPixelWriter::default()), ConfigStore::new(), EventBus::new())?;
/// let mut task_manager = TaskManager::new();
/// strip.start(&mut task_manager)?;
/// let body = json!({"1-10": "#ff0000"});
/// strip.post(body.as_object().unwrap())?;
/// # Ok(())
/// # }
/// ```
pub struct LedStrip {
    strip: Arc<Mutex<Strip>>,
    len: usize,
    fade: Fade,
    config: ConfigStore,
    event_bus: EventBus,
    mqtt: Option<MqttHandle>,
    batches: watch::Sender<Option<Targets>>,
    pending: StdMutex<Option<watch::Receiver<Option<Targets>>>>,
    token: CancellationToken,
}

impl LedStrip {
    /// Creates a strip of `len` dark pixels and declares its MQTT topics.
    pub fn new(
        len: usize,
        writer: Box<dyn PixelWriter>,
        config: ConfigStore,
        event_bus: EventBus,
    ) -> Result<Self> {
        config.add_param(TOPIC_LED_STATUS, "neopixel/led")?;
        config.add_param(TOPIC_LED_CONTROL, "neopixel/led/set")?;

        let (batches, pending) = watch::channel(None);
        Ok(Self {
            strip: Arc::new(Mutex::new(Strip {
                pixels: vec![[0; 4]; len],
                writer,
            })),
            len,
            fade: Fade::default(),
            config,
            event_bus,
            mqtt: None,
            batches,
            pending: StdMutex::new(Some(pending)),
            token: CancellationToken::new(),
        })
    }

    pub fn with_fade(mut self, fade: Fade) -> Self {
        self.fade = fade;
        self
    }

    /// Publishes the buffer on the status topic after every fade.
    pub fn with_mqtt(mut self, mqtt: MqttHandle) -> Self {
        self.mqtt = Some(mqtt);
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registers the fade worker with the run loop. Only one worker may exist.
    pub fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let batches = self
            .pending
            .lock()
            .map_err(|_| anyhow!("Fade queue lock poisoned"))?
            .take()
            .context("LED strip fade worker already started")?;

        let worker = FadeWorker {
            strip: self.strip.clone(),
            fade: self.fade,
            token: self.token.clone(),
            status: StatusPublisher {
                config: self.config.clone(),
                event_bus: self.event_bus.clone(),
                mqtt: self.mqtt.clone(),
            },
        };
        task_manager.spawn_task(FADE_TASK, move |loop_token| async move {
            tokio::select! {
                () = worker.run(batches) => {}
                () = loop_token.cancelled() => debug!("Fade worker stopped with the run loop"),
            }
            Ok(())
        })
    }

    /// Applies a JSON command body. An empty body selects [`DEFAULT_COMMAND`].
    ///
    /// Returns as soon as the batch is queued. Invalid batches change
    /// nothing.
    pub fn post(&self, body: &Map<String, Value>) -> Result<StatusMessage, CommandError> {
        let commands = if body.is_empty() {
            parse_commands([DEFAULT_COMMAND])?
        } else {
            parse_json_commands(body)?
        };
        self.apply(&commands)?;
        Ok(StatusMessage::new("color changed"))
    }

    /// Validates `commands` against the strip and queues the fade towards
    /// them. Later commands win where they overlap.
    pub fn apply(&self, commands: &[ColorCommand]) -> Result<(), CommandError> {
        let targets = commands
            .iter()
            .map(|cmd| Ok((cmd.address.resolve(self.len)?, cmd.color)))
            .collect::<Result<Targets, CommandError>>()?;

        self.batches.send_replace(Some(targets));
        Ok(())
    }

    /// MQTT control topic handler: the payload has the HTTP body shape.
    pub fn handle_control_message(&self, payload: &[u8]) {
        let body = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(body)) => body,
            Ok(other) => {
                warn!("Ignoring LED control message that is not an object: {other}");
                return;
            }
            Err(e) => {
                warn!("Ignoring malformed LED control message: {e}");
                return;
            }
        };
        if let Err(e) = self.post(&body) {
            warn!("Rejected LED control message: {e}");
        }
    }

    /// Snapshot of the pixel buffer.
    pub async fn pixels(&self) -> Vec<Pixel> {
        self.strip.lock().await.pixels.clone()
    }

    /// Buffer as `#rrggbbww` strings, the shape published on the status topic.
    pub async fn pixels_hex(&self) -> Vec<String> {
        hex_frame(&self.pixels().await)
    }

    /// Stops the fade worker, leaving the buffer where it stopped.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

fn hex_frame(pixels: &[Pixel]) -> Vec<String> {
    pixels
        .iter()
        .map(|p| Color::from_bytes(*p).to_string())
        .collect()
}

struct StatusPublisher {
    config: ConfigStore,
    event_bus: EventBus,
    mqtt: Option<MqttHandle>,
}

impl StatusPublisher {
    fn publish(&self, pixels: &[Pixel]) {
        if let Some(mqtt) = self.mqtt.as_ref().filter(|m| m.is_connected()) {
            let topic = self.config.get_str(TOPIC_LED_STATUS).unwrap_or_default();
            match serde_json::to_vec(&hex_frame(pixels)) {
                Ok(payload) => {
                    if let Err(e) = mqtt.publish(&topic, payload) {
                        debug!("LED status not published: {e:#}");
                    }
                }
                Err(e) => warn!("Failed to encode LED status: {e}"),
            }
        }
        self.event_bus.notify(Event::LedStatusChanged);
    }
}

enum FadeEnd {
    Done(Vec<Pixel>),
    Superseded,
    Stopped,
}

struct FadeWorker {
    strip: Arc<Mutex<Strip>>,
    fade: Fade,
    token: CancellationToken,
    status: StatusPublisher,
}

impl FadeWorker {
    async fn run(self, mut batches: watch::Receiver<Option<Targets>>) {
        loop {
            let batch = batches.borrow_and_update().clone();
            if let Some(targets) = batch {
                match self.fade_to(&targets, &mut batches).await {
                    FadeEnd::Done(frame) => {
                        info!("LED strip updated ({} commands)", targets.len());
                        self.status.publish(&frame);
                    }
                    FadeEnd::Superseded => continue,
                    FadeEnd::Stopped => break,
                }
            }

            tokio::select! {
                () = self.token.cancelled() => break,
                changed = batches.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Fade worker stopped");
    }

    async fn fade_to(
        &self,
        targets: &Targets,
        batches: &mut watch::Receiver<Option<Targets>>,
    ) -> FadeEnd {
        let from = self.strip.lock().await.pixels.clone();
        let mut to = from.clone();
        for (range, color) in targets {
            to[range.clone()].fill(color.to_bytes());
        }

        // a zero-step fade still writes the target once
        for step in 1..=self.fade.steps.max(1) {
            tokio::select! {
                () = self.token.cancelled() => return FadeEnd::Stopped,
                changed = batches.changed() => {
                    debug!("Fade superseded at step {step}");
                    return match changed {
                        Ok(()) => FadeEnd::Superseded,
                        Err(_) => FadeEnd::Stopped,
                    };
                }
                () = sleep(self.fade.step_delay) => {}
            }
            let mut strip = self.strip.lock().await;
            if self.token.is_cancelled() {
                return FadeEnd::Stopped;
            }
            if batches.has_changed().unwrap_or(false) {
                return FadeEnd::Superseded;
            }
            strip.show(self.fade.frame(&from, &to, step));
        }
        FadeEnd::Done(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::RecordingPixelWriter;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn strip(len: usize) -> (LedStrip, RecordingPixelWriter) {
        let writer = RecordingPixelWriter::new();
        let strip = LedStrip::new(len, Box::new(writer.clone()), ConfigStore::new(), EventBus::new()).unwrap();
        (strip, writer)
    }

    fn running(len: usize) -> (LedStrip, RecordingPixelWriter, TaskManager) {
        let (strip, writer) = strip(len);
        let mut task_manager = TaskManager::new();
        strip.start(&mut task_manager).unwrap();
        (strip, writer, task_manager)
    }

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn settle(strip: &LedStrip) {
        tokio::time::sleep(strip.fade.duration() + Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_body_means_all_green() {
        let (a, _, _tm_a) = running(8);
        let (b, _, _tm_b) = running(8);

        assert_eq!(a.post(&Map::new()).unwrap(), StatusMessage::new("color changed"));
        b.post(&body(json!({"all": "#00ff00"}))).unwrap();
        settle(&a).await;

        assert_eq!(a.pixels().await, vec![[0, 0, 0xff, 0]; 8]);
        assert_eq!(a.pixels().await, b.pixels().await);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_writes_every_step_and_ends_on_target() {
        let (strip, writer, _tm) = running(4);
        strip.post(&body(json!({"2-3": "#ff000000"}))).unwrap();
        settle(&strip).await;

        let frames = writer.frames();
        assert_eq!(frames.len(), 20);
        assert_eq!(
            frames.last().unwrap(),
            &vec![[0; 4], [0xff, 0, 0, 0], [0xff, 0, 0, 0], [0; 4]]
        );
        // monotonic ramp on the changed channel
        let ramp: Vec<u8> = frames.iter().map(|f| f[1][0]).collect();
        assert!(ramp.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn later_commands_win() {
        let (strip, _, _tm) = running(4);
        strip
            .post(&body(json!({"all": "#00000001", "2": "#00000002"})))
            .unwrap();
        settle(&strip).await;
        assert_eq!(
            strip.pixels_hex().await,
            vec!["#00000001", "#00000002", "#00000001", "#00000001"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_batch_changes_nothing() {
        let (strip, writer, _tm) = running(4);
        for bad in [
            json!({"all": "#ff", "0-2": "#ff"}),
            json!({"3-1": "#ff"}),
            json!({"5": "#ff"}),
            json!({"all": 12}),
        ] {
            assert!(strip.post(&body(bad)).is_err());
        }
        settle(&strip).await;
        assert!(writer.frames().is_empty());
        assert_eq!(strip.pixels().await, vec![[0; 4]; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn ranges_past_the_end_are_clipped() {
        let (strip, _, _tm) = running(3);
        strip.post(&body(json!({"2-100": "#01020304"}))).unwrap();
        settle(&strip).await;
        assert_eq!(strip.pixels().await, vec![[0; 4], [1, 2, 3, 4], [1, 2, 3, 4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_fade_replaces_running_one() {
        let (strip, _, _tm) = running(2);
        strip.post(&body(json!({"all": "#ff000000"}))).unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        strip.post(&body(json!({"all": "#00000000"}))).unwrap();
        settle(&strip).await;
        assert_eq!(strip.pixels().await, vec![[0; 4]; 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_partial_fade() {
        let (strip, writer, _tm) = running(1);
        strip.post(&body(json!({"all": "#ff000000"}))).unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        strip.stop();
        settle(&strip).await;

        let frames = writer.frames().len();
        assert!(frames > 0 && frames < 20, "{frames} frames written");
        let red = strip.pixels().await[0][0];
        assert!(red > 0 && red < 0xff);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_posted_before_start_is_applied_once_running() {
        let (strip, _) = strip(2);
        strip.post(&body(json!({"1": "#00000005"}))).unwrap();
        strip.post(&body(json!({"2": "#00000006"}))).unwrap();

        let mut task_manager = TaskManager::new();
        strip.start(&mut task_manager).unwrap();
        assert!(strip.start(&mut task_manager).is_err());
        settle(&strip).await;
        // only the newest pending batch is faded in
        assert_eq!(strip.pixels().await, vec![[0; 4], [0, 0, 0, 6]]);
    }

    #[test]
    fn post_only_queues_without_a_runtime() {
        let (strip, writer) = strip(3);
        assert!(strip.post(&Map::new()).is_ok());
        assert!(writer.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_the_run_loop_stops_the_fade() {
        let writer = RecordingPixelWriter::new();
        let strip = LedStrip::new(1, Box::new(writer.clone()), ConfigStore::new(), EventBus::new())
            .unwrap()
            .with_fade(Fade::new(100, Duration::from_millis(100)));
        let mut task_manager = TaskManager::new();
        strip.start(&mut task_manager).unwrap();

        strip.post(&body(json!({"all": "#ff000000"}))).unwrap();
        tokio::time::sleep(Duration::from_millis(550)).await;
        task_manager.shutdown_all(Duration::from_secs(1)).await.unwrap();
        assert_eq!(task_manager.active_count(), 0);

        let written = writer.frames().len();
        assert!(written > 0 && written < 100, "{written} frames written");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(writer.frames().len(), written);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_fade_emits_status_event() {
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        let strip = LedStrip::new(
            2,
            Box::new(RecordingPixelWriter::new()),
            ConfigStore::new(),
            event_bus,
        )
        .unwrap();
        let mut task_manager = TaskManager::new();
        strip.start(&mut task_manager).unwrap();

        strip.post(&Map::new()).unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::LedStatusChanged);
    }

    #[tokio::test(start_paused = true)]
    async fn control_message_uses_post_pipeline() {
        let (strip, _, _tm) = running(2);
        strip.handle_control_message(b"not json");
        strip.handle_control_message(b"[1, 2]");
        strip.handle_control_message(br##"{"1": "#00000009"}"##);
        settle(&strip).await;
        assert_eq!(strip.pixels().await, vec![[0, 0, 0, 9], [0; 4]]);
    }

    #[test]
    fn declares_topics() {
        let config = ConfigStore::new();
        LedStrip::new(1, Box::new(RecordingPixelWriter::new()), config.clone(), EventBus::new()).unwrap();
        assert_eq!(config.get_str(TOPIC_LED_STATUS).as_deref(), Some("neopixel/led"));
        assert_eq!(config.get_str(TOPIC_LED_CONTROL).as_deref(), Some("neopixel/led/set"));
    }
}
