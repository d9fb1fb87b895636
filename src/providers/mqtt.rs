use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use rumqttc::{
    AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigStore,
    event::{Event, EventBus},
    providers::traits::Service,
    task_manager::TaskManager,
};

pub const MQTT_HOST: &str = "mqtt_host";
pub const MQTT_PORT: &str = "mqtt_port";
pub const MQTT_USER: &str = "mqtt_user";
pub const MQTT_PASSWORD: &str = "mqtt_password";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const OUTGOING_CAPACITY: usize = 32;
const REQUEST_CAPACITY: usize = 16;

/// Callback invoked with the payload of a message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Topic names travel with a 16-bit length prefix.
fn check_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        bail!("MQTT topic is empty");
    }
    if topic.len() > usize::from(u16::MAX) {
        bail!("MQTT topic is {} bytes, the limit is {}", topic.len(), u16::MAX);
    }
    Ok(())
}

/// Where a subscription takes its topic name from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Literal topic name.
    Fixed(String),
    /// Name of a string config parameter, read again on every connect so a
    /// topic loaded from disk after subscribing still applies.
    Param(&'static str),
}

impl Topic {
    fn resolve(&self, config: &ConfigStore) -> Option<String> {
        match self {
            Topic::Fixed(topic) => Some(topic.clone()),
            Topic::Param(name) => {
                let topic = config.get_str(name).filter(|t| !t.is_empty())?;
                match check_topic(&topic) {
                    Ok(()) => Some(topic),
                    Err(e) => {
                        warn!("Skipping subscription from {name}: {e}");
                        None
                    }
                }
            }
        }
    }
}

impl From<&str> for Topic {
    fn from(topic: &str) -> Self {
        Topic::Fixed(topic.to_string())
    }
}

#[derive(Debug)]
struct PendingPublish {
    topic: String,
    payload: Vec<u8>,
}

/// Cloneable publishing side of the [`MqttClient`].
#[derive(Clone)]
pub struct MqttHandle {
    outgoing: mpsc::Sender<PendingPublish>,
    connected: Arc<AtomicBool>,
}

impl MqttHandle {
    /// Queues a QoS 0 publish. Fails when the broker link is down or the
    /// queue is full; nothing is buffered for later.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        check_topic(topic)?;
        if !self.is_connected() {
            bail!("MQTT not connected");
        }
        self.outgoing
            .try_send(PendingPublish {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .map_err(|e| anyhow!("MQTT publish to {topic} dropped: {e}"))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// MQTT client service.
///
/// Subscriptions must be registered before [`Service::run`]; the registry is
/// sealed afterwards. While `mqtt_host` is empty the connection task idles
/// and re-checks the config every few seconds.
///
/// # Example
///
/// ```no_run
/// use neopixeld::config::ConfigStore;
/// use neopixeld::event::EventBus;
/// use neopixeld::providers::MqttClient;
///
/// let client = MqttClient::new("neopixelcontroller-a1b2c3", ConfigStore::new(), EventBus::new())?;
/// client.subscribe("neopixel/led/set", |payload| println!("{} bytes", payload.len()))?;
/// let handle = client.handle();
/// # let _ = handle;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct MqttClient {
    client_id: String,
    config: ConfigStore,
    event_bus: EventBus,
    subscriptions: Arc<Mutex<Vec<(Topic, MessageHandler)>>>,
    sealed: AtomicBool,
    handle: MqttHandle,
    outgoing_rx: Mutex<Option<mpsc::Receiver<PendingPublish>>>,
    token: CancellationToken,
}

impl MqttClient {
    /// Creates the client and declares its connection parameters.
    pub fn new(client_id: impl Into<String>, config: ConfigStore, event_bus: EventBus) -> Result<Self> {
        let client_id = client_id.into();
        if client_id.is_empty() || client_id.starts_with(char::is_whitespace) {
            bail!("Invalid MQTT client id {client_id:?}");
        }

        config.add_param(MQTT_HOST, "")?;
        config.add_param(MQTT_PORT, 1883)?;
        config.add_param(MQTT_USER, "")?;
        config.add_param(MQTT_PASSWORD, "")?;

        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        Ok(Self {
            client_id,
            config,
            event_bus,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            sealed: AtomicBool::new(false),
            handle: MqttHandle {
                outgoing: tx,
                connected: Arc::new(AtomicBool::new(false)),
            },
            outgoing_rx: Mutex::new(Some(rx)),
            token: CancellationToken::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handle(&self) -> MqttHandle {
        self.handle.clone()
    }

    /// Registers `handler` for messages on `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        if self.sealed.load(Ordering::Acquire) {
            bail!("MQTT subscriptions are sealed once the client runs");
        }
        let topic = topic.into();
        if let Topic::Fixed(name) = &topic {
            check_topic(name)?;
        }
        debug!("MQTT subscription registered for {topic:?}");
        self.subscriptions
            .lock()
            .map_err(|_| anyhow!("MQTT subscription registry poisoned"))?
            .push((topic, Arc::new(handler)));
        Ok(())
    }
}

#[async_trait]
impl Service for MqttClient {
    fn name(&self) -> &'static str {
        "MqttClient"
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        self.sealed.store(true, Ordering::Release);
        let outgoing = self
            .outgoing_rx
            .lock()
            .map_err(|_| anyhow!("MQTT outgoing queue poisoned"))?
            .take()
            .context("MQTT client already started")?;

        let session = Session {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            event_bus: self.event_bus.clone(),
            subscriptions: self.subscriptions.clone(),
            connected: self.handle.connected.clone(),
        };
        let token = self.token.clone();

        task_manager.spawn_task(self.name(), move |loop_token| async move {
            tokio::select! {
                result = run_mqtt_client(session, outgoing, token) => result,
                () = loop_token.cancelled() => Ok(()),
            }
        })
    }

    async fn shutdown(&self) -> Result<()> {
        // the connection loop sends DISCONNECT when it sees the cancellation
        self.token.cancel();
        Ok(())
    }
}

struct Session {
    client_id: String,
    config: ConfigStore,
    event_bus: EventBus,
    subscriptions: Arc<Mutex<Vec<(Topic, MessageHandler)>>>,
    connected: Arc<AtomicBool>,
}

impl Session {
    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::AcqRel) != connected {
            self.event_bus.notify(Event::MqttConnected(connected));
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn resolved_subscriptions(&self) -> Result<Vec<(String, MessageHandler)>> {
        let subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| anyhow!("MQTT subscription registry poisoned"))?;
        Ok(subscriptions
            .iter()
            .filter_map(|(topic, handler)| Some((topic.resolve(&self.config)?, handler.clone())))
            .collect())
    }

    fn options(&self, host: &str, port: u16) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);

        let user = self.config.get_str(MQTT_USER).unwrap_or_default();
        if !user.is_empty() {
            let password = self.config.get_str(MQTT_PASSWORD).unwrap_or_default();
            options.set_credentials(user, password);
        }
        options
    }
}

async fn run_mqtt_client(
    session: Session,
    mut outgoing: mpsc::Receiver<PendingPublish>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let host = session.config.get_str(MQTT_HOST).unwrap_or_default();
        if host.is_empty() {
            debug!("MQTT host not configured");
        } else {
            let port = session
                .config
                .get_int(MQTT_PORT)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(1883);

            if let Err(e) = run_session(&session, &host, port, &mut outgoing, &token).await {
                warn!("MQTT connection to {host}:{port} failed: {e:#}");
            }
            session.set_connected(false);
        }

        tokio::select! {
            () = token.cancelled() => {
                info!("MQTT client stopped");
                return Ok(());
            }
            () = sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// One broker connection, from CONNECT until the link drops or `token` fires.
async fn run_session(
    session: &Session,
    host: &str,
    port: u16,
    outgoing: &mut mpsc::Receiver<PendingPublish>,
    token: &CancellationToken,
) -> Result<()> {
    let (client, mut eventloop) = AsyncClient::new(session.options(host, port), REQUEST_CAPACITY);
    let mut handlers = Vec::new();

    loop {
        tokio::select! {
            () = token.cancelled() => {
                if session.is_connected() {
                    session.set_connected(false);
                    disconnect(&client, &mut eventloop).await;
                }
                return Ok(());
            }
            event = eventloop.poll() => match event.context("MQTT link lost")? {
                MqttEvent::Incoming(Packet::ConnAck(_)) => {
                    handlers = session.resolved_subscriptions()?;
                    subscribe_all(&client, &handlers);
                    info!("MQTT connected to {host}:{port} as {}", session.client_id);
                    session.set_connected(true);
                }
                MqttEvent::Incoming(Packet::Publish(publish)) => {
                    dispatch(&handlers, &publish.topic, &publish.payload);
                }
                MqttEvent::Incoming(Packet::SubAck(ack))
                    if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) =>
                {
                    error!("MQTT broker rejected a subscription");
                }
                other => trace!("MQTT {other:?}"),
            },
            Some(message) = outgoing.recv() => {
                let topic = message.topic.clone();
                if let Err(e) = client.try_publish(message.topic, QoS::AtMostOnce, false, message.payload) {
                    warn!("MQTT publish to {topic} failed: {e}");
                }
            }
        }
    }
}

fn subscribe_all(client: &AsyncClient, handlers: &[(String, MessageHandler)]) {
    let mut topics: Vec<&str> = handlers.iter().map(|(topic, _)| topic.as_str()).collect();
    topics.sort_unstable();
    topics.dedup();
    for topic in topics {
        if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
            error!("MQTT subscribe to {topic} failed: {e}");
        }
    }
}

/// Sends DISCONNECT and drives the event loop until it is on the wire.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        debug!("MQTT disconnect not queued: {e}");
        return;
    }
    let sent = timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if sent.is_err() {
        debug!("MQTT disconnect not delivered within {DISCONNECT_TIMEOUT:?}");
    }
}

fn dispatch(handlers: &[(String, MessageHandler)], topic: &str, payload: &[u8]) {
    let mut matched = false;
    for (_, handler) in handlers.iter().filter(|(t, _)| t == topic) {
        handler(payload);
        matched = true;
    }
    if !matched {
        debug!("MQTT message on unsubscribed topic {topic}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_packet(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Vec<u8> {
        let mut chunk = [0u8; 256];
        loop {
            if buf.len() >= 2 {
                let total = 2 + usize::from(buf[1]);
                if buf.len() >= total {
                    return buf.drain(..total).collect();
                }
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn declares_connection_params() {
        let config = ConfigStore::new();
        let client = MqttClient::new("neopixelcontroller-test", config.clone(), EventBus::new()).unwrap();
        assert_eq!(client.client_id(), "neopixelcontroller-test");
        assert_eq!(config.get_str(MQTT_HOST).as_deref(), Some(""));
        assert_eq!(config.get_int(MQTT_PORT), Some(1883));
    }

    #[test]
    fn rejects_unusable_client_ids() {
        for id in ["", " leading-space"] {
            assert!(MqttClient::new(id, ConfigStore::new(), EventBus::new()).is_err());
        }
    }

    #[test]
    fn param_topics_resolve_from_config() {
        let config = ConfigStore::new();
        config.add_param("topic", "a/b").unwrap();
        assert_eq!(Topic::Param("topic").resolve(&config).as_deref(), Some("a/b"));
        config.set("topic", "").unwrap();
        assert_eq!(Topic::Param("topic").resolve(&config), None);
        assert_eq!(Topic::from("x").resolve(&config).as_deref(), Some("x"));
    }

    #[test]
    fn topics_longer_than_the_length_prefix_are_rejected() {
        let long = "t".repeat(70_000);
        let config = ConfigStore::new();
        config.add_param("topic", long.as_str()).unwrap();
        assert_eq!(Topic::Param("topic").resolve(&config), None);

        let client = MqttClient::new("c", config, EventBus::new()).unwrap();
        let err = client.subscribe(long.as_str(), |_| {}).unwrap_err();
        assert!(err.to_string().contains("70000 bytes"), "{err}");
        assert!(client.subscribe("", |_| {}).is_err());

        client.handle.connected.store(true, Ordering::Release);
        assert!(client.handle().publish(&long, "x").is_err());
        let limit = "t".repeat(usize::from(u16::MAX));
        assert!(client.handle().publish(&limit, "x").is_ok());
    }

    #[test]
    fn publish_fails_while_disconnected() {
        let client = MqttClient::new("c", ConfigStore::new(), EventBus::new()).unwrap();
        let err = client.handle().publish("t", "x").unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn dispatch_matches_exact_topic() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            assert_eq!(payload, b"on");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handlers = vec![("neopixel/led/set".to_string(), handler)];

        dispatch(&handlers, "neopixel/led/set", b"on");
        dispatch(&handlers, "neopixel/led/set/extra", b"on");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_is_rejected_after_run() {
        let client = MqttClient::new("c", ConfigStore::new(), EventBus::new()).unwrap();
        let mut task_manager = TaskManager::new();
        client.run(&mut task_manager).await.unwrap();

        assert!(client.subscribe("late", |_| {}).is_err());

        client.shutdown().await.unwrap();
        task_manager.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn connects_subscribes_dispatches_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ConfigStore::new();
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        let client = MqttClient::new("neopixelcontroller-t", config.clone(), event_bus).unwrap();
        config.set(MQTT_HOST, "127.0.0.1").unwrap();
        config.set(MQTT_PORT, i64::from(port)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .subscribe("neopixel/led/set", move |payload| {
                tx.send(payload.to_vec()).unwrap();
            })
            .unwrap();

        let mut task_manager = TaskManager::new();
        client.run(&mut task_manager).await.unwrap();

        let (mut broker, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();

        let connect = read_packet(&mut broker, &mut buf).await;
        assert_eq!(connect[0], 0x10);
        broker.write_all(&[0x20, 2, 0, 0]).await.unwrap();

        let subscribe = read_packet(&mut broker, &mut buf).await;
        assert_eq!(subscribe[0], 0x82);
        let mut filter = vec![0, 16];
        filter.extend_from_slice(b"neopixel/led/set");
        filter.push(0);
        assert_eq!(&subscribe[4..], filter.as_slice());
        broker
            .write_all(&[0x90, 3, subscribe[2], subscribe[3], 0])
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), Event::MqttConnected(true));

        let payload = br##"{"all":"#ff0000"}"##;
        let mut delivery = vec![0x30, 35, 0, 16];
        delivery.extend_from_slice(b"neopixel/led/set");
        delivery.extend_from_slice(payload);
        broker.write_all(&delivery).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), payload.to_vec());

        client.handle().publish("neopixel/led", "[]").unwrap();
        let published = read_packet(&mut broker, &mut buf).await;
        let mut expected = vec![0x30, 16, 0, 12];
        expected.extend_from_slice(b"neopixel/led[]");
        assert_eq!(published, expected);

        client.shutdown().await.unwrap();
        let disconnect = read_packet(&mut broker, &mut buf).await;
        assert_eq!(disconnect, vec![0xE0, 0]);
        assert_eq!(events.recv().await.unwrap(), Event::MqttConnected(false));

        task_manager.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }
}
