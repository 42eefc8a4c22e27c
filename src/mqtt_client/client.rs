use std::{collections::HashMap, sync::Arc, time::Duration};

use backon::{BackoffBuilder, ExponentialBuilder};
use log::{debug, error, info, warn};
use rumqttc::{
    tokio_rustls::rustls::ClientConfig, AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS,
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch,
};

use crate::config::{models::Mqtt, PrinterPatch};
use crate::keepalive::Trigger;
use crate::service::Service;
use crate::state::StateChange;

use super::commands::{parse_command, Command, InboundCommand};
use super::fun_with_tls::{get_system_certs, NoopServerCertVerifier};
use super::home_assistant::{discovery_messages, discovery_topics};
use super::models::{ConnectionState, Topics};

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Remembers the last payload sent per topic so unchanged state is not re-sent.
#[derive(Debug, Default)]
pub struct PublishCache {
    sent: HashMap<String, Vec<u8>>,
}

impl PublishCache {
    /// Whether `payload` has to go out. `force` is used after a reconnect,
    /// when the broker may have lost what was sent before.
    pub fn should_publish(&mut self, topic: &str, payload: &[u8], force: bool) -> bool {
        if !force && self.sent.get(topic).is_some_and(|sent| sent.as_slice() == payload) {
            return false;
        }
        self.sent.insert(topic.to_owned(), payload.to_vec());
        true
    }

    pub fn forget(&mut self, topic: &str) {
        self.sent.remove(topic);
    }
}

/// Mirrors printer state to MQTT and turns inbound messages into service calls.
pub struct Bridge {
    service: Arc<Service>,
    settings: Mqtt,
    topics: Topics,
    connection: watch::Sender<ConnectionState>,
}

impl Bridge {
    pub fn new(service: Arc<Service>, settings: Mqtt, connection: watch::Sender<ConnectionState>) -> Self {
        let topics = Topics::new(&settings);
        Self { service, settings, topics, connection }
    }

    fn options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(self.settings.client_id.to_owned(), self.settings.host.to_owned(), self.settings.port);
        mqtt_options
            .set_transport(match self.settings.secure {
                true => {
                    let config: ClientConfig = match self.settings.ignore_tls_errors {
                        // TLS without certificate verification.
                        true => ClientConfig::builder().dangerous().with_custom_certificate_verifier(Arc::new(NoopServerCertVerifier {})).with_no_client_auth(),
                        // TLS with certificate verification.
                        false => ClientConfig::builder().with_root_certificates(get_system_certs().clone()).with_no_client_auth(),
                    };
                    rumqttc::Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(Arc::new(config)))
                },
                // No TLS.
                false => rumqttc::Transport::tcp(),
            })
            .set_keep_alive(Duration::from_secs(10))
            .set_last_will(LastWill::new(self.topics.availability(), OFFLINE, QoS::AtLeastOnce, true));
        if !self.settings.username.is_empty() {
            mqtt_options.set_credentials(self.settings.username.to_owned(), self.settings.password.to_owned());
        }
        mqtt_options
    }

    fn set_connection(&self, state: ConnectionState) {
        self.connection.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("MQTT connection {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    /// Runs until `shutdown` flips. Reconnects with exponential backoff.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 64);
        let (republish_tx, republish_rx) = mpsc::channel(4);
        // Subscribed before connecting so the first ConnAck is never missed.
        let watchers = (self.connection.subscribe(), self.service.state().subscribe());
        let publisher = tokio::spawn(self.clone().publish_loop(client.clone(), watchers, republish_rx));

        self.set_connection(ConnectionState::Connecting);
        info!("Connecting to MQTT broker {}:{}", self.settings.host, self.settings.port);
        let mut backoff = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                        info!("Connected to MQTT broker");
                        backoff = None;
                        self.set_connection(ConnectionState::Connected);
                    },
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        error!("MQTT broker refused the connection: {:?}", ack.code);
                        self.set_connection(ConnectionState::Disconnected);
                    },
                    Ok(Event::Incoming(Packet::Publish(publish))) => self.handle_publish(publish, &republish_tx),
                    Ok(_) => {},
                    Err(e) => {
                        self.set_connection(ConnectionState::Disconnected);
                        let delay = backoff
                            .get_or_insert_with(|| ExponentialBuilder::default().with_min_delay(Duration::from_secs(1)).with_max_delay(Duration::from_secs(60)).without_max_times().with_jitter().build())
                            .next()
                            .unwrap_or(Duration::from_secs(60));
                        warn!("MQTT connection error: {}, reconnecting in {:?}", e, delay);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => self.set_connection(ConnectionState::Connecting),
                            _ = shutdown.changed() => break,
                        }
                    },
                },
            }
        }

        publisher.abort();
        if *self.connection.borrow() == ConnectionState::Connected {
            let _ = client.try_publish(self.topics.availability(), QoS::AtLeastOnce, true, OFFLINE);
            let _ = client.try_disconnect();
            // Drive the event loop until the disconnect is flushed.
            let _ = tokio::time::timeout(Duration::from_secs(2), async {
                while let Ok(event) = eventloop.poll().await {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
            })
            .await;
        }
        self.set_connection(ConnectionState::Disconnected);
        info!("MQTT bridge stopped");
    }

    fn handle_publish(&self, publish: Publish, republish: &mpsc::Sender<()>) {
        if publish.topic == self.topics.home_assistant_status() {
            if publish.payload.as_ref() == ONLINE.as_bytes() {
                info!("Home Assistant came online, republishing everything");
                let _ = republish.try_send(());
            }
            return;
        }

        match parse_command(&self.topics.root, &publish.topic, &publish.payload) {
            Ok(command) => {
                let service = self.service.clone();
                tokio::spawn(handle_command(service, command));
            },
            Err(e) => warn!("Ignoring MQTT message: {}", e),
        }
    }

    /// Publishes state changes while connected. Everything is re-sent on each (re)connect.
    async fn publish_loop(
        self: Arc<Self>,
        client: AsyncClient,
        (mut connection, mut changes): (watch::Receiver<ConnectionState>, broadcast::Receiver<StateChange>),
        mut republish: mpsc::Receiver<()>,
    ) {
        let mut cache = PublishCache::default();

        loop {
            tokio::select! {
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    if state == ConnectionState::Connected {
                        if let Err(e) = self.on_connect(&client, &mut cache).await {
                            warn!("Could not finish MQTT setup after connecting: {}", e);
                        }
                    }
                },
                Some(()) = republish.recv() => {
                    if *connection.borrow() == ConnectionState::Connected {
                        if let Err(e) = self.publish_all(&client, &mut cache, true).await {
                            warn!("Republish failed: {}", e);
                        }
                    }
                },
                change = changes.recv() => {
                    if *connection.borrow() != ConnectionState::Connected {
                        continue;
                    }
                    let result = match change {
                        Ok(StateChange::Printer(printer_id)) => self.publish_printer(&client, &mut cache, &printer_id, false).await,
                        Ok(StateChange::PrinterRemoved(printer_id)) => self.clear_printer(&client, &mut cache, &printer_id).await,
                        Ok(StateChange::Discovery) | Err(RecvError::Lagged(_)) => self.publish_all(&client, &mut cache, false).await,
                        Err(RecvError::Closed) => break,
                    };
                    if let Err(e) = result {
                        warn!("MQTT publish failed: {}", e);
                    }
                },
            }
        }
    }

    async fn on_connect(&self, client: &AsyncClient, cache: &mut PublishCache) -> anyhow::Result<()> {
        client.subscribe(self.topics.command_filter(), QoS::AtLeastOnce).await?;
        if self.settings.ha.enable_discovery {
            client.subscribe(self.topics.home_assistant_status(), QoS::AtLeastOnce).await?;
        }
        client.publish(self.topics.availability(), QoS::AtLeastOnce, true, ONLINE).await?;
        self.publish_all(client, cache, true).await
    }

    async fn publish_all(&self, client: &AsyncClient, cache: &mut PublishCache, force: bool) -> anyhow::Result<()> {
        let snapshot = self.service.config().current();
        if self.settings.ha.enable_discovery {
            for printer in &snapshot.printers {
                let model = self.service.state().printer(&printer.id).and_then(|runtime| runtime.telemetry).and_then(|telemetry| telemetry.make_and_model);
                for (topic, payload) in discovery_messages(&self.topics, printer, model.as_deref())? {
                    if cache.should_publish(&topic, &payload, force) {
                        client.publish(topic, QoS::AtLeastOnce, true, payload).await?;
                    }
                }
            }
        }
        for printer in &snapshot.printers {
            self.publish_printer(client, cache, &printer.id, force).await?;
        }
        debug!("Published state of {} printer(s)", snapshot.printers.len());
        Ok(())
    }

    async fn publish_printer(&self, client: &AsyncClient, cache: &mut PublishCache, printer_id: &str, force: bool) -> anyhow::Result<()> {
        let Some(health) = self.service.printer_health(printer_id) else {
            return Ok(());
        };
        let topic = self.topics.state(printer_id);
        let payload = serde_json::to_vec(&health)?;
        if cache.should_publish(&topic, &payload, force) {
            client.publish(topic, QoS::AtLeastOnce, self.settings.retain, payload).await?;
        } else {
            debug!("State of {} unchanged, not republishing", printer_id);
        }
        Ok(())
    }

    /// Retained topics of a printer: its state and, with discovery on, its entity configs.
    fn retained_topics(&self, printer_id: &str) -> Vec<String> {
        let mut topics = vec![self.topics.state(printer_id)];
        if self.settings.ha.enable_discovery {
            topics.extend(discovery_topics(&self.topics, printer_id));
        }
        topics
    }

    /// Removes retained messages of a printer that is no longer configured.
    /// An empty retained config also makes Home Assistant drop the entities.
    async fn clear_printer(&self, client: &AsyncClient, cache: &mut PublishCache, printer_id: &str) -> anyhow::Result<()> {
        for topic in self.retained_topics(printer_id) {
            cache.forget(&topic);
            client.publish(topic, QoS::AtLeastOnce, true, Vec::new()).await?;
        }
        info!("Cleared retained messages of removed printer {}", printer_id);
        Ok(())
    }
}

async fn handle_command(service: Arc<Service>, inbound: InboundCommand) {
    let InboundCommand { printer_id, command } = inbound;
    info!("MQTT command for {}: {:?}", printer_id, command);

    let patch = match command {
        Command::SetEnabled(enabled) => PrinterPatch::Enabled(enabled),
        Command::SetCadence(cadence) => PrinterPatch::Cadence(cadence),
        Command::SetTemplate(template) => PrinterPatch::Template(template),
        Command::PrintNow => {
            match service.force_print(&printer_id, Trigger::Mqtt).await {
                Ok(execution) => debug!("MQTT print for {} finished: {:?}", printer_id, execution),
                Err(e) => warn!("MQTT print for {} failed: {}", printer_id, e),
            }
            return;
        },
        Command::PollNow => {
            if let Err(e) = service.poll_now(&printer_id).await {
                warn!("MQTT poll for {} failed: {}", printer_id, e);
            }
            return;
        },
    };

    if let Err(e) = service.apply(&printer_id, patch) {
        warn!("Rejected MQTT command for {}: {}", printer_id, e);
    }
}
