use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tracing::{debug, error, info, warn};

use super::{MessageHandler, SubscriptionId, Transport, TransportError, topic_matches};
use crate::config::Config;

struct Route {
    id: SubscriptionId,
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// Routes incoming publishes to the handlers whose filter matches.
#[derive(Default)]
struct Router {
    next_id: AtomicU64,
    routes: Mutex<Vec<Route>>,
}

impl Router {
    fn add(&self, filter: &str, qos: QoS, handler: MessageHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.routes.lock().push(Route {
            id,
            filter: filter.to_string(),
            qos,
            handler,
        });
        id
    }

    /// Removes a route. Returns its filter and whether another route still uses it.
    fn remove(&self, id: SubscriptionId) -> Option<(String, bool)> {
        let mut routes = self.routes.lock();
        let pos = routes.iter().position(|r| r.id == id)?;
        let route = routes.remove(pos);
        let shared = routes.iter().any(|r| r.filter == route.filter);
        Some((route.filter, shared))
    }

    /// Filter of a route and whether another route shares it, without removing it.
    fn lookup(&self, id: SubscriptionId) -> Option<(String, bool)> {
        let routes = self.routes.lock();
        let route = routes.iter().find(|r| r.id == id)?;
        let shared = routes
            .iter()
            .any(|r| r.id != id && r.filter == route.filter);
        Some((route.filter.clone(), shared))
    }

    /// Distinct filters to (re)subscribe after a connect.
    fn filters(&self) -> Vec<(String, QoS)> {
        let mut filters: Vec<(String, QoS)> = Vec::new();
        for route in self.routes.lock().iter() {
            if !filters.iter().any(|(f, _)| f == &route.filter) {
                filters.push((route.filter.clone(), route.qos));
            }
        }
        filters
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<MessageHandler> = self
            .routes
            .lock()
            .iter()
            .filter(|r| topic_matches(&r.filter, topic))
            .map(|r| r.handler.clone())
            .collect();
        for handler in &handlers {
            handler(topic, payload);
        }
        handlers.len()
    }
}

/// Removes a freshly added route when dropped before `disarm`, so a subscribe
/// cancelled mid-await leaves nothing routed.
struct PendingRoute<'a> {
    router: &'a Router,
    id: SubscriptionId,
    armed: bool,
}

impl<'a> PendingRoute<'a> {
    fn add(router: &'a Router, filter: &str, qos: QoS, handler: MessageHandler) -> Self {
        let id = router.add(filter, qos, handler);
        Self {
            router,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) -> SubscriptionId {
        self.armed = false;
        self.id
    }
}

impl Drop for PendingRoute<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.router.remove(self.id);
        }
    }
}

/// Cloneable [`Transport`] handle onto the shared MQTT connection.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    router: Arc<Router>,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, TransportError> {
        let pending = PendingRoute::add(&self.router, filter, qos, handler);
        self.client.subscribe(filter, qos).await?;
        let id = pending.disarm();
        debug!("Subscribed to {} ({:?})", filter, id);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        // The route stays until the request is queued, so a cancelled call
        // can be retried with the same id.
        let (filter, shared) = self
            .router
            .lookup(id)
            .ok_or(TransportError::UnknownSubscription(id))?;
        if !shared {
            self.client.unsubscribe(&filter).await?;
        }
        self.router.remove(id);
        debug!("Unsubscribed from {} ({:?})", filter, id);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    router: Arc<Router>,
    status_topic: String,
    connected_before: bool,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: the broker publishes "offline" for us when the connection drops.
        let status_topic = config.bridge_status_topic();
        let lwt = rumqttc::LastWill::new(
            status_topic.clone(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            router: Arc::new(Router::default()),
            status_topic,
            connected_before: false,
        }
    }

    pub fn transport(&self) -> MqttTransport {
        MqttTransport {
            client: self.client.clone(),
            router: self.router.clone(),
        }
    }

    /// Run the MQTT event loop. Publishes availability and restores every
    /// routed subscription on connect, and hands incoming publishes to the
    /// router one at a time.
    pub async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    self.on_connected();
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let handled = self.router.dispatch(&publish.topic, &publish.payload);
                    if handled == 0 {
                        debug!("No route for {}", publish.topic);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}. Reconnecting...", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    // try_* variants: awaiting the request channel from inside the event loop
    // task would deadlock once the channel is full.
    fn on_connected(&mut self) {
        if let Err(e) =
            self.client
                .try_publish(&self.status_topic, QoS::AtLeastOnce, true, "online")
        {
            error!("Failed to publish online status: {}", e);
        }

        for (filter, qos) in self.resubscriptions() {
            if let Err(e) = self.client.try_subscribe(&filter, qos) {
                warn!("Failed to resubscribe to {}: {}", filter, e);
            }
        }
    }

    /// Filters to restore after a reconnect. Subscribe requests made before
    /// the first connect are still queued, so nothing is restored then.
    fn resubscriptions(&mut self) -> Vec<(String, QoS)> {
        if !std::mem::replace(&mut self.connected_before, true) {
            return Vec::new();
        }
        self.router.filters()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::tests::{entry, test_config};
    use crate::gardena::bridge::{ActuatorBridge, BridgeError};

    /// Transport whose request channel holds a single request and is never
    /// drained, so a second queued request blocks.
    fn stalled_transport() -> (MqttTransport, EventLoop) {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("stalled", "localhost", 1883), 1);
        let transport = MqttTransport {
            client,
            router: Arc::new(Router::default()),
        };
        (transport, eventloop)
    }

    fn noop() -> MessageHandler {
        Arc::new(|_: &str, _: &[u8]| {})
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_topic: &str, _payload: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispatch_reaches_only_matching_routes() {
        let router = Router::default();
        let state_hits = Arc::new(AtomicUsize::new(0));
        let set_hits = Arc::new(AtomicUsize::new(0));
        router.add(
            "hass/sta/GW1/DEV1/#",
            QoS::AtLeastOnce,
            counting_handler(state_hits.clone()),
        );
        router.add(
            "gardena/+/set",
            QoS::AtLeastOnce,
            counting_handler(set_hits.clone()),
        );

        assert_eq!(router.dispatch("hass/sta/GW1/DEV1/actuator/0", b"{}"), 1);
        assert_eq!(router.dispatch("gardena/lawn/set", b"ON"), 1);
        assert_eq!(router.dispatch("hass/exc-res/x/y", b"{}"), 0);

        assert_eq!(state_hits.load(Ordering::SeqCst), 1);
        assert_eq!(set_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_a_route_reports_whether_the_filter_is_still_shared() {
        let router = Router::default();
        let noop: MessageHandler = Arc::new(|_: &str, _: &[u8]| {});
        let first = router.add("a/#", QoS::AtLeastOnce, noop.clone());
        let second = router.add("a/#", QoS::AtLeastOnce, noop);

        assert_eq!(router.filters(), vec![("a/#".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(router.remove(first), Some(("a/#".to_string(), true)));
        assert_eq!(router.remove(second), Some(("a/#".to_string(), false)));
        assert_eq!(router.remove(second), None);
        assert!(router.filters().is_empty());
    }

    #[tokio::test]
    async fn cancelled_subscribe_leaves_no_route() {
        let (transport, _eventloop) = stalled_transport();
        transport
            .client
            .try_publish("filler", QoS::AtMostOnce, false, "x")
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            transport.subscribe("a/#", QoS::AtLeastOnce, noop()),
        )
        .await;

        assert!(result.is_err());
        assert!(transport.router.filters().is_empty());
        assert_eq!(transport.router.dispatch("a/b", b"{}"), 0);
    }

    #[tokio::test]
    async fn cancelled_unsubscribe_keeps_the_route() {
        let (transport, _eventloop) = stalled_transport();
        let id = transport
            .subscribe("a/#", QoS::AtLeastOnce, noop())
            .await
            .unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(50), transport.unsubscribe(id)).await;

        assert!(result.is_err());
        assert_eq!(transport.router.lookup(id), Some(("a/#".to_string(), false)));
    }

    #[tokio::test]
    async fn timed_out_attach_does_not_route_state_messages() {
        let (transport, _eventloop) = stalled_transport();
        transport
            .client
            .try_publish("filler", QoS::AtMostOnce, false, "x")
            .unwrap();
        let transport = Arc::new(transport);
        let config = test_config(vec![]);
        let lawn = entry("Lawn", "GW1", "DEV1");
        let mut settings = config.command_settings();
        settings.call_timeout = Duration::from_millis(50);
        let (refresh_tx, mut refresh_rx) = tokio::sync::mpsc::unbounded_channel();
        let bridge = ActuatorBridge::new(
            lawn.entry_id.clone(),
            config.device_address(&lawn),
            transport.clone(),
            settings,
            refresh_tx,
        );

        for _ in 0..2 {
            let err = bridge.attach().await.unwrap_err();
            assert!(matches!(err, BridgeError::Timeout { operation: "subscribe", .. }));
        }
        transport.router.dispatch(
            "hass/sta/GW1/DEV1/actuator/0",
            br#"{"op":"update","entity":{"path":"actuator/0"},"payload":{"state":{"vi":true}}}"#,
        );

        assert!(!bridge.is_attached().await);
        assert!(transport.router.filters().is_empty());
        assert!(!bridge.is_on());
        assert!(refresh_rx.try_recv().is_err());
    }

    #[test]
    fn first_connect_does_not_resubscribe() {
        let mut client = MqttClient::new(&test_config(vec![]));
        client.router.add("a/#", QoS::AtLeastOnce, noop());

        assert!(client.resubscriptions().is_empty());
        assert_eq!(
            client.resubscriptions(),
            vec![("a/#".to_string(), QoS::AtLeastOnce)]
        );
    }
}
