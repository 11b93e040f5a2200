//! Transport bridge
//!
//! Polls the MQTT event loop and the broker heartbeat subscription and hands
//! what arrives to the [`AgentService`]. No business logic lives here.

use futures::{Stream, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, QoS};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::service::AgentService;
use crate::transport::{
    parse_service_topic, request_topic, services_filter, TransportError, HEARTBEAT_SUBJECT,
};

/// Pause after an MQTT connection error before polling again
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Where an inbound MQTT message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Request,
    Service { service: String, subtopic: String },
    Ignored,
}

pub fn classify(control: &str, topic: &str) -> Route {
    if topic == request_topic(control) {
        return Route::Request;
    }
    match parse_service_topic(control, topic) {
        Some((service, subtopic)) => Route::Service {
            service: service.to_string(),
            subtopic: subtopic.to_string(),
        },
        None => Route::Ignored,
    }
}

/// Delivers one inbound MQTT message.
pub async fn dispatch(service: &AgentService, topic: &str, payload: Vec<u8>) {
    let control = service.config().channels.control;
    match classify(&control, topic) {
        Route::Request => service.handle_request(&payload).await,
        Route::Service { service: name, subtopic } => {
            if let Err(e) = service.forward(&name, &subtopic, payload).await {
                warn!("Failed to forward {} to service '{}': {}", topic, name, e);
            }
        }
        Route::Ignored => debug!("Ignoring message on {}", topic),
    }
}

async fn subscribe(client: &AsyncClient, control: &str, qos: QoS) -> Result<(), TransportError> {
    client.subscribe(request_topic(control), qos).await?;
    client.subscribe(services_filter(control), qos).await?;
    Ok(())
}

/// Runs the MQTT side for the lifetime of the process. Subscriptions are
/// issued again on every (re)connection.
pub async fn run_mqtt(service: Arc<AgentService>, client: AsyncClient, mut eventloop: EventLoop, qos: QoS) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                let control = service.config().channels.control;
                match subscribe(&client, &control, qos).await {
                    Ok(()) => info!("Subscribed to control channel {}", control),
                    Err(e) => error!("Failed to subscribe to control channel {}: {}", control, e),
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let service = service.clone();
                tokio::spawn(async move {
                    dispatch(&service, &publish.topic, publish.payload.to_vec()).await;
                });
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Feeds broker heartbeats into the registry for the lifetime of the process.
pub async fn run_heartbeats(service: Arc<AgentService>, client: async_nats::Client) {
    feed_heartbeats(&service, RECONNECT_DELAY, || {
        let client = client.clone();
        async move {
            let subscriber = client
                .subscribe(HEARTBEAT_SUBJECT)
                .await
                .map_err(|e| TransportError::Broker(format!("subscribe to {HEARTBEAT_SUBJECT}: {e}")))?;
            Ok(subscriber.map(|message| message.subject.to_string()))
        }
    })
    .await
}

/// Applies heartbeat subjects from the streams `subscribe` opens. A stream
/// that ends or fails to open is replaced after `delay`.
pub async fn feed_heartbeats<F, Fut, S>(service: &AgentService, delay: Duration, mut subscribe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, TransportError>>,
    S: Stream<Item = String>,
{
    loop {
        match subscribe().await {
            Ok(subjects) => {
                info!("Listening for heartbeats on {}", HEARTBEAT_SUBJECT);
                let mut subjects = pin!(subjects);
                while let Some(subject) = subjects.next().await {
                    service.registry().handle_subject(&subject);
                }
                warn!("Heartbeat subscription closed, resubscribing");
            }
            Err(e) => error!("Heartbeat subscription failed: {}", e),
        }
        tokio::time::sleep(delay).await;
    }
}
