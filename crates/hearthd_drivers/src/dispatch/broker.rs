//! Message broker seam: topic subscriptions for message triggers.
//!
//! Incoming messages do not come back through this trait. A broker pushes
//! them into the dispatcher's event channel as
//! [`DispatchEvent::Message`](super::DispatchEvent::Message).

use async_trait::async_trait;

#[cfg(feature = "broker_mqtt")]
pub use mqtt::MqttBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Message broker unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "broker_mqtt")]
    #[error("MQTT request failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
}

/// Broker that records subscriptions, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockBroker {
    subscribed: std::sync::Mutex<Vec<String>>,
    unsubscribed: std::sync::Mutex<Vec<String>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following request fail until called again with `false`.
    pub fn fail(&self, fail: bool) {
        self.failing
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("mock broker offline".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl MessageBroker for MockBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.unsubscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

#[cfg(feature = "broker_mqtt")]
mod mqtt {
    use std::time::Duration;

    use async_trait::async_trait;
    use rumqttc::AsyncClient;
    use rumqttc::Event;
    use rumqttc::MqttOptions;
    use rumqttc::Packet;
    use rumqttc::QoS;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::debug;
    use tracing::info;
    use tracing::warn;

    use super::BrokerError;
    use super::MessageBroker;
    use crate::config::MqttConfig;
    use crate::dispatch::DispatchEvent;

    /// MQTT broker connection backed by rumqttc.
    ///
    /// A background task polls the event loop, forwarding publishes and
    /// reconnects into the dispatcher's event channel.
    pub struct MqttBroker {
        client: AsyncClient,
        event_loop_task: JoinHandle<()>,
    }

    impl MqttBroker {
        pub fn connect(config: &MqttConfig, events: mpsc::Sender<DispatchEvent>) -> Self {
            let mut options =
                MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
            options.set_keep_alive(Duration::from_secs(30));
            if let (Some(username), Some(password)) = (&config.username, &config.password) {
                options.set_credentials(username, password);
            }

            let (client, mut event_loop) = AsyncClient::new(options, 10);
            let host = format!("{}:{}", config.host, config.port);

            let event_loop_task = tokio::spawn(async move {
                loop {
                    let event = match event_loop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => DispatchEvent::Message {
                            topic: publish.topic.to_string(),
                            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                        },
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("[{}] Connected to MQTT broker", host);
                            DispatchEvent::BrokerConnected
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("[{}] MQTT event loop error: {}", host, e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };

                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                debug!("[{}] MQTT event loop task exiting", host);
            });

            Self {
                client,
                event_loop_task,
            }
        }
    }

    #[async_trait]
    impl MessageBroker for MqttBroker {
        async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.client.subscribe(topic, QoS::AtLeastOnce).await?;
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.client.unsubscribe(topic).await?;
            Ok(())
        }
    }

    impl Drop for MqttBroker {
        fn drop(&mut self) {
            self.event_loop_task.abort();
        }
    }

}
