//! # Plane Bridging
//!
//! `forward`/`deforward` in both directions: a local bus relaying onto a
//! broker, a broker injecting into a local bus, and the two combined.
//! Event ids must survive every hop so consumers can deduplicate.

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use meshbus::{
        Broker, BrokerConfig, HeartbeatConfig, LocalBus, LocalEntryPoint, RemoteEntryPoint,
    };

    use crate::integration::{init_tracing, wait_until, SETTLE};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Notice {
        text: String,
    }

    async fn broker_on(port: u16) -> Broker {
        Broker::bind("127.0.0.1", port, BrokerConfig::testing())
            .await
            .expect("port triple free")
    }

    /// Local-to-remote: a bus relays matching local traffic onto a broker,
    /// where a networked consumer picks it up under the original event id.
    #[tokio::test]
    async fn test_local_bus_forwards_to_broker() {
        init_tracing();
        let broker = broker_on(19100).await;

        let remote_consumer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        remote_consumer
            .on::<Notice, _, _>("news.flash", |notice| async move {
                assert_eq!(notice.text, "hello");
                Ok(())
            })
            .await
            .unwrap();
        remote_consumer.connect("127.0.0.1", 19100).await.unwrap();
        broker.flush().await;

        let bus = LocalBus::new();
        bus.forward("127.0.0.1", 19100, Some(vec!["news.*".to_string()]))
            .await
            .unwrap();

        let local_producer = LocalEntryPoint::new();
        local_producer.connect(&bus).unwrap();
        let event = local_producer
            .emit("news.flash", &Notice { text: "hello".into() })
            .await
            .unwrap()
            .expect("connected");

        assert!(
            wait_until(|| remote_consumer.has_received(&event.id), SETTLE).await,
            "the relayed event should keep its id across the bridge"
        );

        remote_consumer.close().await;
        bus.close().await;
        broker.close().await;
    }

    /// Remote-to-local: the broker injects matching collect traffic into a
    /// forwarded local bus.
    #[tokio::test]
    async fn test_broker_forwards_into_local_bus() {
        init_tracing();
        let broker = broker_on(19110).await;

        let bus = LocalBus::new();
        let local_consumer = LocalEntryPoint::new();
        local_consumer
            .on::<Notice, _, _>("news.flash", |notice| async move {
                assert_eq!(notice.text, "from afar");
                Ok(())
            })
            .unwrap();
        local_consumer.connect(&bus).unwrap();
        broker.forward(&bus, Some(vec!["news.*".to_string()])).await;

        let remote_producer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        remote_producer.connect("127.0.0.1", 19110).await.unwrap();
        let event = remote_producer
            .emit("news.flash", &Notice { text: "from afar".into() })
            .await
            .unwrap()
            .expect("connected");

        assert!(
            wait_until(|| local_consumer.has_received(&event.id), SETTLE).await,
            "bridged event should reach the local consumer with its id"
        );

        remote_producer.close().await;
        broker.close().await;
        bus.close().await;
    }

    /// Two local buses exchanging traffic through one broker, each bridge
    /// direction scoped by disjoint filters so nothing loops.
    #[tokio::test]
    async fn test_two_buses_bridged_through_one_broker() {
        init_tracing();
        let broker = broker_on(19120).await;

        let bus_a = LocalBus::new();
        let bus_b = LocalBus::new();

        // A publishes under a.*, B consumes; broker injects a.* into B only.
        bus_a
            .forward("127.0.0.1", 19120, Some(vec!["a.*".to_string()]))
            .await
            .unwrap();
        broker.forward(&bus_b, Some(vec!["a.*".to_string()])).await;

        let consumer_b = LocalEntryPoint::new();
        consumer_b
            .on::<Notice, _, _>("a.ping", |_| async { Ok(()) })
            .unwrap();
        consumer_b.connect(&bus_b).unwrap();

        let producer_a = LocalEntryPoint::new();
        producer_a.connect(&bus_a).unwrap();
        let event = producer_a
            .emit("a.ping", &Notice { text: "ping".into() })
            .await
            .unwrap()
            .expect("connected");

        assert!(
            wait_until(|| consumer_b.has_received(&event.id), SETTLE).await,
            "bus A traffic should arrive on bus B"
        );

        bus_a.close().await;
        bus_b.close().await;
        broker.close().await;
    }

    /// Filters scope the bridge: non-matching topics stay on their side.
    #[tokio::test]
    async fn test_bridge_filters_limit_traffic() {
        init_tracing();
        let broker = broker_on(19130).await;

        let bus = LocalBus::new();
        let local_consumer = LocalEntryPoint::new();
        local_consumer
            .on_event("private.note", |_| async { Ok(()) })
            .unwrap();
        local_consumer.connect(&bus).unwrap();
        broker
            .forward(&bus, Some(vec!["public.*".to_string()]))
            .await;

        let remote_producer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        remote_producer.connect("127.0.0.1", 19130).await.unwrap();
        let event = remote_producer
            .emit_empty("private.note")
            .await
            .unwrap()
            .expect("connected");

        broker.flush().await;
        assert!(
            !local_consumer.has_received(&event.id),
            "filtered-out topics must not cross the bridge"
        );

        remote_producer.close().await;
        broker.close().await;
        bus.close().await;
    }

    /// `deforward` severs an established bridge.
    #[tokio::test]
    async fn test_deforward_stops_the_relay() {
        init_tracing();
        let broker = broker_on(19140).await;

        let remote_consumer = RemoteEntryPoint::new(HeartbeatConfig::testing());
        remote_consumer
            .on_event("news.*", |_| async { Ok(()) })
            .await
            .unwrap();
        remote_consumer.connect("127.0.0.1", 19140).await.unwrap();
        broker.flush().await;

        let bus = LocalBus::new();
        bus.forward("127.0.0.1", 19140, None).await.unwrap();

        let producer = LocalEntryPoint::new();
        producer.connect(&bus).unwrap();
        let first = producer
            .emit_empty("news.one")
            .await
            .unwrap()
            .expect("connected");
        assert!(wait_until(|| remote_consumer.has_received(&first.id), SETTLE).await);

        bus.deforward("127.0.0.1", 19140).await;
        let second = producer
            .emit_empty("news.two")
            .await
            .unwrap()
            .expect("connected");
        broker.flush().await;
        assert!(
            !remote_consumer.has_received(&second.id),
            "traffic after deforward must stay local"
        );

        remote_consumer.close().await;
        bus.close().await;
        broker.close().await;
    }
}
