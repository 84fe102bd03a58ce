//! In-memory media engine for tests.
//!
//! Emulates the lifecycle semantics the orchestration layer depends on:
//! consumers start paused, closing a producer fires `producer close` on every
//! consumer bound to it, closing a transport takes its producers and
//! consumers down with it, and a killed worker fires its death observer.
//!
//! Capability matching convention: `can_consume` rejects capabilities that
//! contain a `"deny"` key, so tests produce a mismatch with
//! `json!({"deny": true})` and a match with `json!({})`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::engine::{
    CloseHandler, DiedHandler, MediaConsumer, MediaEngine, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker, TransportDirection, WorkerSettings,
};
use crate::error::{Error, Result};
use crate::types::{ConsumerId, ProducerId, TransportId};

type EventLog = Arc<Mutex<Vec<String>>>;

fn engine_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub struct MockMediaEngine {
    workers: Mutex<Vec<Arc<MockWorker>>>,
    routers: Arc<Mutex<Vec<Arc<MockRouter>>>>,
    next_pid: AtomicU32,
    log: EventLog,
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(Vec::new()),
            routers: Arc::new(Mutex::new(Vec::new())),
            next_pid: AtomicU32::new(1),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Workers spawned so far, in creation order.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<MockWorker>> {
        self.workers.lock().clone()
    }

    /// Routing contexts created so far, across all workers, for tests that
    /// need the concrete handles.
    #[must_use]
    pub fn routers(&self) -> Vec<Arc<MockRouter>> {
        self.routers.lock().clone()
    }

    /// Chronological record of engine operations, for ordering assertions.
    /// Entries look like `close:producer:<id>`.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_worker(&self, _settings: WorkerSettings) -> Result<Arc<dyn MediaWorker>> {
        let pid = self.next_pid.fetch_add(1, Ordering::AcqRel);
        let worker = Arc::new(MockWorker {
            pid,
            alive: AtomicBool::new(true),
            died: Mutex::new(None),
            router_count: AtomicUsize::new(0),
            routers: Arc::clone(&self.routers),
            log: Arc::clone(&self.log),
        });
        self.log.lock().push(format!("create:worker:{pid}"));
        self.workers.lock().push(Arc::clone(&worker));
        Ok(worker)
    }
}

pub struct MockWorker {
    pid: u32,
    alive: AtomicBool,
    died: Mutex<Option<DiedHandler>>,
    router_count: AtomicUsize,
    routers: Arc<Mutex<Vec<Arc<MockRouter>>>>,
    log: EventLog,
}

impl MockWorker {
    /// Simulates the worker process dying: marks it dead and fires the
    /// registered death observer.
    pub fn kill(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            self.log.lock().push(format!("died:worker:{}", self.pid));
            if let Some(handler) = self.died.lock().take() {
                handler(self.pid);
            }
        }
    }

    /// Routing contexts created on this worker, for fairness assertions.
    #[must_use]
    pub fn router_count(&self) -> usize {
        self.router_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaWorker for MockWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn on_died(&self, handler: DiedHandler) {
        *self.died.lock() = Some(handler);
    }

    async fn create_router(&self, _codecs: Value) -> Result<Arc<dyn MediaRouter>> {
        if !self.is_alive() {
            return Err(Error::WorkerDied(self.pid));
        }
        self.router_count.fetch_add(1, Ordering::AcqRel);
        let router = MockRouter::new(Arc::clone(&self.log));
        self.log.lock().push(format!("create:router:{}", router.id));
        self.routers.lock().push(Arc::clone(&router));
        Ok(router)
    }
}

pub struct MockRouter {
    id: String,
    weak_self: Weak<MockRouter>,
    closed: AtomicBool,
    producers: Mutex<HashMap<ProducerId, Weak<MockProducer>>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    log: EventLog,
}

impl MockRouter {
    fn new(log: EventLog) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id: engine_id(),
            weak_self: weak_self.clone(),
            closed: AtomicBool::new(false),
            producers: Mutex::new(HashMap::new()),
            transports: Mutex::new(Vec::new()),
            log,
        })
    }

    /// Concrete transport handles, for tests simulating engine events.
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    fn register_producer(&self, producer: &Arc<MockProducer>) {
        self.producers
            .lock()
            .insert(producer.id.clone(), Arc::downgrade(producer));
    }

    fn unregister_producer(&self, producer_id: &ProducerId) {
        self.producers.lock().remove(producer_id);
    }

    fn producer(&self, producer_id: &ProducerId) -> Option<Arc<MockProducer>> {
        self.producers
            .lock()
            .get(producer_id)
            .and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn capabilities(&self) -> Value {
        json!({ "codecs": ["audio/opus", "video/VP8"] })
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>> {
        if self.is_closed() {
            return Err(Error::Engine("router closed".to_string()));
        }
        let transport = Arc::new(MockTransport {
            id: TransportId::from(engine_id()),
            direction,
            router: self.weak_self.clone(),
            connected: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_handler: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            log: Arc::clone(&self.log),
        });
        self.log
            .lock()
            .push(format!("create:transport:{}", transport.id));
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &Value) -> bool {
        self.producer(producer_id).is_some() && capabilities.get("deny").is_none()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.log.lock().push(format!("close:router:{}", self.id));
        }
    }
}

pub struct MockTransport {
    id: TransportId,
    direction: TransportDirection,
    router: Weak<MockRouter>,
    connected: Mutex<Option<Value>>,
    closed: AtomicBool,
    close_handler: Mutex<Option<CloseHandler>>,
    producers: Mutex<Vec<Arc<MockProducer>>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
    log: EventLog,
}

impl MockTransport {
    /// Simulates an engine-originated transport teardown: fires the close
    /// observer first (the event), then takes the transport down.
    pub fn trigger_close(&self) {
        let handler = self.close_handler.lock().take();
        if let Some(handler) = handler {
            handler();
        }
        self.close();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.lock().is_some()
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connect_params(&self) -> Value {
        json!({
            "transportId": self.id,
            "iceParameters": { "usernameFragment": self.id.as_str() },
            "dtlsParameters": { "role": "auto" },
        })
    }

    async fn connect(&self, params: Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        *self.connected.lock() = Some(params);
        self.log.lock().push(format!("connect:transport:{}", self.id));
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, _params: Value) -> Result<Arc<dyn MediaProducer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| Error::Engine("router dropped".to_string()))?;
        let producer = Arc::new(MockProducer {
            id: ProducerId::from(engine_id()),
            kind,
            router: self.router.clone(),
            closed: AtomicBool::new(false),
            transport_close: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            log: Arc::clone(&self.log),
        });
        router.register_producer(&producer);
        self.producers.lock().push(Arc::clone(&producer));
        self.log.lock().push(format!("create:producer:{}", producer.id));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: Value,
    ) -> Result<Arc<dyn MediaConsumer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| Error::Engine("router dropped".to_string()))?;
        if !router.can_consume(producer_id, &capabilities) {
            return Err(Error::CannotConsume(producer_id.clone()));
        }
        let producer = router
            .producer(producer_id)
            .ok_or_else(|| Error::ProducerNotFound(producer_id.clone()))?;
        let consumer = Arc::new(MockConsumer {
            id: ConsumerId::from(engine_id()),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            producer_close: Mutex::new(None),
            transport_close: Mutex::new(None),
            log: Arc::clone(&self.log),
        });
        producer.consumers.lock().push(Arc::downgrade(&consumer));
        self.consumers.lock().push(Arc::clone(&consumer));
        self.log.lock().push(format!("create:consumer:{}", consumer.id));
        Ok(consumer)
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.close_handler.lock() = Some(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.lock().push(format!("close:transport:{}", self.id));
        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close_from_transport();
        }
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close_from_transport();
        }
    }
}

pub struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    router: Weak<MockRouter>,
    closed: AtomicBool,
    transport_close: Mutex<Option<CloseHandler>>,
    consumers: Mutex<Vec<Weak<MockConsumer>>>,
    log: EventLog,
}

impl MockProducer {
    /// Teardown caused by the owning transport closing: fires this
    /// producer's transport-close observer, then invalidates its consumers.
    fn close_from_transport(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.lock().push(format!("close:producer:{}", self.id));
        if let Some(router) = self.router.upgrade() {
            router.unregister_producer(&self.id);
        }
        if let Some(handler) = self.transport_close.lock().take() {
            handler();
        }
        self.invalidate_consumers();
    }

    fn invalidate_consumers(&self) {
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers.into_iter().filter_map(|weak| weak.upgrade()) {
            consumer.producer_closed();
        }
    }
}

impl MediaProducer for MockProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn on_transport_close(&self, handler: CloseHandler) {
        *self.transport_close.lock() = Some(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.lock().push(format!("close:producer:{}", self.id));
        if let Some(router) = self.router.upgrade() {
            router.unregister_producer(&self.id);
        }
        self.invalidate_consumers();
    }
}

pub struct MockConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    producer_close: Mutex<Option<CloseHandler>>,
    transport_close: Mutex<Option<CloseHandler>>,
    log: EventLog,
}

impl MockConsumer {
    /// The referenced producer closed; the consumer is already invalid
    /// engine-side, so only the observer fires.
    fn producer_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.lock().push(format!("close:consumer:{}", self.id));
        if let Some(handler) = self.producer_close.lock().take() {
            handler();
        }
    }

    fn close_from_transport(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.lock().push(format!("close:consumer:{}", self.id));
        if let Some(handler) = self.transport_close.lock().take() {
            handler();
        }
    }
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn params(&self) -> Value {
        json!({
            "consumerId": self.id,
            "producerId": self.producer_id,
            "kind": self.kind,
        })
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Engine("consumer closed".to_string()));
        }
        self.paused.store(false, Ordering::Release);
        self.log.lock().push(format!("resume:consumer:{}", self.id));
        Ok(())
    }

    fn on_producer_close(&self, handler: CloseHandler) {
        *self.producer_close.lock() = Some(handler);
    }

    fn on_transport_close(&self, handler: CloseHandler) {
        *self.transport_close.lock() = Some(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.lock().push(format!("close:consumer:{}", self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            log_level: "warn".to_string(),
        }
    }

    #[tokio::test]
    async fn test_consumer_starts_paused_and_resumes() {
        let engine = MockMediaEngine::new();
        let worker = engine.create_worker(settings()).await.expect("worker");
        let router = worker.create_router(json!({})).await.expect("router");
        let send = router
            .create_transport(TransportDirection::Send)
            .await
            .expect("send transport");
        let recv = router
            .create_transport(TransportDirection::Recv)
            .await
            .expect("recv transport");

        let producer = send.produce(MediaKind::Audio, json!({})).await.expect("produce");
        let consumer = recv.consume(&producer.id(), json!({})).await.expect("consume");

        assert!(consumer.is_paused());
        consumer.resume().await.expect("resume");
        assert!(!consumer.is_paused());
    }

    #[tokio::test]
    async fn test_capability_mismatch_rejected() {
        let engine = MockMediaEngine::new();
        let worker = engine.create_worker(settings()).await.expect("worker");
        let router = worker.create_router(json!({})).await.expect("router");
        let send = router
            .create_transport(TransportDirection::Send)
            .await
            .expect("send transport");
        let recv = router
            .create_transport(TransportDirection::Recv)
            .await
            .expect("recv transport");

        let producer = send.produce(MediaKind::Video, json!({})).await.expect("produce");
        assert!(!router.can_consume(&producer.id(), &json!({"deny": true})));

        let result = recv.consume(&producer.id(), json!({"deny": true})).await;
        assert!(matches!(result, Err(Error::CannotConsume(_))));
    }

    #[tokio::test]
    async fn test_producer_close_fires_consumer_observer_once() {
        let engine = MockMediaEngine::new();
        let worker = engine.create_worker(settings()).await.expect("worker");
        let router = worker.create_router(json!({})).await.expect("router");
        let send = router
            .create_transport(TransportDirection::Send)
            .await
            .expect("send transport");
        let recv = router
            .create_transport(TransportDirection::Recv)
            .await
            .expect("recv transport");

        let producer = send.produce(MediaKind::Audio, json!({})).await.expect("produce");
        let consumer = recv.consume(&producer.id(), json!({})).await.expect("consume");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        consumer.on_producer_close(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::AcqRel);
        }));

        producer.close();
        producer.close();
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(!router.can_consume(&producer.id(), &json!({})));
    }

    #[tokio::test]
    async fn test_trigger_close_fires_transport_observer_then_tears_down() {
        let engine = MockMediaEngine::new();
        let worker = engine.create_worker(settings()).await.expect("worker");
        let router = worker.create_router(json!({})).await.expect("router");
        let transport = router
            .create_transport(TransportDirection::Send)
            .await
            .expect("transport");
        let concrete = engine.routers()[0]
            .transports()
            .pop()
            .expect("concrete transport handle");

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        transport.on_close(Box::new(move || {
            observed.fetch_add(1, Ordering::AcqRel);
        }));

        concrete.trigger_close();
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(transport.connect(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let engine = MockMediaEngine::new();
        let worker = engine.create_worker(settings()).await.expect("worker");
        let router = worker.create_router(json!({})).await.expect("router");
        let send = router
            .create_transport(TransportDirection::Send)
            .await
            .expect("send transport");
        let recv = router
            .create_transport(TransportDirection::Recv)
            .await
            .expect("recv transport");

        let producer = send.produce(MediaKind::Audio, json!({})).await.expect("produce");
        let consumer = recv.consume(&producer.id(), json!({})).await.expect("consume");

        let producer_gone = Arc::new(AtomicUsize::new(0));
        let gone = Arc::clone(&producer_gone);
        consumer.on_producer_close(Box::new(move || {
            gone.fetch_add(1, Ordering::AcqRel);
        }));

        send.close();
        // Producer died with its transport, so the consumer observer fired.
        assert_eq!(producer_gone.load(Ordering::Acquire), 1);
        assert!(!router.can_consume(&producer.id(), &json!({})));
    }

    #[tokio::test]
    async fn test_worker_kill_fires_death_observer() {
        let engine = MockMediaEngine::new();
        let worker = engine.create_worker(settings()).await.expect("worker");
        let died_pid = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&died_pid);
        worker.on_died(Box::new(move |pid| {
            observed.store(pid as usize, Ordering::Release);
        }));

        let workers = engine.workers();
        workers[0].kill();
        assert_eq!(died_pid.load(Ordering::Acquire) as u32, worker.pid());
        assert!(!worker.is_alive());

        let result = worker.create_router(json!({})).await;
        assert!(matches!(result, Err(Error::WorkerDied(_))));
    }
}
