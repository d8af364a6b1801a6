//! 엔진: 이벤트 큐와 단일 소비자 태스크
//!
//! BLE 콜백과 틱 태스크는 모두 생산자다. 레지스트리와 링크는 엔진 태스크에서만
//! 변경된다. 콜백 컨텍스트에서는 `EngineHandle`의 `try_send` 기반 메서드를 쓴다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, GattError, Result};
use crate::registry::{Registry, RegistrySnapshot};
use crate::transport::{
    CharacteristicHandle, ConnectionId, GattClient, ServiceInstance, SessionHandler,
};

/// 엔진 이벤트
#[derive(Debug)]
pub enum Event {
    ServiceDiscovered {
        connection: ConnectionId,
        service: ServiceInstance,
    },
    ServicesInvalidated {
        connection: ConnectionId,
    },
    DiscoveryComplete {
        connection: ConnectionId,
    },
    ReadResponse {
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        result: std::result::Result<Bytes, GattError>,
    },
    SubscribeResponse {
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        result: std::result::Result<(), GattError>,
    },
    Notification {
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        value: Bytes,
    },
    BufferEmpty {
        connection: ConnectionId,
    },
    Disconnected {
        connection: ConnectionId,
    },
    /// 세션에 보낼 데이터가 생김
    SendNext {
        uuid: Uuid,
    },
    /// 세션 요청으로 링크 종료
    CloseSession {
        uuid: Uuid,
    },
    Tick,
    Shutdown,
}

/// 엔진과 핸들이 공유하는 상태
struct Shared {
    running: AtomicBool,
    snapshot: RwLock<RegistrySnapshot>,
}

/// 엔진 쪽 큐 끝
pub struct EventReceiver {
    event_rx: mpsc::Receiver<Event>,
    tick_tx: mpsc::WeakSender<Event>,
    shared: Arc<Shared>,
}

/// 이벤트 큐 생성
pub fn channel(config: &Config) -> (EngineHandle, EventReceiver) {
    let (event_tx, event_rx) = mpsc::channel(config.event_queue_size.max(1));
    let shared = Arc::new(Shared {
        running: AtomicBool::new(true),
        snapshot: RwLock::new(RegistrySnapshot::default()),
    });

    let receiver = EventReceiver {
        event_rx,
        tick_tx: event_tx.downgrade(),
        shared: shared.clone(),
    };
    (EngineHandle { event_tx, shared }, receiver)
}

/// 엔진 핸들 (외부에서 제어용)
#[derive(Clone)]
pub struct EngineHandle {
    event_tx: mpsc::Sender<Event>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// 블로킹 없이 이벤트 제출
    pub fn try_submit(&self, event: Event) -> Result<()> {
        self.event_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => Error::ChannelFull,
            TrySendError::Closed(_) => Error::ChannelClosed,
        })
    }

    /// 큐에 자리가 날 때까지 기다려 제출
    pub async fn submit(&self, event: Event) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn service_discovered(
        &self,
        connection: ConnectionId,
        service: ServiceInstance,
    ) -> Result<()> {
        self.try_submit(Event::ServiceDiscovered {
            connection,
            service,
        })
    }

    pub fn services_invalidated(&self, connection: ConnectionId) -> Result<()> {
        self.try_submit(Event::ServicesInvalidated { connection })
    }

    pub fn discovery_complete(&self, connection: ConnectionId) -> Result<()> {
        self.try_submit(Event::DiscoveryComplete { connection })
    }

    pub fn read_response(
        &self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        result: std::result::Result<Bytes, GattError>,
    ) -> Result<()> {
        self.try_submit(Event::ReadResponse {
            connection,
            characteristic,
            result,
        })
    }

    pub fn subscribe_response(
        &self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        result: std::result::Result<(), GattError>,
    ) -> Result<()> {
        self.try_submit(Event::SubscribeResponse {
            connection,
            characteristic,
            result,
        })
    }

    pub fn notification(
        &self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        value: Bytes,
    ) -> Result<()> {
        self.try_submit(Event::Notification {
            connection,
            characteristic,
            value,
        })
    }

    pub fn buffer_empty(&self, connection: ConnectionId) -> Result<()> {
        self.try_submit(Event::BufferEmpty { connection })
    }

    pub fn disconnected(&self, connection: ConnectionId) -> Result<()> {
        self.try_submit(Event::Disconnected { connection })
    }

    pub fn send_next(&self, uuid: Uuid) -> Result<()> {
        self.try_submit(Event::SendNext { uuid })
    }

    pub fn close(&self, uuid: Uuid) -> Result<()> {
        self.try_submit(Event::CloseSession { uuid })
    }

    /// 정지
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(Event::Shutdown).await;
    }

    /// 마지막으로 처리된 이벤트 기준
    pub fn has_client_for_uuid(&self, uuid: Uuid) -> bool {
        self.shared.snapshot.read().has_client_for_uuid(&uuid)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.shared.snapshot.read().clone()
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// 엔진
pub struct Engine<G, S> {
    config: Arc<Config>,
    registry: Registry,
    gatt: G,
    session: S,
    events: EventReceiver,
}

impl<G, S> Engine<G, S>
where
    G: GattClient + Send + 'static,
    S: SessionHandler + Send + 'static,
{
    /// 설정을 검증하고 엔진 생성
    pub fn new(config: Config, gatt: G, session: S, events: EventReceiver) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Self {
            registry: Registry::new(config.clone()),
            config,
            gatt,
            session,
            events,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 이벤트 하나 처리. `Shutdown`이면 `false`
    pub fn handle_event(&mut self, event: Event) -> bool {
        let gatt = &mut self.gatt;
        let session = &mut self.session;

        match event {
            Event::ServiceDiscovered {
                connection,
                service,
            } => self
                .registry
                .on_service_discovered(connection, service, gatt),
            Event::ServicesInvalidated { connection } => {
                self.registry.on_services_invalidated(connection, session)
            }
            Event::DiscoveryComplete { connection } => {
                self.registry.on_discovery_complete(connection, session)
            }
            Event::ReadResponse {
                connection,
                characteristic,
                result,
            } => self
                .registry
                .on_read_response(connection, characteristic, result, gatt),
            Event::SubscribeResponse {
                connection,
                characteristic,
                result,
            } => self.registry.on_subscribe_response(
                connection,
                characteristic,
                result,
                gatt,
                session,
            ),
            Event::Notification {
                connection,
                characteristic,
                value,
            } => self
                .registry
                .on_notification(connection, characteristic, &value, gatt, session),
            Event::BufferEmpty { connection } => {
                self.registry.on_buffer_empty(connection, gatt, session)
            }
            Event::Disconnected { connection } => {
                self.registry.on_disconnected(connection, session)
            }
            Event::SendNext { uuid } => self.registry.send_next(uuid, gatt, session),
            Event::CloseSession { uuid } => self.registry.close(uuid, gatt),
            Event::Tick => self.registry.on_tick(gatt, session),
            Event::Shutdown => return false,
        }

        *self.events.shared.snapshot.write() = self.registry.snapshot();
        true
    }

    /// 소비자 루프. 종료되면 드라이버와 세션을 돌려준다
    pub async fn run(mut self) -> (G, S) {
        info!(
            "PPoGATT engine started (v{}..=v{}, tick {}ms)",
            self.config.min_version, self.config.max_version, self.config.tick_interval_ms
        );

        while let Some(event) = self.events.event_rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }

        self.events.shared.running.store(false, Ordering::SeqCst);
        info!("PPoGATT engine stopped ({} links)", self.registry.len());
        (self.gatt, self.session)
    }

    /// 소비자 태스크와 틱 태스크 시작
    pub fn spawn(self) -> JoinHandle<(G, S)> {
        let tick_tx = self.events.tick_tx.clone();
        let shared = self.events.shared.clone();
        let period = self.config.tick_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            while shared.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let Some(tx) = tick_tx.upgrade() else {
                    break;
                };
                match tx.try_send(Event::Tick) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("이벤트 큐 가득 참, 틱 건너뜀"),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });

        tokio::spawn(self.run())
    }
}
