//! 링크 레지스트리 / 멀티플렉서
//!
//! GATT 이벤트를 (연결, characteristic) 기준으로 링크에 분배하고, 상위 세션
//! 요청을 UUID 기준으로 찾는다. Closed가 된 링크는 매 연산 후 제거한다.
//! 모르는 핸들이나 연결에 대한 이벤트는 무시한다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::GattError;
use crate::link::{Link, LinkId, LinkState};
use crate::meta::Destination;
use crate::stats::LinkStats;
use crate::transport::{
    CharacteristicHandle, ConnectionId, GattClient, ServiceInstance, SessionHandler,
};

/// 링크 하나의 요약
#[derive(Debug, Clone)]
pub struct LinkSummary {
    pub id: LinkId,
    pub connection: ConnectionId,
    pub uuid: Uuid,
    pub destination: Option<Destination>,
    pub state: LinkState,
    pub version: u8,
    pub tx_window: u8,
    pub rx_window: u8,
    pub stats: LinkStats,
}

/// 레지스트리 스냅샷 (엔진 밖에서 읽기용)
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub links: Vec<LinkSummary>,
}

impl RegistrySnapshot {
    pub fn get(&self, uuid: &Uuid) -> Option<&LinkSummary> {
        self.links.iter().find(|link| link.uuid == *uuid)
    }

    pub fn has_client_for_uuid(&self, uuid: &Uuid) -> bool {
        self.get(uuid).is_some()
    }
}

/// 링크 레지스트리
pub struct Registry {
    config: Arc<Config>,
    links: HashMap<LinkId, Link>,
    next_id: u32,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            links: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    /// 서비스 인스턴스 발견
    ///
    /// 무효화된 같은 인스턴스가 있으면 그 링크를 재사용한다. 인스턴스 id가
    /// 바뀐 경우는 Meta를 읽은 뒤 UUID로 이전 링크를 찾는다.
    pub fn on_service_discovered(
        &mut self,
        connection: ConnectionId,
        service: ServiceInstance,
        gatt: &mut dyn GattClient,
    ) {
        let existing = self
            .links
            .values_mut()
            .find(|link| link.connection() == connection && link.service().id == service.id);

        match existing {
            Some(link) if link.state() == LinkState::Invalidated => {
                link.reconcile(service, gatt);
            }
            Some(link) => {
                debug!("{} {} 이미 있는 서비스 인스턴스, 무시", connection, link.id());
            }
            None => {
                let id = LinkId(self.next_id);
                self.next_id = self.next_id.wrapping_add(1);

                info!(
                    "{} {} 서비스 발견: meta={:?}, data={:?}",
                    connection, id, service.meta, service.data
                );
                let mut link = Link::new(id, connection, service, self.config.clone());
                link.start(gatt);
                self.links.insert(id, link);
            }
        }
        self.sweep();
    }

    /// 연결의 characteristic이 무효화됨 (재탐색 시작)
    pub fn on_services_invalidated(
        &mut self,
        connection: ConnectionId,
        session: &mut dyn SessionHandler,
    ) {
        for link in self.links_on(connection) {
            link.invalidate(session);
        }
    }

    /// 재탐색 종료. 복구되지 않은 링크는 해제
    pub fn on_discovery_complete(
        &mut self,
        connection: ConnectionId,
        session: &mut dyn SessionHandler,
    ) {
        for link in self.links_on(connection) {
            if link.state() == LinkState::Invalidated {
                link.tear_down(session);
            }
        }
        self.sweep();
    }

    pub fn on_read_response(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        result: Result<Bytes, GattError>,
        gatt: &mut dyn GattClient,
    ) {
        let Some(id) = self.find_by_handle(connection, characteristic) else {
            debug!("{} 모르는 characteristic {:?} 읽기 응답", connection, characteristic);
            return;
        };

        // 무효화된 링크의 UUID는 재탐색으로 다시 나타날 수 있다
        let taken: HashSet<Uuid> = self
            .links
            .values()
            .filter(|link| link.id() != id && link.state() != LinkState::Invalidated)
            .filter_map(Link::uuid)
            .collect();

        if let Some(link) = self.links.get_mut(&id) {
            link.on_meta_read(result, &|uuid| taken.contains(&uuid), gatt);
        }
        self.replace_invalidated(connection, id);
        self.sweep();
    }

    pub fn on_subscribe_response(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        result: Result<(), GattError>,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        if let Some(link) = self.by_handle_mut(connection, characteristic) {
            link.on_subscribe_response(result, gatt, session);
        }
        self.sweep();
    }

    pub fn on_notification(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        value: &[u8],
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        match self.by_handle_mut(connection, characteristic) {
            Some(link) => link.on_notification(value, gatt, session),
            None => debug!("{} 모르는 characteristic {:?} notification", connection, characteristic),
        }
        self.sweep();
    }

    pub fn on_buffer_empty(
        &mut self,
        connection: ConnectionId,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        for link in self.links_on(connection) {
            link.on_buffer_empty(gatt, session);
        }
        self.sweep();
    }

    /// 연결 끊김: 해당 연결의 링크 전부 해제
    pub fn on_disconnected(&mut self, connection: ConnectionId, session: &mut dyn SessionHandler) {
        for link in self.links_on(connection) {
            link.tear_down(session);
        }
        self.sweep();
    }

    /// 모든 링크에 틱 전달
    pub fn on_tick(&mut self, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        for link in self.links.values_mut() {
            link.on_tick(gatt, session);
        }
        self.sweep();
    }

    /// 세션에 보낼 데이터가 생김
    pub fn send_next(
        &mut self,
        uuid: Uuid,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        match self.by_uuid_mut(uuid) {
            Some(link) => link.send_next(gatt, session),
            None => debug!("UUID {} 링크 없음, send_next 무시", uuid),
        }
        self.sweep();
    }

    /// 세션 요청으로 링크 종료. 세션에는 close를 알리지 않는다
    pub fn close(&mut self, uuid: Uuid, gatt: &mut dyn GattClient) {
        if let Some(link) = self.by_uuid_mut(uuid) {
            link.close(gatt);
        }
        self.sweep();
    }

    pub fn has_client_for_uuid(&self, uuid: Uuid) -> bool {
        self.by_uuid(uuid).is_some()
    }

    pub fn state_for_uuid(&self, uuid: Uuid) -> Option<LinkState> {
        self.by_uuid(uuid).map(Link::state)
    }

    pub fn stats_for_uuid(&self, uuid: Uuid) -> Option<&LinkStats> {
        self.by_uuid(uuid).map(Link::stats)
    }

    /// UUID가 정해진 링크의 요약
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut links: Vec<LinkSummary> = self
            .links
            .values()
            .filter_map(|link| {
                Some(LinkSummary {
                    id: link.id(),
                    connection: link.connection(),
                    uuid: link.uuid()?,
                    destination: link.destination(),
                    state: link.state(),
                    version: link.version(),
                    tx_window: link.tx_window(),
                    rx_window: link.rx_window(),
                    stats: link.stats().clone(),
                })
            })
            .collect();
        links.sort_by_key(|link| link.id);
        RegistrySnapshot { links }
    }

    fn links_on(&mut self, connection: ConnectionId) -> impl Iterator<Item = &mut Link> + '_ {
        self.links
            .values_mut()
            .filter(move |link| link.connection() == connection)
    }

    fn find_by_handle(
        &self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Option<LinkId> {
        self.links
            .values()
            .find(|link| link.connection() == connection && link.owns(characteristic))
            .map(Link::id)
    }

    fn by_handle_mut(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Option<&mut Link> {
        self.links
            .values_mut()
            .find(|link| link.connection() == connection && link.owns(characteristic))
    }

    fn by_uuid(&self, uuid: Uuid) -> Option<&Link> {
        self.links.values().find(|link| link.uuid() == Some(uuid))
    }

    fn by_uuid_mut(&mut self, uuid: Uuid) -> Option<&mut Link> {
        self.links.values_mut().find(|link| link.uuid() == Some(uuid))
    }

    /// 재탐색에서 인스턴스 id가 바뀐 서비스가 같은 UUID로 나타나면
    /// 무효화된 이전 링크를 지우고 그 `LinkId`를 새 링크에 넘긴다.
    fn replace_invalidated(&mut self, connection: ConnectionId, id: LinkId) {
        let Some(uuid) = self
            .links
            .get(&id)
            .filter(|link| !link.is_closed())
            .and_then(Link::uuid)
        else {
            return;
        };

        let stale = self
            .links
            .values()
            .find(|link| {
                link.id() != id
                    && link.connection() == connection
                    && link.state() == LinkState::Invalidated
                    && link.uuid() == Some(uuid)
            })
            .map(Link::id);
        let Some(stale) = stale else {
            return;
        };

        self.links.remove(&stale);
        if let Some(mut link) = self.links.remove(&id) {
            info!("{} {} UUID {} 재탐색으로 복구", connection, stale, uuid);
            link.adopt_id(stale);
            self.links.insert(stale, link);
        }
    }

    fn sweep(&mut self) {
        self.links.retain(|id, link| {
            if link.is_closed() {
                debug!("{} 제거", id);
                false
            } else {
                true
            }
        });
    }
}
