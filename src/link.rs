//! 링크 상태 머신
//!
//! GATT 서비스 인스턴스 하나당 링크 하나.
//!
//! ```text
//! Discovered → MetaPending → SubscribePending → Resetting(Local|Remote) → Open → Closed
//!                                    ↑                                     │
//!                                    └───── 재탐색 (Invalidated) ──────────┘
//! ```
//!
//! 모든 메서드는 엔진의 단일 실행 컨텍스트에서만 호출된다.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, GattError, Result};
use crate::meta::{Destination, Meta};
use crate::packet::{Packet, ResetCompletePayload, ResetRequestPayload};
use crate::receiver::ReceiveTracker;
use crate::sender::{AckOutcome, SendWindow, TickOutcome};
use crate::seq_num::SeqNum;
use crate::stats::LinkStats;
use crate::timer::{Countdown, RetransmitClock};
use crate::transport::{
    CharacteristicHandle, ConnectionId, GattClient, ServiceInstance, SessionHandler,
};

/// 레지스트리 내 안정적인 링크 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// 리셋을 누가 시작했는지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetInitiator {
    Local,
    Remote,
}

/// 링크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Discovered,
    MetaPending,
    SubscribePending,
    Resetting(ResetInitiator),
    Open,
    /// characteristic 무효화됨, 재탐색 대기
    Invalidated,
    Closed,
}

/// 링크
pub struct Link {
    id: LinkId,
    connection: ConnectionId,
    service: ServiceInstance,
    state: LinkState,
    config: Arc<Config>,

    /// 협상된 프로토콜 버전
    version: u8,
    uuid: Option<Uuid>,
    destination: Option<Destination>,

    tx_window: u8,
    rx_window: u8,
    tx: SendWindow,
    rx: ReceiveTracker,

    reset_timer: Countdown,
    reset_request_pending: bool,
    reset_complete_pending: bool,

    /// 하위 계층이 Busy를 돌려줌. buffer-empty까지 쓰지 않는다
    blocked: bool,

    stats: LinkStats,
}

impl Link {
    pub fn new(
        id: LinkId,
        connection: ConnectionId,
        service: ServiceInstance,
        config: Arc<Config>,
    ) -> Self {
        let clock = RetransmitClock::new(config.retransmit_timeout_ticks, config.max_retries);
        Self {
            id,
            connection,
            service,
            state: LinkState::Discovered,
            version: config.min_version,
            uuid: None,
            destination: None,
            tx_window: config.v0_window,
            rx_window: config.v0_window,
            tx: SendWindow::new(config.v0_window, clock),
            rx: ReceiveTracker::new(config.v0_window, config.ack_delay_ticks),
            reset_timer: Countdown::default(),
            reset_request_pending: false,
            reset_complete_pending: false,
            blocked: false,
            stats: LinkStats::new(),
            config,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn service(&self) -> &ServiceInstance {
        &self.service
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn destination(&self) -> Option<Destination> {
        self.destination
    }

    pub fn tx_window(&self) -> u8 {
        self.tx_window
    }

    pub fn rx_window(&self) -> u8 {
        self.rx_window
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Closed
    }

    /// 이 링크의 characteristic인지
    pub fn owns(&self, characteristic: CharacteristicHandle) -> bool {
        self.service.meta == characteristic || self.service.data == characteristic
    }

    /// Discovered → MetaPending
    pub fn start(&mut self, gatt: &mut dyn GattClient) {
        match gatt.read(self.connection, self.service.meta) {
            Ok(()) => {
                debug!("{} Meta 읽기 요청", self.id);
                self.state = LinkState::MetaPending;
            }
            Err(e) => {
                warn!("{} Meta 읽기 실패: {}", self.id, e);
                self.state = LinkState::Closed;
            }
        }
    }

    /// MetaPending → SubscribePending
    ///
    /// 검증에 실패하면 재시도 없이 Closed.
    pub fn on_meta_read(
        &mut self,
        result: std::result::Result<Bytes, GattError>,
        uuid_taken: &dyn Fn(Uuid) -> bool,
        gatt: &mut dyn GattClient,
    ) {
        if self.state != LinkState::MetaPending {
            debug!("{} {:?} 상태에서 Meta 응답 무시", self.id, self.state);
            return;
        }

        let accepted = result
            .map_err(Error::from)
            .and_then(|value| self.accept_meta(&value, uuid_taken));
        if let Err(e) = accepted {
            warn!("{} Meta 거부: {}", self.id, e);
            self.state = LinkState::Closed;
            return;
        }

        match gatt.subscribe(self.connection, self.service.data) {
            Ok(()) => self.state = LinkState::SubscribePending,
            Err(e) => {
                warn!("{} Data 구독 요청 실패: {}", self.id, e);
                self.state = LinkState::Closed;
            }
        }
    }

    fn accept_meta(&mut self, value: &[u8], uuid_taken: &dyn Fn(Uuid) -> bool) -> Result<()> {
        let meta = Meta::decode(value)?;
        let version = meta.negotiate(self.config.min_version, self.config.max_version)?;
        if uuid_taken(meta.app_uuid) {
            return Err(Error::DuplicateUuid {
                uuid: meta.app_uuid,
            });
        }

        let destination = meta.destination(&self.config.system_uuid);
        info!(
            "{} Meta: uuid={}, {:?}, version {} (remote {}..={})",
            self.id, meta.app_uuid, destination, version, meta.min_version, meta.max_version
        );

        self.version = version;
        self.uuid = Some(meta.app_uuid);
        self.destination = Some(destination);
        Ok(())
    }

    /// SubscribePending → Resetting(Local), 실패 시 Closed
    pub fn on_subscribe_response(
        &mut self,
        result: std::result::Result<(), GattError>,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        if self.state != LinkState::SubscribePending {
            debug!("{} {:?} 상태에서 구독 응답 무시", self.id, self.state);
            return;
        }

        match result {
            Ok(()) => self.begin_reset(ResetInitiator::Local, gatt, session),
            Err(e) => {
                warn!("{} Data 구독 실패: {}", self.id, e);
                self.state = LinkState::Closed;
            }
        }
    }

    /// Data characteristic notification
    pub fn on_notification(
        &mut self,
        value: &[u8],
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        if !matches!(self.state, LinkState::Open | LinkState::Resetting(_)) {
            debug!("{} {:?} 상태에서 notification 무시", self.id, self.state);
            return;
        }

        let packet = match Packet::decode(value, self.version) {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(e) => {
                warn!("{} 패킷 버림: {}", self.id, e);
                self.stats.malformed_drops += 1;
                return;
            }
        };

        match packet {
            Packet::ResetRequest {
                payload: Some(_), ..
            } => {
                // 클라이언트 식별자가 실린 요청은 우리 자신의 것이 되돌아온 것
                warn!("{} 루프백 ResetRequest 버림", self.id);
                self.stats.malformed_drops += 1;
            }
            Packet::ResetRequest { payload: None, .. } => self.on_reset_request(gatt, session),
            Packet::ResetComplete { payload, .. } => self.on_reset_complete(payload, gatt, session),
            Packet::Data { sn, payload } => self.on_data(sn, payload, gatt, session),
            Packet::Ack { sn } => self.on_ack(sn, gatt, session),
        }
    }

    fn on_reset_request(&mut self, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        match self.state {
            LinkState::Resetting(initiator) => {
                debug!("{} 리셋 진행 중({:?}), ResetRequest 무시", self.id, initiator);
            }
            _ => self.begin_reset(ResetInitiator::Remote, gatt, session),
        }
    }

    fn on_reset_complete(
        &mut self,
        payload: ResetCompletePayload,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        let initiator = match self.state {
            LinkState::Resetting(initiator) => initiator,
            state => {
                debug!("{} {:?} 상태에서 ResetComplete 무시", self.id, state);
                return;
            }
        };
        if initiator == ResetInitiator::Local && self.reset_request_pending {
            // 아직 ResetRequest를 쓰지도 못했음. 이전 핸드쉐이크의 잔재
            debug!("{} 보내지 않은 요청에 대한 ResetComplete 무시", self.id);
            return;
        }

        let (rx_window, tx_window) = match payload {
            ResetCompletePayload::V0 => (self.config.v0_window, self.config.v0_window),
            ResetCompletePayload::V1 {
                rx_window: remote_rx,
                tx_window: remote_tx,
            } => (
                self.config.desired_rx_window.min(remote_tx).max(1),
                self.config.desired_tx_window.min(remote_rx).max(1),
            ),
        };
        self.rx_window = rx_window;
        self.tx_window = tx_window;
        self.rx.set_window(rx_window);
        self.tx.set_capacity(tx_window);

        if initiator == ResetInitiator::Local {
            self.reset_complete_pending = true;
        }
        self.reset_timer.cancel();
        self.state = LinkState::Open;
        self.stats.opens += 1;

        info!(
            "{} Open: v{}, tx_window={}, rx_window={} ({:?} reset)",
            self.id, self.version, tx_window, rx_window, initiator
        );
        if let (Some(uuid), Some(destination)) = (self.uuid, self.destination) {
            session.open(uuid, destination);
        }

        self.pump(gatt, session);
    }

    fn on_data(
        &mut self,
        sn: SeqNum,
        payload: Bytes,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        if self.state != LinkState::Open {
            debug!("{} 리셋 중 Data {} 버림", self.id, sn);
            return;
        }

        if !self.rx.on_data(sn) {
            debug!("{} 순서 밖 Data {} (기대 {}) 버림", self.id, sn, self.rx.expected());
            self.stats.out_of_order_drops += 1;
            return;
        }

        self.stats.data_packets_received += 1;
        self.stats.bytes_received += payload.len() as u64;
        if let Some(uuid) = self.uuid {
            if !payload.is_empty() {
                session.deliver_bytes(uuid, &payload);
            }
        }

        if self.rx.due_ack().is_some() {
            self.flush(gatt);
        }
    }

    fn on_ack(&mut self, sn: SeqNum, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        if self.state != LinkState::Open {
            debug!("{} 리셋 중 Ack {} 버림", self.id, sn);
            return;
        }

        match self.tx.handle_ack(sn) {
            AckOutcome::Acked(_) => {
                self.stats.acks_received += 1;
                self.pump(gatt, session);
            }
            AckOutcome::Duplicate => {
                debug!("{} 중복 Ack {}", self.id, sn);
                self.stats.duplicate_acks += 1;
            }
            AckOutcome::OutOfWindow => {
                warn!("{} 윈도우 밖 Ack {}, 리셋", self.id, sn);
                self.begin_reset(ResetInitiator::Local, gatt, session);
            }
        }
    }

    /// 주기 틱: 리셋 타임아웃, 재전송, ACK 지연
    pub fn on_tick(&mut self, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        match self.state {
            LinkState::Resetting(_) => {
                if self.reset_timer.tick() {
                    warn!("{} ResetComplete 타임아웃, 리셋 재시도", self.id);
                    self.begin_reset(ResetInitiator::Local, gatt, session);
                }
            }
            LinkState::Open => {
                match self.tx.on_tick() {
                    TickOutcome::Exhausted(sn) => {
                        warn!(
                            "{} Data {} 재전송 {}회 실패, 리셋",
                            self.id,
                            sn,
                            self.tx.max_retries()
                        );
                        self.begin_reset(ResetInitiator::Local, gatt, session);
                        return;
                    }
                    TickOutcome::Retransmit(count) => {
                        debug!("{} {} 패킷 재전송 예정", self.id, count);
                    }
                    TickOutcome::Idle => {}
                }
                self.rx.on_ack_timeout_tick();
                self.pump(gatt, session);
            }
            _ => {}
        }
    }

    /// 하위 계층 송신 버퍼가 비었음
    pub fn on_buffer_empty(&mut self, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        if self.blocked {
            debug!("{} 송신 버퍼 비움, 재개", self.id);
        }
        self.blocked = false;
        self.pump(gatt, session);
    }

    /// 상위 세션에 보낼 데이터가 생김
    pub fn send_next(&mut self, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        self.pump(gatt, session);
    }

    /// 명시적 종료 (상위 세션 요청)
    pub fn close(&mut self, gatt: &mut dyn GattClient) {
        if matches!(
            self.state,
            LinkState::SubscribePending | LinkState::Resetting(_) | LinkState::Open
        ) {
            if let Err(e) = gatt.unsubscribe(self.connection, self.service.data) {
                debug!("{} 구독 해제 실패: {}", self.id, e);
            }
        }
        info!("{} 종료", self.id);
        self.state = LinkState::Closed;
    }

    /// characteristic 무효화 (서비스 재탐색 시작)
    pub fn invalidate(&mut self, session: &mut dyn SessionHandler) {
        self.leave_open(session);
        self.clear_transfer_state();
        self.state = LinkState::Invalidated;
        debug!("{} 무효화됨", self.id);
    }

    /// 같은 인스턴스가 다시 발견됨: 새 핸들로 처음부터 다시
    pub fn reconcile(&mut self, service: ServiceInstance, gatt: &mut dyn GattClient) {
        info!("{} 재탐색으로 복구", self.id);
        self.service = service;
        self.state = LinkState::Discovered;
        self.start(gatt);
    }

    /// 재탐색으로 대체한 이전 링크의 식별자를 이어받음
    pub(crate) fn adopt_id(&mut self, id: LinkId) {
        debug!("{} -> {}", self.id, id);
        self.id = id;
    }

    /// 연결 끊김 또는 복구 실패
    pub fn tear_down(&mut self, session: &mut dyn SessionHandler) {
        self.leave_open(session);
        self.clear_transfer_state();
        info!("{} 해제", self.id);
        self.state = LinkState::Closed;
    }

    fn leave_open(&mut self, session: &mut dyn SessionHandler) {
        if self.state == LinkState::Open {
            if let Some(uuid) = self.uuid {
                session.close(uuid);
            }
        }
    }

    fn clear_transfer_state(&mut self) {
        self.tx.reset(self.tx_window);
        self.rx.reset(self.rx_window);
        self.reset_timer.cancel();
        self.reset_request_pending = false;
        self.reset_complete_pending = false;
        self.blocked = false;
    }

    fn begin_reset(
        &mut self,
        initiator: ResetInitiator,
        gatt: &mut dyn GattClient,
        session: &mut dyn SessionHandler,
    ) {
        self.leave_open(session);

        let (rx_window, tx_window) = if self.version == 0 {
            (self.config.v0_window, self.config.v0_window)
        } else {
            (self.config.desired_rx_window, self.config.desired_tx_window)
        };
        self.rx_window = rx_window;
        self.tx_window = tx_window;
        self.tx.reset(tx_window);
        self.rx.reset(rx_window);

        match initiator {
            ResetInitiator::Local => {
                self.reset_request_pending = true;
                self.reset_complete_pending = false;
                self.stats.local_resets += 1;
            }
            ResetInitiator::Remote => {
                self.reset_request_pending = false;
                self.reset_complete_pending = true;
                self.stats.remote_resets += 1;
            }
        }
        self.state = LinkState::Resetting(initiator);
        self.reset_timer.arm(self.config.reset_timeout_ticks);

        info!("{} 리셋 시작 ({:?})", self.id, initiator);
        self.flush(gatt);
    }

    /// 세션에서 데이터를 당겨와 분할하고 쓴다
    fn pump(&mut self, gatt: &mut dyn GattClient, session: &mut dyn SessionHandler) {
        if self.state == LinkState::Open {
            match self.config.max_payload(gatt.mtu(self.connection)) {
                Some(max_payload) => {
                    self.refill(max_payload, session);
                    self.tx.fragment(max_payload);
                }
                None => debug!("{} MTU 없음, 분할 보류", self.id),
            }
        }
        self.flush(gatt);
    }

    fn refill(&mut self, max_payload: usize, session: &mut dyn SessionHandler) {
        let Some(uuid) = self.uuid else {
            return;
        };

        loop {
            let wanted = (self.tx.free_slots() * max_payload).saturating_sub(self.tx.pending_len());
            if wanted == 0 {
                break;
            }
            match session.drain_next_bytes(uuid, wanted) {
                Some(bytes) if !bytes.is_empty() => self.tx.enqueue(&bytes),
                _ => break,
            }
        }
    }

    /// 대기 중인 패킷을 우선순위대로 쓴다: 리셋 > ACK > Data
    fn flush(&mut self, gatt: &mut dyn GattClient) {
        if self.blocked {
            return;
        }

        while let Some(packet) = self.next_packet() {
            match gatt.write(self.connection, self.service.data, &packet.encode(), false) {
                Ok(()) => self.packet_written(&packet),
                Err(GattError::Busy) => {
                    debug!("{} 송신 버퍼 가득 참, {:?} 보류", self.id, packet.packet_type());
                    self.blocked = true;
                    self.stats.busy_writes += 1;
                    break;
                }
                Err(e) => {
                    warn!("{} 쓰기 실패: {}", self.id, e);
                    break;
                }
            }
        }
    }

    fn next_packet(&self) -> Option<Packet> {
        if self.reset_request_pending {
            return Some(Packet::ResetRequest {
                sn: SeqNum::ZERO,
                payload: Some(ResetRequestPayload {
                    version: self.version,
                    client_id: self.config.client_id,
                }),
            });
        }
        if self.reset_complete_pending {
            let payload = if self.version == 0 {
                ResetCompletePayload::V0
            } else {
                ResetCompletePayload::V1 {
                    rx_window: self.rx_window,
                    tx_window: self.tx_window,
                }
            };
            return Some(Packet::ResetComplete {
                sn: SeqNum::ZERO,
                payload,
            });
        }
        if self.state != LinkState::Open {
            return None;
        }
        if let Some(sn) = self.rx.due_ack() {
            return Some(Packet::Ack { sn });
        }
        self.tx.next_unsent().map(|(sn, payload)| Packet::Data {
            sn,
            payload: payload.clone(),
        })
    }

    fn packet_written(&mut self, packet: &Packet) {
        match packet {
            Packet::ResetRequest { .. } => self.reset_request_pending = false,
            Packet::ResetComplete { .. } => self.reset_complete_pending = false,
            Packet::Ack { .. } => {
                self.rx.ack_sent();
                self.stats.acks_sent += 1;
            }
            Packet::Data { sn, payload } => {
                self.stats.data_packets_sent += 1;
                if self.tx.mark_sent(*sn) {
                    self.stats.retransmitted_packets += 1;
                } else {
                    self.stats.bytes_sent += payload.len() as u64;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        meta_bytes, MockGatt, RecordingSession, RemotePeer, SessionEvent, APP_UUID, CONN, SERVICE,
    };
    use crate::meta::SessionType;

    fn test_config() -> Config {
        Config {
            retransmit_timeout_ticks: 2,
            max_retries: 3,
            ack_delay_ticks: 1,
            reset_timeout_ticks: 50,
            ..Config::default()
        }
        .with_serial("Q402445E00AB")
    }

    fn new_link(config: Config) -> Link {
        Link::new(LinkId(1), CONN, SERVICE, Arc::new(config))
    }

    /// Meta 읽기와 구독까지 진행 (ResetRequest가 쓰인 상태)
    fn subscribed_link(config: Config) -> (Link, MockGatt, RecordingSession) {
        let mut link = new_link(config);
        let mut gatt = MockGatt::new(158);
        let mut session = RecordingSession::default();

        link.start(&mut gatt);
        link.on_meta_read(
            Ok(meta_bytes(APP_UUID, 0, 1, SessionType::InferredFromUuid).into()),
            &|_| false,
            &mut gatt,
        );
        link.on_subscribe_response(Ok(()), &mut gatt, &mut session);
        (link, gatt, session)
    }

    fn open_link(config: Config) -> (Link, MockGatt, RecordingSession) {
        let (mut link, mut gatt, mut session) = subscribed_link(config);
        let complete = Packet::ResetComplete {
            sn: SeqNum::ZERO,
            payload: ResetCompletePayload::V1 {
                rx_window: 25,
                tx_window: 25,
            },
        };
        link.on_notification(&complete.encode(), &mut gatt, &mut session);
        assert!(link.is_open());
        gatt.writes.clear();
        session.events.clear();
        (link, gatt, session)
    }

    fn notify(link: &mut Link, gatt: &mut MockGatt, session: &mut RecordingSession, packet: Packet) {
        link.on_notification(&packet.encode(), gatt, session);
    }

    #[test]
    fn test_handshake_pins_minimum_windows() {
        let (mut link, mut gatt, mut session) = subscribed_link(test_config());
        assert_eq!(gatt.reads, vec![(CONN, SERVICE.meta)]);
        assert_eq!(gatt.subscribes, vec![(CONN, SERVICE.data)]);
        assert_eq!(link.state(), LinkState::Resetting(ResetInitiator::Local));
        assert_eq!(
            gatt.take_packets(1),
            vec![Packet::ResetRequest {
                sn: SeqNum::ZERO,
                payload: Some(ResetRequestPayload {
                    version: 1,
                    client_id: *b"Q402445E00AB"
                }),
            }]
        );

        notify(
            &mut link,
            &mut gatt,
            &mut session,
            Packet::ResetComplete {
                sn: SeqNum::ZERO,
                payload: ResetCompletePayload::V1 {
                    rx_window: 20,
                    tx_window: 10,
                },
            },
        );

        assert!(link.is_open());
        assert_eq!(link.tx_window(), 20);
        assert_eq!(link.rx_window(), 10);
        assert_eq!(
            gatt.take_packets(1),
            vec![Packet::ResetComplete {
                sn: SeqNum::ZERO,
                payload: ResetCompletePayload::V1 {
                    rx_window: 10,
                    tx_window: 20
                },
            }]
        );
        assert_eq!(
            session.events,
            vec![SessionEvent::Open(APP_UUID, Destination::App)]
        );
    }

    #[test]
    fn test_v0_uses_fixed_window() {
        let config = Config {
            max_version: 0,
            ..test_config()
        };
        let (mut link, mut gatt, mut session) = subscribed_link(config);
        assert_eq!(link.version(), 0);
        gatt.take_packets(0);

        link.on_notification(&[0x03], &mut gatt, &mut session);
        assert!(link.is_open());
        assert_eq!(link.tx_window(), 4);
        assert_eq!(
            gatt.take_packets(0),
            vec![Packet::ResetComplete {
                sn: SeqNum::ZERO,
                payload: ResetCompletePayload::V0
            }]
        );
    }

    #[test]
    fn test_convergence_client_first() {
        let (mut link, mut gatt, mut session) = subscribed_link(test_config());
        let mut peer = RemotePeer::new(1, 16, 8);

        peer.exchange(&mut link, &mut gatt, &mut session);

        assert!(link.is_open());
        assert_eq!(peer.opens, 1);
        assert_eq!(session.open_count(), 1);
        assert_eq!(link.tx_window(), peer.negotiated_rx);
        assert_eq!(link.rx_window(), peer.negotiated_tx);
    }

    #[test]
    fn test_convergence_remote_first() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        let mut peer = RemotePeer::new(1, 16, 8);

        let request = peer.initiate_reset();
        notify(&mut link, &mut gatt, &mut session, request);
        assert_eq!(link.state(), LinkState::Resetting(ResetInitiator::Remote));
        assert_eq!(session.events, vec![SessionEvent::Close(APP_UUID)]);

        // 중복 요청에는 응답하지 않음
        notify(&mut link, &mut gatt, &mut session, Packet::ResetRequest {
            sn: SeqNum::ZERO,
            payload: None,
        });
        assert_eq!(gatt.writes.len(), 1);

        peer.exchange(&mut link, &mut gatt, &mut session);

        assert!(link.is_open());
        assert_eq!(peer.opens, 1);
        assert_eq!(session.open_count(), 1);
        assert_eq!(link.tx_window(), peer.negotiated_rx);
        assert_eq!(link.rx_window(), peer.negotiated_tx);
    }

    #[test]
    fn test_remote_request_ignored_during_local_reset() {
        let (mut link, mut gatt, mut session) = subscribed_link(test_config());
        gatt.writes.clear();

        notify(&mut link, &mut gatt, &mut session, Packet::ResetRequest {
            sn: SeqNum::ZERO,
            payload: None,
        });
        assert!(gatt.writes.is_empty());
        assert_eq!(link.state(), LinkState::Resetting(ResetInitiator::Local));
    }

    #[test]
    fn test_reset_timeout_rearms() {
        let config = Config {
            reset_timeout_ticks: 3,
            ..test_config()
        };
        let (mut link, mut gatt, mut session) = subscribed_link(config);
        gatt.writes.clear();

        for _ in 0..3 {
            link.on_tick(&mut gatt, &mut session);
        }
        let packets = gatt.take_packets(1);
        assert_eq!(packets.len(), 1);
        assert!(matches!(packets[0], Packet::ResetRequest { payload: Some(_), .. }));
        assert_eq!(link.stats().local_resets, 2);
    }

    #[test]
    fn test_data_sent_after_open() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        session.queue(b"ping");
        link.send_next(&mut gatt, &mut session);

        assert_eq!(
            gatt.take_packets(1),
            vec![Packet::Data {
                sn: SeqNum::ZERO,
                payload: Bytes::from_static(b"ping")
            }]
        );
    }

    #[test]
    fn test_max_payload_is_single_packet() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        session.queue(&[0x5A; 154]);
        link.send_next(&mut gatt, &mut session);

        let packets = gatt.take_packets(1);
        assert_eq!(packets.len(), 1);
        assert!(matches!(&packets[0], Packet::Data { payload, .. } if payload.len() == 154));
    }

    #[test]
    fn test_zero_mtu_skips_send() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        gatt.mtu = 0;
        session.queue(b"later");
        link.send_next(&mut gatt, &mut session);
        assert!(gatt.writes.is_empty());

        gatt.mtu = 158;
        link.send_next(&mut gatt, &mut session);
        assert_eq!(gatt.take_packets(1).len(), 1);
    }

    #[test]
    fn test_idempotent_ack() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        session.queue(&[1u8; 300]);
        link.send_next(&mut gatt, &mut session);
        assert_eq!(gatt.take_packets(1).len(), 2);

        let ack = Packet::Ack { sn: SeqNum::new(1) };
        notify(&mut link, &mut gatt, &mut session, ack.clone());
        notify(&mut link, &mut gatt, &mut session, ack);

        assert!(gatt.writes.is_empty());
        assert!(link.is_open());
        assert!(session.events.is_empty());
        assert_eq!(link.stats().duplicate_acks, 1);

        // 중복 ACK 이후에도 재전송 없음
        for _ in 0..10 {
            link.on_tick(&mut gatt, &mut session);
        }
        assert!(gatt.writes.is_empty());
    }

    #[test]
    fn test_ack_out_of_window_resets() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        session.queue(b"x");
        link.send_next(&mut gatt, &mut session);
        gatt.writes.clear();

        notify(&mut link, &mut gatt, &mut session, Packet::Ack { sn: SeqNum::new(5) });

        assert_eq!(link.state(), LinkState::Resetting(ResetInitiator::Local));
        assert_eq!(session.events, vec![SessionEvent::Close(APP_UUID)]);
        assert!(matches!(
            gatt.take_packets(1).as_slice(),
            [Packet::ResetRequest { payload: Some(_), .. }]
        ));
    }

    /// 한 번 확인된 뒤에 도착한 먼 번호의 ACK는 중복이 아니라 위반
    fn assert_far_ack_resets(
        mut link: Link,
        mut gatt: MockGatt,
        mut session: RecordingSession,
        version: u8,
        far: u8,
    ) {
        session.queue(&[1u8; 300]);
        link.send_next(&mut gatt, &mut session);
        assert_eq!(gatt.take_packets(version).len(), 2);

        notify(&mut link, &mut gatt, &mut session, Packet::Ack { sn: SeqNum::ZERO });
        assert!(link.is_open());
        assert_eq!(link.stats().acks_received, 1);

        notify(&mut link, &mut gatt, &mut session, Packet::Ack { sn: SeqNum::new(far) });

        assert_eq!(link.state(), LinkState::Resetting(ResetInitiator::Local));
        assert_eq!(link.stats().duplicate_acks, 0);
        assert_eq!(session.events, vec![SessionEvent::Close(APP_UUID)]);
        assert!(matches!(
            gatt.take_packets(version).as_slice(),
            [Packet::ResetRequest { .. }]
        ));
    }

    #[test]
    fn test_far_ack_after_ack_resets_v0() {
        let config = Config {
            max_version: 0,
            ..test_config()
        };
        let (mut link, mut gatt, mut session) = subscribed_link(config);
        link.on_notification(&[0x03], &mut gatt, &mut session);
        assert!(link.is_open());
        assert_eq!(link.tx_window(), 4);
        gatt.writes.clear();
        session.events.clear();

        assert_far_ack_resets(link, gatt, session, 0, 20);
    }

    #[test]
    fn test_far_ack_after_ack_resets_v1() {
        let (link, gatt, session) = open_link(test_config());
        assert_eq!(link.tx_window(), 25);

        // base 1에서 세 칸 뒤: 확인된 건 0 하나뿐
        assert_far_ack_resets(link, gatt, session, 1, 30);
    }

    #[test]
    fn test_retry_ceiling_single_reset() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        session.queue(b"lost");
        link.send_next(&mut gatt, &mut session);

        let mut packets = gatt.take_packets(1);
        for _ in 0..20 {
            link.on_tick(&mut gatt, &mut session);
            packets.extend(gatt.take_packets(1));
        }

        let data = packets
            .iter()
            .filter(|p| matches!(p, Packet::Data { .. }))
            .count();
        let requests = packets
            .iter()
            .filter(|p| matches!(p, Packet::ResetRequest { .. }))
            .count();
        // 최초 1회 + 재전송 3회
        assert_eq!(data, 4);
        assert_eq!(requests, 1);
        assert!(matches!(packets.last(), Some(Packet::ResetRequest { .. })));
        assert_eq!(session.events, vec![SessionEvent::Close(APP_UUID)]);
    }

    #[test]
    fn test_out_of_order_data_dropped_without_ack() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        notify(&mut link, &mut gatt, &mut session, Packet::Data {
            sn: SeqNum::new(1),
            payload: Bytes::from_static(b"early"),
        });
        for _ in 0..5 {
            link.on_tick(&mut gatt, &mut session);
        }

        assert!(session.delivered.is_empty());
        assert!(gatt.writes.is_empty());
        assert_eq!(link.stats().out_of_order_drops, 1);
    }

    #[test]
    fn test_burst_acked_once_after_delay() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        for (sn, chunk) in [b"ab", b"cd", b"ef"].iter().enumerate() {
            notify(&mut link, &mut gatt, &mut session, Packet::Data {
                sn: SeqNum::new(sn as u8),
                payload: Bytes::copy_from_slice(*chunk),
            });
        }
        assert_eq!(session.delivered, b"abcdef");
        assert!(gatt.writes.is_empty());

        link.on_tick(&mut gatt, &mut session);
        assert_eq!(gatt.take_packets(1), vec![Packet::Ack { sn: SeqNum::new(2) }]);

        link.on_tick(&mut gatt, &mut session);
        assert!(gatt.writes.is_empty());
    }

    #[test]
    fn test_busy_ack_superseded_by_remote_reset() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        notify(&mut link, &mut gatt, &mut session, Packet::Data {
            sn: SeqNum::ZERO,
            payload: Bytes::from_static(b"a"),
        });

        gatt.busy = true;
        link.on_tick(&mut gatt, &mut session);
        assert!(gatt.writes.is_empty());
        assert_eq!(link.stats().busy_writes, 1);

        notify(&mut link, &mut gatt, &mut session, Packet::ResetRequest {
            sn: SeqNum::ZERO,
            payload: None,
        });
        assert!(gatt.writes.is_empty());

        gatt.busy = false;
        link.on_buffer_empty(&mut gatt, &mut session);
        assert!(matches!(
            gatt.take_packets(1).as_slice(),
            [Packet::ResetComplete { .. }]
        ));
    }

    #[test]
    fn test_busy_data_waits_for_buffer_empty() {
        let (mut link, mut gatt, mut session) = open_link(test_config());
        gatt.busy = true;
        session.queue(b"queued");
        link.send_next(&mut gatt, &mut session);

        gatt.busy = false;
        // 무관한 이벤트로는 재개하지 않음
        link.send_next(&mut gatt, &mut session);
        link.on_tick(&mut gatt, &mut session);
        assert!(gatt.writes.is_empty());

        link.on_buffer_empty(&mut gatt, &mut session);
        assert_eq!(
            gatt.take_packets(1),
            vec![Packet::Data {
                sn: SeqNum::ZERO,
                payload: Bytes::from_static(b"queued")
            }]
        );
    }

    #[test]
    fn test_malformed_and_loopback_do_not_disturb_open_link() {
        let (mut link, mut gatt, mut session) = open_link(test_config());

        link.on_notification(&[0x05, 0xFF], &mut gatt, &mut session);
        link.on_notification(&[], &mut gatt, &mut session);
        let mut looped = vec![0x02, 1];
        looped.extend_from_slice(b"Q402445E00AB");
        link.on_notification(&looped, &mut gatt, &mut session);

        assert!(link.is_open());
        assert!(gatt.writes.is_empty());
        assert!(session.events.is_empty());
        assert_eq!(link.stats().malformed_drops, 2);
    }

    #[test]
    fn test_meta_rejected_for_taken_uuid() {
        let mut link = new_link(test_config());
        let mut gatt = MockGatt::new(158);
        link.start(&mut gatt);
        link.on_meta_read(
            Ok(meta_bytes(APP_UUID, 0, 1, SessionType::InferredFromUuid).into()),
            &|uuid| uuid == APP_UUID,
            &mut gatt,
        );
        assert!(link.is_closed());
        assert!(gatt.subscribes.is_empty());
    }

    #[test]
    fn test_subscribe_failure_closes() {
        let mut link = new_link(test_config());
        let mut gatt = MockGatt::new(158);
        let mut session = RecordingSession::default();
        link.start(&mut gatt);
        link.on_meta_read(
            Ok(meta_bytes(APP_UUID, 0, 1, SessionType::InferredFromUuid).into()),
            &|_| false,
            &mut gatt,
        );
        link.on_subscribe_response(Err(GattError::AttError(0x0E)), &mut gatt, &mut session);
        assert!(link.is_closed());
        assert!(gatt.writes.is_empty());
    }
}
