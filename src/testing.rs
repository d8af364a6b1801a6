//! 테스트용 가짜 GATT 드라이버, 세션, 원격 서버

use std::collections::VecDeque;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::GattError;
use crate::link::Link;
use crate::meta::{Destination, Meta, SessionType};
use crate::packet::{Packet, ResetCompletePayload};
use crate::seq_num::SeqNum;
use crate::transport::{
    CharacteristicHandle, ConnectionId, GattClient, ServiceInstance, SessionHandler,
};

pub const CONN: ConnectionId = ConnectionId(1);

pub const SERVICE: ServiceInstance = ServiceInstance {
    id: 0x20,
    meta: CharacteristicHandle(0x22),
    data: CharacteristicHandle(0x24),
};

pub const OTHER_SERVICE: ServiceInstance = ServiceInstance {
    id: 0x30,
    meta: CharacteristicHandle(0x32),
    data: CharacteristicHandle(0x34),
};

pub const APP_UUID: Uuid = Uuid::from_u128(0x0c5b_3b4e_a1f2_4c2e_9a1b_5e4f_0d6c_7a80);

pub fn meta_bytes(uuid: Uuid, min_version: u8, max_version: u8, session_type: SessionType) -> Vec<u8> {
    Meta {
        min_version,
        max_version,
        app_uuid: uuid,
        session_type,
    }
    .encode()
}

/// 요청을 기록하는 GATT 드라이버
#[derive(Debug, Default)]
pub struct MockGatt {
    pub reads: Vec<(ConnectionId, CharacteristicHandle)>,
    pub writes: Vec<(ConnectionId, CharacteristicHandle, Bytes)>,
    pub subscribes: Vec<(ConnectionId, CharacteristicHandle)>,
    pub unsubscribes: Vec<(ConnectionId, CharacteristicHandle)>,
    pub mtu: u16,
    /// 쓰기를 Busy로 거절
    pub busy: bool,
}

impl MockGatt {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            ..Self::default()
        }
    }

    /// 기록된 쓰기를 디코딩해서 꺼낸다
    pub fn take_packets(&mut self, version: u8) -> Vec<Packet> {
        self.writes
            .drain(..)
            .filter_map(|(_, _, value)| Packet::decode(&value, version).ok().flatten())
            .collect()
    }
}

impl GattClient for MockGatt {
    fn read(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError> {
        self.reads.push((connection, characteristic));
        Ok(())
    }

    fn write(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        value: &[u8],
        _response_required: bool,
    ) -> Result<(), GattError> {
        if self.busy {
            return Err(GattError::Busy);
        }
        self.writes
            .push((connection, characteristic, Bytes::copy_from_slice(value)));
        Ok(())
    }

    fn subscribe(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError> {
        self.subscribes.push((connection, characteristic));
        Ok(())
    }

    fn unsubscribe(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError> {
        self.unsubscribes.push((connection, characteristic));
        Ok(())
    }

    fn mtu(&self, _connection: ConnectionId) -> u16 {
        self.mtu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Open(Uuid, Destination),
    Close(Uuid),
}

/// 콜백을 기록하는 세션
#[derive(Debug, Default)]
pub struct RecordingSession {
    pub events: Vec<SessionEvent>,
    pub delivered: Vec<u8>,
    pub outbound: VecDeque<u8>,
}

impl RecordingSession {
    pub fn queue(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }

    pub fn open_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, SessionEvent::Open(..)))
            .count()
    }
}

impl SessionHandler for RecordingSession {
    fn open(&mut self, uuid: Uuid, destination: Destination) {
        self.events.push(SessionEvent::Open(uuid, destination));
    }

    fn close(&mut self, uuid: Uuid) {
        self.events.push(SessionEvent::Close(uuid));
    }

    fn deliver_bytes(&mut self, _uuid: Uuid, bytes: &[u8]) {
        self.delivered.extend_from_slice(bytes);
    }

    fn drain_next_bytes(&mut self, _uuid: Uuid, max_len: usize) -> Option<Bytes> {
        if self.outbound.is_empty() {
            return None;
        }
        let len = max_len.min(self.outbound.len());
        Some(self.outbound.drain(..len).collect::<Vec<u8>>().into())
    }
}

/// 최소한의 서버측 상대
#[derive(Debug)]
pub struct RemotePeer {
    version: u8,
    rx_window: u8,
    tx_window: u8,
    initiated: bool,
    awaiting_complete: bool,
    expected: SeqNum,
    pub negotiated_rx: u8,
    pub negotiated_tx: u8,
    pub opens: usize,
    pub received: Vec<u8>,
}

impl RemotePeer {
    pub fn new(version: u8, rx_window: u8, tx_window: u8) -> Self {
        Self {
            version,
            rx_window,
            tx_window,
            initiated: false,
            awaiting_complete: false,
            expected: SeqNum::ZERO,
            negotiated_rx: 0,
            negotiated_tx: 0,
            opens: 0,
            received: Vec::new(),
        }
    }

    pub fn initiate_reset(&mut self) -> Packet {
        self.initiated = true;
        self.expected = SeqNum::ZERO;
        Packet::ResetRequest {
            sn: SeqNum::ZERO,
            payload: None,
        }
    }

    fn complete(&self) -> Packet {
        Packet::ResetComplete {
            sn: SeqNum::ZERO,
            payload: ResetCompletePayload::V1 {
                rx_window: self.rx_window,
                tx_window: self.tx_window,
            },
        }
    }

    /// 클라이언트가 쓴 패킷 하나를 처리하고 응답을 돌려준다
    pub fn on_client_packet(&mut self, packet: Packet) -> Vec<Packet> {
        match packet {
            Packet::ResetRequest { .. } => {
                self.expected = SeqNum::ZERO;
                self.awaiting_complete = true;
                vec![self.complete()]
            }
            Packet::ResetComplete { payload, .. } => {
                if let ResetCompletePayload::V1 {
                    rx_window,
                    tx_window,
                } = payload
                {
                    self.negotiated_rx = self.rx_window.min(tx_window);
                    self.negotiated_tx = self.tx_window.min(rx_window);
                }
                if self.initiated {
                    self.initiated = false;
                    self.opens += 1;
                    vec![self.complete()]
                } else if self.awaiting_complete {
                    self.awaiting_complete = false;
                    self.opens += 1;
                    Vec::new()
                } else {
                    Vec::new()
                }
            }
            Packet::Data { sn, payload } if sn == self.expected => {
                self.expected = sn.next();
                self.received.extend_from_slice(&payload);
                vec![Packet::Ack { sn }]
            }
            Packet::Data { .. } | Packet::Ack { .. } => Vec::new(),
        }
    }

    /// 링크가 조용해질 때까지 패킷을 주고받는다
    pub fn exchange(
        &mut self,
        link: &mut Link,
        gatt: &mut MockGatt,
        session: &mut RecordingSession,
    ) {
        loop {
            let packets = gatt.take_packets(self.version);
            if packets.is_empty() {
                break;
            }
            for packet in packets {
                for reply in self.on_client_packet(packet) {
                    link.on_notification(&reply.encode(), gatt, session);
                }
            }
        }
    }
}
