//! 외부 인터페이스
//!
//! - `GattClient`: 하위 BLE GATT 드라이버 (소비)
//! - `SessionHandler`: 상위 세션 계층 (노출/소비)
//!
//! 드라이버의 비동기 완료 통지는 `crate::engine::Event`로 엔진 큐에 넣는다.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::GattError;
use crate::meta::Destination;

/// BLE 연결 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u16);

/// characteristic 핸들 (드라이버가 주는 불투명 토큰)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u16);

/// 발견된 PPoGATT 서비스 인스턴스
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInstance {
    /// 연결 내에서 인스턴스를 구분하는 값 (서비스 시작 핸들)
    pub id: u16,

    /// Meta characteristic
    pub meta: CharacteristicHandle,

    /// Data characteristic
    pub data: CharacteristicHandle,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 하위 GATT 드라이버
///
/// 모든 호출은 블로킹하지 않는다. `Err(GattError::Busy)`는 버퍼가 빌 때
/// (`Event::BufferEmpty`) 다시 시도하라는 뜻이다.
pub trait GattClient {
    /// 읽기 요청. 결과는 `Event::ReadResponse`
    fn read(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError>;

    /// 쓰기 요청
    fn write(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
        value: &[u8],
        response_required: bool,
    ) -> Result<(), GattError>;

    /// notification 구독. 결과는 `Event::SubscribeResponse`
    fn subscribe(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError>;

    fn unsubscribe(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError>;

    /// 현재 MTU. 재탐색 중에는 0일 수 있음
    fn mtu(&self, connection: ConnectionId) -> u16;
}

/// 상위 세션 계층
pub trait SessionHandler {
    /// 링크가 Open 상태가 됨
    fn open(&mut self, uuid: Uuid, destination: Destination);

    /// 링크가 더 이상 Open이 아님
    fn close(&mut self, uuid: Uuid);

    /// 순서대로 수신된 바이트
    fn deliver_bytes(&mut self, uuid: Uuid, bytes: &[u8]);

    /// 송신할 다음 바이트 (최대 `max_len`). 없으면 `None`
    fn drain_next_bytes(&mut self, uuid: Uuid, max_len: usize) -> Option<Bytes>;
}
