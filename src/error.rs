//! 에러 타입 정의

use thiserror::Error;

use crate::packet::PacketType;

/// PPoGATT 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("잘못된 패킷: {0}")]
    Malformed(#[from] MalformedPacket),

    #[error("잘못된 Meta: {0}")]
    Meta(#[from] MetaError),

    #[error("GATT 에러: {0}")]
    Gatt(#[from] GattError),

    #[error("이미 사용 중인 UUID: {uuid}")]
    DuplicateUuid { uuid: uuid::Uuid },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("이벤트 큐 가득 참")]
    ChannelFull,

    #[error("엔진 종료됨")]
    ChannelClosed,
}

/// 디코딩 불가능한 패킷
///
/// 링크 상태를 바꾸지 않고 로그 후 버린다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPacket {
    #[error("예약된 패킷 타입: {0}")]
    ReservedType(u8),

    #[error("{packet_type:?} 패킷 길이 부족: {len} < {min}")]
    TooShort {
        packet_type: PacketType,
        len: usize,
        min: usize,
    },
}

/// Meta characteristic 검증 실패
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("Meta 길이 부족: {len} < {min}")]
    TooShort { len: usize, min: usize },

    #[error("유효하지 않은 앱 UUID")]
    InvalidUuid,

    #[error("알 수 없는 세션 타입: {0}")]
    UnknownSessionType(u8),

    #[error("버전 범위 불일치: remote {remote_min}..={remote_max}, local {local_min}..={local_max}")]
    VersionMismatch {
        remote_min: u8,
        remote_max: u8,
        local_min: u8,
        local_max: u8,
    },
}

/// 하위 GATT 드라이버 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    /// 송신 버퍼 부족. buffer-empty 이벤트 이후 재시도해야 함
    #[error("송신 버퍼 가득 참")]
    Busy,

    #[error("연결 끊김")]
    Disconnected,

    #[error("ATT 에러 응답: 0x{0:02X}")]
    AttError(u8),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
