//! # PPoGATT (Pebble Protocol over GATT)
//!
//! BLE GATT 위의 신뢰성 있는 바이트 스트림 (클라이언트 측)
//!
//! ## 핵심 특징
//! - **슬라이딩 윈도우 ARQ**: 5비트 시퀀스 번호, 누적 ACK, 타임아웃 재전송
//! - **리셋 핸드쉐이크**: 양쪽 어느 쪽이 시작해도 한 번의 Open으로 수렴
//! - **버전 협상**: Meta characteristic으로 v0/v1 선택, v1은 윈도우 크기 협상
//! - **멀티플렉싱**: 서비스 인스턴스마다 링크 하나, 앱 UUID로 세션 연결
//! - **백프레셔**: 하위 계층 Busy는 buffer-empty 통지까지 보류
//!
//! ## 구조
//! BLE 콜백은 `EngineHandle`로 이벤트를 넣고, `Engine` 태스크가 `Registry`와
//! 각 `Link`를 단독으로 갱신한다.

pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod meta;
pub mod packet;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod seq_num;
pub mod stats;
pub mod timer;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use engine::{channel, Engine, EngineHandle, Event, EventReceiver};
pub use error::{Error, GattError, MalformedPacket, MetaError, Result};
pub use link::{Link, LinkId, LinkState, ResetInitiator};
pub use meta::{Destination, Meta, SessionType};
pub use packet::{ClientId, Packet, PacketType, ResetCompletePayload, ResetRequestPayload};
pub use registry::{LinkSummary, Registry, RegistrySnapshot};
pub use seq_num::SeqNum;
pub use stats::LinkStats;
pub use transport::{CharacteristicHandle, ConnectionId, GattClient, ServiceInstance, SessionHandler};

/// 지원하는 최소 프로토콜 버전
pub const PPOGATT_MIN_VERSION: u8 = 0;

/// 지원하는 최대 프로토콜 버전
pub const PPOGATT_MAX_VERSION: u8 = 1;
