//! 프로토콜 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::packet::ClientId;
use crate::seq_num::SN_MODULUS;
use crate::{Error, Result, PPOGATT_MAX_VERSION, PPOGATT_MIN_VERSION};

/// PPoGATT 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 지원하는 최소 프로토콜 버전
    pub min_version: u8,

    /// 지원하는 최대 프로토콜 버전
    pub max_version: u8,

    /// ResetRequest에 싣는 클라이언트 식별자 (시리얼 번호)
    pub client_id: ClientId,

    /// 시스템 세션 UUID. Meta의 UUID가 이것과 같으면 System 목적지
    pub system_uuid: Uuid,

    /// v1에서 요청하는 수신 윈도우
    pub desired_rx_window: u8,

    /// v1에서 요청하는 송신 윈도우
    pub desired_tx_window: u8,

    /// v0 고정 윈도우
    pub v0_window: u8,

    /// 틱 간격 (밀리초)
    pub tick_interval_ms: u64,

    /// 재전송 타임아웃 (틱)
    pub retransmit_timeout_ticks: u16,

    /// 같은 패킷 재전송 한도. 초과하면 리셋
    pub max_retries: u8,

    /// ACK 지연 (틱). 0이면 즉시
    pub ack_delay_ticks: u16,

    /// ResetComplete 대기 타임아웃 (틱)
    pub reset_timeout_ticks: u16,

    /// 하위 계층 오버헤드 (ATT 헤더, 바이트)
    pub lower_layer_overhead: usize,

    /// 엔진 이벤트 큐 크기
    pub event_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_version: PPOGATT_MIN_VERSION,
            max_version: PPOGATT_MAX_VERSION,
            client_id: *b"000000000000",
            system_uuid: Uuid::nil(),
            desired_rx_window: 25,
            desired_tx_window: 25,
            v0_window: 4,
            tick_interval_ms: 250,
            retransmit_timeout_ticks: 8, // 2초
            max_retries: 5,
            ack_delay_ticks: 1,
            reset_timeout_ticks: 12, // 3초
            lower_layer_overhead: 3,
            event_queue_size: 256,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 시리얼 번호 지정. 12바이트보다 짧으면 0으로 채운다
    pub fn with_serial(mut self, serial: &str) -> Self {
        let mut client_id = [b'0'; 12];
        for (dst, src) in client_id.iter_mut().zip(serial.bytes()) {
            *dst = src;
        }
        self.client_id = client_id;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// MTU로부터 Data 패킷 최대 페이로드 계산
    ///
    /// MTU가 0이거나 너무 작으면 `None` (지금은 패킷 크기를 정할 수 없음).
    pub fn max_payload(&self, mtu: u16) -> Option<usize> {
        let overhead = self.lower_layer_overhead + crate::packet::HEADER_LEN;
        (mtu as usize)
            .checked_sub(overhead)
            .filter(|&len| len > 0)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.min_version > self.max_version {
            return Err(Error::InvalidConfig(format!(
                "min_version {} > max_version {}",
                self.min_version, self.max_version
            )));
        }
        if self.max_version > PPOGATT_MAX_VERSION {
            return Err(Error::InvalidConfig(format!(
                "지원하지 않는 버전: {}",
                self.max_version
            )));
        }
        for (name, window) in [
            ("desired_rx_window", self.desired_rx_window),
            ("desired_tx_window", self.desired_tx_window),
            ("v0_window", self.v0_window),
        ] {
            if window == 0 || window >= SN_MODULUS {
                return Err(Error::InvalidConfig(format!(
                    "{name} = {window}, 1..{SN_MODULUS} 범위여야 함"
                )));
            }
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms = 0".into()));
        }
        if self.event_queue_size == 0 {
            return Err(Error::InvalidConfig("event_queue_size = 0".into()));
        }
        Ok(())
    }

    /// v0만 지원하는 레거시 설정
    pub fn legacy() -> Self {
        Self {
            max_version: 0,
            ..Self::default()
        }
    }

    /// 불안정한 링크용 설정
    pub fn unstable_link() -> Self {
        Self {
            desired_rx_window: 12,
            desired_tx_window: 12,
            retransmit_timeout_ticks: 12, // 3초
            max_retries: 8,
            reset_timeout_ticks: 20,
            ..Self::default()
        }
    }
}
