//! Meta characteristic 디코딩과 버전 협상
//!
//! 신뢰 채널을 열기 전에 읽는 읽기 전용 속성.
//!
//! ```text
//! v0: min_version(1) | max_version(1) | app_uuid(16)
//! v1: v0 | session_type(1)
//! ```
//!
//! `max_version >= 1`이면 v1 레이아웃으로 간주한다.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MetaError;

/// v0 Meta 길이
pub const META_V0_LEN: usize = 18;

/// v1 Meta 길이
pub const META_V1_LEN: usize = 19;

/// 사용할 수 없는 앱 UUID
pub const INVALID_UUID: Uuid = Uuid::from_bytes([0xFF; 16]);

/// 세션 타입 (v1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionType {
    /// UUID로 목적지 추론
    InferredFromUuid = 0,

    /// 시스템 + 앱 겸용
    Hybrid = 1,
}

/// 링크가 연결되는 세션 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    System,
    App,
    Hybrid,
}

/// 디코딩된 Meta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub min_version: u8,
    pub max_version: u8,
    pub app_uuid: Uuid,
    pub session_type: SessionType,
}

impl Meta {
    /// 바이트에서 디코딩 및 검증
    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        if bytes.len() < META_V0_LEN {
            return Err(MetaError::TooShort {
                len: bytes.len(),
                min: META_V0_LEN,
            });
        }

        let min_version = bytes[0];
        let max_version = bytes[1];

        let min_len = if max_version >= 1 {
            META_V1_LEN
        } else {
            META_V0_LEN
        };
        if bytes.len() < min_len {
            return Err(MetaError::TooShort {
                len: bytes.len(),
                min: min_len,
            });
        }

        let mut raw_uuid = [0u8; 16];
        raw_uuid.copy_from_slice(&bytes[2..META_V0_LEN]);
        let app_uuid = Uuid::from_bytes(raw_uuid);
        if app_uuid == INVALID_UUID {
            return Err(MetaError::InvalidUuid);
        }

        let session_type = if max_version >= 1 {
            match bytes[META_V0_LEN] {
                0 => SessionType::InferredFromUuid,
                1 => SessionType::Hybrid,
                other => return Err(MetaError::UnknownSessionType(other)),
            }
        } else {
            SessionType::InferredFromUuid
        };

        Ok(Self {
            min_version,
            max_version,
            app_uuid,
            session_type,
        })
    }

    /// 양쪽 지원 범위가 겹치는 가장 높은 버전
    pub fn negotiate(&self, local_min: u8, local_max: u8) -> Result<u8, MetaError> {
        let low = self.min_version.max(local_min);
        let high = self.max_version.min(local_max);

        if low > high {
            return Err(MetaError::VersionMismatch {
                remote_min: self.min_version,
                remote_max: self.max_version,
                local_min,
                local_max,
            });
        }
        Ok(high)
    }

    /// 목적지 결정: 명시적 Hybrid, 아니면 시스템 UUID와 비교
    pub fn destination(&self, system_uuid: &Uuid) -> Destination {
        match self.session_type {
            SessionType::Hybrid => Destination::Hybrid,
            SessionType::InferredFromUuid if self.app_uuid == *system_uuid => Destination::System,
            SessionType::InferredFromUuid => Destination::App,
        }
    }

    /// 인코딩 (테스트 및 시뮬레이터의 서버측용)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_V1_LEN);
        buf.push(self.min_version);
        buf.push(self.max_version);
        buf.extend_from_slice(self.app_uuid.as_bytes());
        if self.max_version >= 1 {
            buf.push(self.session_type as u8);
        }
        buf
    }
}
