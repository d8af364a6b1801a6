//! PPoGATT 패킷 코덱
//!
//! 1바이트 헤더 + 타입별 본문
//!
//! ```text
//! bit  7 6 5 4 3 | 2 1 0
//!      sn (5bit) | type (3bit)
//! ```
//!
//! - Data: 본문 = 원시 페이로드
//! - Ack: 본문 없음
//! - ResetRequest: 비어 있거나 (서버 발신) `version(1) + client_id(12)` (클라이언트 발신)
//! - ResetComplete: v0은 비어 있음, v1부터 `rx_window(1) + tx_window(1)`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MalformedPacket;
use crate::seq_num::SeqNum;

/// 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 1;

/// 클라이언트 식별자 길이 (시리얼 번호)
pub const CLIENT_ID_LEN: usize = 12;

/// 클라이언트 식별자 (시리얼 번호)
pub type ClientId = [u8; CLIENT_ID_LEN];

const TYPE_MASK: u8 = 0b0000_0111;
const SN_SHIFT: u8 = 3;

const RESET_REQUEST_ID_LEN: usize = 1 + CLIENT_ID_LEN;
const RESET_COMPLETE_V1_LEN: usize = 2;

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// 데이터 조각
    Data = 0,

    /// 누적 ACK
    Ack = 1,

    /// 리셋 요청
    ResetRequest = 2,

    /// 리셋 완료
    ResetComplete = 3,
}

impl PacketType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Ack),
            2 => Some(PacketType::ResetRequest),
            3 => Some(PacketType::ResetComplete),
            _ => None,
        }
    }
}

/// 클라이언트가 보내는 ResetRequest 본문
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRequestPayload {
    /// 협상된 프로토콜 버전
    pub version: u8,

    /// 클라이언트 식별자
    pub client_id: ClientId,
}

/// ResetComplete 본문 (버전별)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCompletePayload {
    V0,
    V1 {
        /// 발신자가 받고 싶은 최대 수신 윈도우
        rx_window: u8,
        /// 발신자가 쓰고 싶은 최대 송신 윈도우
        tx_window: u8,
    },
}

/// 디코딩된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data { sn: SeqNum, payload: Bytes },
    Ack { sn: SeqNum },
    ResetRequest {
        sn: SeqNum,
        payload: Option<ResetRequestPayload>,
    },
    ResetComplete {
        sn: SeqNum,
        payload: ResetCompletePayload,
    },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Data { .. } => PacketType::Data,
            Packet::Ack { .. } => PacketType::Ack,
            Packet::ResetRequest { .. } => PacketType::ResetRequest,
            Packet::ResetComplete { .. } => PacketType::ResetComplete,
        }
    }

    pub fn sn(&self) -> SeqNum {
        match self {
            Packet::Data { sn, .. }
            | Packet::Ack { sn }
            | Packet::ResetRequest { sn, .. }
            | Packet::ResetComplete { sn, .. } => *sn,
        }
    }

    /// 와이어 형식으로 인코딩
    pub fn encode(&self) -> Bytes {
        let header = (self.sn().raw() << SN_SHIFT) | self.packet_type() as u8;

        match self {
            Packet::Data { payload, .. } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
                buf.put_u8(header);
                buf.put_slice(payload);
                buf.freeze()
            }
            Packet::Ack { .. } => Bytes::copy_from_slice(&[header]),
            Packet::ResetRequest { payload, .. } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + RESET_REQUEST_ID_LEN);
                buf.put_u8(header);
                if let Some(id) = payload {
                    buf.put_u8(id.version);
                    buf.put_slice(&id.client_id);
                }
                buf.freeze()
            }
            Packet::ResetComplete { payload, .. } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + RESET_COMPLETE_V1_LEN);
                buf.put_u8(header);
                if let ResetCompletePayload::V1 {
                    rx_window,
                    tx_window,
                } = payload
                {
                    buf.put_u8(*rx_window);
                    buf.put_u8(*tx_window);
                }
                buf.freeze()
            }
        }
    }

    /// 와이어 형식에서 디코딩
    ///
    /// 길이 0인 notification은 `Ok(None)`. ResetComplete 본문 해석은
    /// 링크에 고정된 `version`을 따른다.
    pub fn decode(bytes: &[u8], version: u8) -> Result<Option<Packet>, MalformedPacket> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Ok(None);
        }

        let header = buf.get_u8();
        let tag = header & TYPE_MASK;
        let sn = SeqNum::new(header >> SN_SHIFT);
        let packet_type = PacketType::from_tag(tag).ok_or(MalformedPacket::ReservedType(tag))?;

        let packet = match packet_type {
            PacketType::Data => Packet::Data {
                sn,
                payload: Bytes::copy_from_slice(buf),
            },
            PacketType::Ack => Packet::Ack { sn },
            PacketType::ResetRequest => {
                let payload = match buf.remaining() {
                    0 => None,
                    n if n < RESET_REQUEST_ID_LEN => {
                        return Err(MalformedPacket::TooShort {
                            packet_type,
                            len: bytes.len(),
                            min: HEADER_LEN + RESET_REQUEST_ID_LEN,
                        });
                    }
                    _ => {
                        let version = buf.get_u8();
                        let mut client_id = [0u8; CLIENT_ID_LEN];
                        buf.copy_to_slice(&mut client_id);
                        Some(ResetRequestPayload { version, client_id })
                    }
                };
                Packet::ResetRequest { sn, payload }
            }
            PacketType::ResetComplete => {
                let payload = if version == 0 {
                    ResetCompletePayload::V0
                } else if buf.remaining() < RESET_COMPLETE_V1_LEN {
                    return Err(MalformedPacket::TooShort {
                        packet_type,
                        len: bytes.len(),
                        min: HEADER_LEN + RESET_COMPLETE_V1_LEN,
                    });
                } else {
                    ResetCompletePayload::V1 {
                        rx_window: buf.get_u8(),
                        tx_window: buf.get_u8(),
                    }
                };
                Packet::ResetComplete { sn, payload }
            }
        };

        Ok(Some(packet))
    }
}
