//! 링크별 전송 통계

use std::time::{Duration, Instant};

use serde::Serialize;

/// 링크 통계
#[derive(Debug, Clone, Serialize)]
pub struct LinkStats {
    /// 생성 시간
    #[serde(skip)]
    pub start_time: Instant,

    /// 전송한 Data 패킷 수 (재전송 포함)
    pub data_packets_sent: u64,

    /// 재전송한 Data 패킷 수
    pub retransmitted_packets: u64,

    /// 처음 전송한 페이로드 바이트
    pub bytes_sent: u64,

    /// 수락한 Data 패킷 수
    pub data_packets_received: u64,

    /// 상위로 전달한 바이트
    pub bytes_received: u64,

    /// 전송한 ACK 수
    pub acks_sent: u64,

    /// 받은 ACK 중 슬롯을 해제한 것
    pub acks_received: u64,

    /// 중복 ACK
    pub duplicate_acks: u64,

    /// 순서 밖이라 버린 Data 패킷
    pub out_of_order_drops: u64,

    /// 디코딩 실패로 버린 패킷
    pub malformed_drops: u64,

    /// 스스로 시작한 리셋
    pub local_resets: u64,

    /// 원격이 시작한 리셋
    pub remote_resets: u64,

    /// Busy로 거절된 쓰기
    pub busy_writes: u64,

    /// Open 진입 횟수
    pub opens: u64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            data_packets_sent: 0,
            retransmitted_packets: 0,
            bytes_sent: 0,
            data_packets_received: 0,
            bytes_received: 0,
            acks_sent: 0,
            acks_received: 0,
            duplicate_acks: 0,
            out_of_order_drops: 0,
            malformed_drops: 0,
            local_resets: 0,
            remote_resets: 0,
            busy_writes: 0,
            opens: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.data_packets_sent == 0 {
            return 0.0;
        }
        self.retransmitted_packets as f64 / self.data_packets_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | TX: {} pkts / {} bytes ({:.1}% retx) | RX: {} pkts / {} bytes | ACKs: {} sent, {} recv ({} dup) | Drops: {} ooo, {} malformed | Resets: {} local, {} remote | Busy: {}",
            self.elapsed().as_secs_f64(),
            self.data_packets_sent,
            self.bytes_sent,
            self.retransmit_ratio() * 100.0,
            self.data_packets_received,
            self.bytes_received,
            self.acks_sent,
            self.acks_received,
            self.duplicate_acks,
            self.out_of_order_drops,
            self.malformed_drops,
            self.local_resets,
            self.remote_resets,
            self.busy_writes,
        )
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}
