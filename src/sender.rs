//! 송신 윈도우
//!
//! - 큐에 쌓인 바이트를 MTU 크기 Data 패킷으로 분할
//! - 미확인 패킷 수를 협상된 윈도우로 제한
//! - 누적 ACK 처리와 타임아웃 재전송
//!
//! 한 번 만들어진 슬롯의 분할 경계는 고정된다. 재전송은 같은 시퀀스 번호로
//! 같은 바이트를 다시 보낸다.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::seq_num::SeqNum;
use crate::timer::{Expiry, RetransmitClock, SlotAge};

/// 전송 중인 Data 패킷 슬롯
#[derive(Debug)]
struct Slot {
    sn: SeqNum,

    /// 고정된 페이로드
    payload: Bytes,

    /// 마지막 전송 이후 나이와 재시도 횟수
    age: SlotAge,

    /// 전송 횟수
    transmissions: u32,

    /// 하위 계층에 쓰였고 재전송 대기 중이 아님
    sent: bool,
}

/// ACK 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 해제된 슬롯 수
    Acked(usize),

    /// 이미 확인된 시퀀스 번호. 아무것도 하지 않음
    Duplicate,

    /// 전송 중인 범위 밖. 프로토콜 위반
    OutOfWindow,
}

/// 틱 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,

    /// 재전송 대기로 돌린 슬롯 수
    Retransmit(usize),

    /// 재시도 한도를 넘긴 슬롯
    Exhausted(SeqNum),
}

/// 송신 윈도우
#[derive(Debug)]
pub struct SendWindow {
    /// 미확인 패킷 최대 수
    capacity: u8,

    /// 다음 슬롯에 부여할 시퀀스 번호
    next_sn: SeqNum,

    /// 시퀀스 순서의 전송 중 슬롯 (링 버퍼)
    in_flight: VecDeque<Slot>,

    /// 아직 분할되지 않은 바이트
    pending: BytesMut,

    clock: RetransmitClock,

    /// 리셋 이후 확인된 시퀀스 번호 수 (윈도우 크기로 제한)
    acked: usize,
}

impl SendWindow {
    pub fn new(capacity: u8, clock: RetransmitClock) -> Self {
        Self {
            capacity,
            next_sn: SeqNum::ZERO,
            in_flight: VecDeque::with_capacity(capacity as usize),
            pending: BytesMut::new(),
            clock,
            acked: 0,
        }
    }

    /// 리셋: 모든 슬롯과 대기 바이트를 버리고 시퀀스 0부터 다시 시작
    pub fn reset(&mut self, capacity: u8) {
        self.capacity = capacity;
        self.next_sn = SeqNum::ZERO;
        self.in_flight.clear();
        self.pending.clear();
        self.acked = 0;
    }

    /// 윈도우 크기 변경 (리셋 핸드쉐이크 완료 시)
    pub fn set_capacity(&mut self, capacity: u8) {
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn max_retries(&self) -> u8 {
        self.clock.max_retries()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// 새 슬롯을 만들 수 있는 여유
    pub fn free_slots(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.in_flight.len())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 보낼 것도 확인 받을 것도 없음
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }

    /// 송신 바이트 추가
    pub fn enqueue(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// 대기 바이트를 `max_payload` 이하 슬롯으로 분할
    ///
    /// 윈도우가 허용하는 만큼만 만든다. 반환값은 새로 만든 슬롯 수.
    pub fn fragment(&mut self, max_payload: usize) -> usize {
        if max_payload == 0 {
            return 0;
        }

        let mut created = 0;
        while self.free_slots() > 0 && !self.pending.is_empty() {
            let len = max_payload.min(self.pending.len());
            let payload = self.pending.split_to(len).freeze();

            self.in_flight.push_back(Slot {
                sn: self.next_sn,
                payload,
                age: SlotAge::default(),
                transmissions: 0,
                sent: false,
            });
            self.next_sn = self.next_sn.next();
            created += 1;
        }
        created
    }

    /// 다음으로 써야 할 슬롯 (시퀀스 순서)
    pub fn next_unsent(&self) -> Option<(SeqNum, &Bytes)> {
        self.in_flight
            .iter()
            .find(|slot| !slot.sent)
            .map(|slot| (slot.sn, &slot.payload))
    }

    /// 하위 계층 쓰기 성공 기록. 재전송이었으면 `true`
    pub fn mark_sent(&mut self, sn: SeqNum) -> bool {
        match self.in_flight.iter_mut().find(|slot| slot.sn == sn) {
            Some(slot) => {
                slot.sent = true;
                slot.age.ticks = 0;
                slot.transmissions += 1;
                slot.transmissions > 1
            }
            None => false,
        }
    }

    /// 가장 오래된 미확인 시퀀스 번호
    fn base(&self) -> SeqNum {
        self.in_flight
            .front()
            .map(|slot| slot.sn)
            .unwrap_or(self.next_sn)
    }

    /// 누적 ACK 처리
    ///
    /// `sn`과 그 이전의 전송 중 슬롯을 모두 해제한다.
    pub fn handle_ack(&mut self, sn: SeqNum) -> AckOutcome {
        let distance = self.base().distance_to(sn) as usize;

        if distance < self.in_flight.len() {
            if self.in_flight[distance].transmissions == 0 {
                // 보낸 적 없는 슬롯에 대한 ACK
                return AckOutcome::OutOfWindow;
            }
            self.in_flight.drain(..=distance);
            self.acked = (self.acked + distance + 1).min(self.capacity as usize);
            debug!("ACK {}: {} 슬롯 해제, {} 남음", sn, distance + 1, self.in_flight.len());
            return AckOutcome::Acked(distance + 1);
        }

        // base 바로 뒤에서 이미 확인된 구간만 중복으로 인정
        let behind = sn.distance_to(self.base()) as usize;
        if behind >= 1 && behind <= self.acked.min(self.capacity as usize) {
            return AckOutcome::Duplicate;
        }

        AckOutcome::OutOfWindow
    }

    /// 재전송 타이머 한 틱
    ///
    /// 만료된 슬롯은 재전송 대기로 돌아가며, 다음 flush에서 시퀀스 순서대로
    /// 하나씩 다시 쓰인다.
    pub fn on_tick(&mut self) -> TickOutcome {
        let mut retransmit = 0;

        for slot in self.in_flight.iter_mut().filter(|slot| slot.sent) {
            match self.clock.advance(&mut slot.age) {
                Expiry::Pending => {}
                Expiry::Retransmit => {
                    slot.sent = false;
                    retransmit += 1;
                }
                Expiry::Exhausted => return TickOutcome::Exhausted(slot.sn),
            }
        }

        if retransmit > 0 {
            TickOutcome::Retransmit(retransmit)
        } else {
            TickOutcome::Idle
        }
    }
}
