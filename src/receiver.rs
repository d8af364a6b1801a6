//! 수신 추적기
//!
//! - 기대한 시퀀스 번호의 Data만 수락
//! - 순서 밖 패킷은 ACK 없이 버림 (송신측 재전송에 맡김)
//! - ACK는 지연 타이머로 모아서 한 번에 누적 전송

use crate::seq_num::SeqNum;
use crate::timer::Countdown;

/// 수신 추적기
#[derive(Debug)]
pub struct ReceiveTracker {
    /// 다음에 수락할 시퀀스 번호
    expected: SeqNum,

    /// 마지막으로 수락한 시퀀스 번호 (ACK 대상)
    last_accepted: Option<SeqNum>,

    /// 아직 ACK하지 않은 수락 패킷 수
    unacked: usize,

    /// 수신 윈도우
    window: u8,

    /// ACK 지연 (틱)
    ack_delay_ticks: u16,

    ack_timer: Countdown,

    /// ACK 전송 시점 도달
    ack_due: bool,
}

impl ReceiveTracker {
    pub fn new(window: u8, ack_delay_ticks: u16) -> Self {
        Self {
            expected: SeqNum::ZERO,
            last_accepted: None,
            unacked: 0,
            window,
            ack_delay_ticks,
            ack_timer: Countdown::default(),
            ack_due: false,
        }
    }

    /// 리셋: 커서를 0으로, 대기 중인 ACK는 폐기
    pub fn reset(&mut self, window: u8) {
        self.expected = SeqNum::ZERO;
        self.last_accepted = None;
        self.unacked = 0;
        self.window = window;
        self.ack_timer.cancel();
        self.ack_due = false;
    }

    pub fn set_window(&mut self, window: u8) {
        self.window = window;
    }

    pub fn expected(&self) -> SeqNum {
        self.expected
    }

    /// Data 도착. 수락하면 `true` (호출자가 페이로드를 상위로 전달)
    pub fn on_data(&mut self, sn: SeqNum) -> bool {
        if sn != self.expected {
            return false;
        }

        self.expected = sn.next();
        self.last_accepted = Some(sn);
        self.unacked += 1;

        if self.ack_delay_ticks == 0 || self.unacked >= self.window as usize {
            // 윈도우가 찼으면 송신측이 더 보낼 수 없으므로 바로 ACK
            self.ack_timer.cancel();
            self.ack_due = true;
        } else if !self.ack_timer.is_armed() {
            self.ack_timer.arm(self.ack_delay_ticks);
        }
        true
    }

    /// ACK 지연 타이머 한 틱. ACK를 보내야 하면 `true`
    pub fn on_ack_timeout_tick(&mut self) -> bool {
        if self.ack_timer.tick() {
            self.ack_due = true;
        }
        self.ack_due
    }

    /// 지금 보내야 할 누적 ACK
    pub fn due_ack(&self) -> Option<SeqNum> {
        if self.ack_due {
            self.last_accepted
        } else {
            None
        }
    }

    /// ACK 쓰기 성공
    pub fn ack_sent(&mut self) {
        self.ack_due = false;
        self.unacked = 0;
        self.ack_timer.cancel();
    }
}
