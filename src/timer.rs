//! 틱 기반 타이머
//!
//! 외부 주기 틱으로만 진행한다. 실제 시간은 엔진의 틱 태스크가 관리.

/// 재전송 판정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// 아직 대기
    Pending,

    /// 타임아웃, 재전송 필요
    Retransmit,

    /// 재시도 한도 초과
    Exhausted,
}

/// 전송된 슬롯의 나이와 재시도 횟수
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotAge {
    pub ticks: u16,
    pub retries: u8,
}

/// 슬롯 재전송 시계
#[derive(Debug, Clone, Copy)]
pub struct RetransmitClock {
    timeout_ticks: u16,
    max_retries: u8,
}

impl RetransmitClock {
    pub fn new(timeout_ticks: u16, max_retries: u8) -> Self {
        Self {
            timeout_ticks: timeout_ticks.max(1),
            max_retries,
        }
    }

    /// 한 틱 진행
    ///
    /// 타임아웃에 도달하면 나이를 0으로 돌리고 재시도 횟수를 올린다.
    /// 이미 `max_retries`번 재전송했다면 `Exhausted`.
    pub fn advance(&self, age: &mut SlotAge) -> Expiry {
        age.ticks = age.ticks.saturating_add(1);
        if age.ticks < self.timeout_ticks {
            return Expiry::Pending;
        }

        if age.retries >= self.max_retries {
            return Expiry::Exhausted;
        }

        age.ticks = 0;
        age.retries += 1;
        Expiry::Retransmit
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }
}

/// 일회성 카운트다운 (리셋 타임아웃, ACK 지연)
#[derive(Debug, Clone, Copy, Default)]
pub struct Countdown {
    remaining: Option<u16>,
}

impl Countdown {
    pub fn arm(&mut self, ticks: u16) {
        self.remaining = Some(ticks.max(1));
    }

    pub fn cancel(&mut self) {
        self.remaining = None;
    }

    pub fn is_armed(&self) -> bool {
        self.remaining.is_some()
    }

    /// 한 틱 진행. 만료되면 `true`를 반환하고 해제된다.
    pub fn tick(&mut self) -> bool {
        match self.remaining {
            Some(1) => {
                self.remaining = None;
                true
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                false
            }
            None => false,
        }
    }
}
