//! 5비트 순환 시퀀스 번호
//!
//! 패킷 헤더 상위 5비트에 실리므로 모듈러스는 32로 고정된다.

use std::fmt;
use std::ops::{Add, AddAssign};

/// 시퀀스 번호 모듈러스
pub const SN_MODULUS: u8 = 32;

/// 순환 시퀀스 번호 (0..32)
#[derive(PartialEq, Eq, Copy, Clone, Default, Hash)]
pub struct SeqNum(u8);

impl SeqNum {
    /// 시퀀스 번호 0 (리셋 직후 기준점)
    pub const ZERO: Self = SeqNum(0);

    /// 모듈러 연산을 적용해 생성
    pub fn new(raw: u8) -> Self {
        SeqNum(raw % SN_MODULUS)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        self + 1
    }

    /// `self`에서 `other`까지 앞으로 몇 칸인지 (0..32)
    pub fn distance_to(self, other: SeqNum) -> u8 {
        (other.0 + SN_MODULUS - self.0) % SN_MODULUS
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sn#{}", self.0)
    }
}

impl Add<u8> for SeqNum {
    type Output = Self;

    fn add(self, rhs: u8) -> Self {
        SeqNum(((self.0 as u16 + rhs as u16) % SN_MODULUS as u16) as u8)
    }
}

impl AddAssign<u8> for SeqNum {
    fn add_assign(&mut self, rhs: u8) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_at_modulus() {
        let sn = SeqNum::new(31);
        assert_eq!(sn.next(), SeqNum::ZERO);
        assert_eq!(SeqNum::new(33).raw(), 1);
        assert_eq!(sn + 255, SeqNum::new(30));
    }

    #[test]
    fn test_distance_across_wrap() {
        assert_eq!(SeqNum::new(30).distance_to(SeqNum::new(2)), 4);
        assert_eq!(SeqNum::new(2).distance_to(SeqNum::new(30)), 28);
        assert_eq!(SeqNum::new(7).distance_to(SeqNum::new(7)), 0);
    }
}
