//! Reconnect pacing after a read returns EOF or "try again".

use std::time::Duration;

use crate::media::Protocol;

pub const UDP_SOFT_RETRIES: u32 = 3;
pub const UDP_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const TCP_BASE_DELAY_MS: u64 = 250;
pub const TCP_MAX_DELAY_MS: u64 = 4_000;

/// What the read loop should do after a stall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallAction {
    /// Sleep, then keep reading from the same input.
    Retry(Duration),
    /// Sleep, then close the input and open it again.
    Reopen(Duration),
}

impl StallAction {
    pub fn delay(self) -> Duration {
        match self {
            StallAction::Retry(d) | StallAction::Reopen(d) => d,
        }
    }
}

/// Kind of stall reported by the demuxer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stall {
    Eof,
    Again,
}

#[derive(Clone, Debug)]
pub struct Backoff {
    protocol: Protocol,
    attempts: u32,
}

impl Backoff {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A packet arrived; start over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn on_stall(&mut self, stall: Stall) -> StallAction {
        if self.protocol.is_udp() {
            if self.attempts < UDP_SOFT_RETRIES {
                self.attempts += 1;
                return StallAction::Retry(UDP_RETRY_DELAY);
            }
            self.attempts = 0;
            return StallAction::Reopen(UDP_RETRY_DELAY);
        }
        let delay = tcp_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        match stall {
            Stall::Eof => StallAction::Reopen(delay),
            Stall::Again => StallAction::Retry(delay),
        }
    }
}

/// `250 * 2^n` ms, capped at 4 s.
pub fn tcp_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
    Duration::from_millis(TCP_BASE_DELAY_MS.saturating_mul(factor).min(TCP_MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_eof_sequence_doubles_then_caps() {
        let mut b = Backoff::new(Protocol::Tcp);
        let delays: Vec<u64> = (0..7)
            .map(|_| b.on_stall(Stall::Eof).delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 4000, 4000]);
        b.reset();
        assert_eq!(b.on_stall(Stall::Again), StallAction::Retry(Duration::from_millis(250)));
    }

    #[test]
    fn udp_soft_retries_then_reopen() {
        let mut b = Backoff::new(Protocol::Udp);
        let actions: Vec<StallAction> = (0..5).map(|_| b.on_stall(Stall::Eof)).collect();
        assert_eq!(
            actions,
            vec![
                StallAction::Retry(UDP_RETRY_DELAY),
                StallAction::Retry(UDP_RETRY_DELAY),
                StallAction::Retry(UDP_RETRY_DELAY),
                StallAction::Reopen(UDP_RETRY_DELAY),
                StallAction::Retry(UDP_RETRY_DELAY),
            ]
        );
    }

    #[test]
    fn delay_saturates_for_large_attempts() {
        assert_eq!(tcp_delay(40), Duration::from_millis(TCP_MAX_DELAY_MS));
    }
}
