use crate::dtls::message::Sequence;

/// Sliding anti-replay window for protected records.
///
/// Tracks the highest accepted sequence number of the current epoch plus a 64-bit bitmap
/// of the numbers just below it. Moving to a new epoch clears the window.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    epoch: u16,
    max_seq: u64,
    window: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record with this sequence would be accepted. Does not update state.
    pub fn check(&self, seq: Sequence) -> bool {
        if seq.epoch != self.epoch {
            return seq.epoch > self.epoch;
        }
        if self.window == 0 || seq.sequence_number > self.max_seq {
            return true;
        }
        let offset = self.max_seq - seq.sequence_number;
        offset < 64 && self.window & (1u64 << offset) == 0
    }

    /// Record an authenticated sequence number. Call only after [`check`](Self::check)
    /// and successful decryption so that forged records can not advance the window.
    pub fn update(&mut self, seq: Sequence) {
        if seq.epoch > self.epoch {
            self.epoch = seq.epoch;
            self.max_seq = 0;
            self.window = 0;
        }

        if self.window == 0 {
            self.max_seq = seq.sequence_number;
            self.window = 1;
        } else if seq.sequence_number > self.max_seq {
            let delta = seq.sequence_number - self.max_seq;
            self.window = if delta >= 64 { 0 } else { self.window << delta };
            self.window |= 1;
            self.max_seq = seq.sequence_number;
        } else {
            let offset = self.max_seq - seq.sequence_number;
            if offset < 64 {
                self.window |= 1u64 << offset;
            }
        }
    }
}
