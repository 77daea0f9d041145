//! Sent but unacknowledged I frames, and sequence number arithmetic.

/// Information field queued for an I frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub payload: Vec<u8>,
    /// Report the buffer back to the client once acknowledged.
    pub notify: bool,
}

impl Info {
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            notify: true,
        }
    }

    #[must_use]
    pub fn unconfirmed(payload: Vec<u8>) -> Self {
        Self {
            payload,
            notify: false,
        }
    }
}

/// `(a - b) mod modulus`.
#[must_use]
pub fn seq_sub(a: u8, b: u8, modulus: u8) -> u8 {
    ((u16::from(a) + u16::from(modulus) - u16::from(b)) % u16::from(modulus)) as u8
}

#[must_use]
pub fn seq_inc(a: u8, modulus: u8) -> u8 {
    ((u16::from(a) + 1) % u16::from(modulus)) as u8
}

#[must_use]
pub fn seq_dec(a: u8, modulus: u8) -> u8 {
    seq_sub(a, 1, modulus)
}

/// Circular store of k slots. Offset 0 is the oldest unacknowledged frame,
/// the one numbered V(A).
#[derive(Debug)]
pub struct Window {
    slots: Vec<Option<Info>>,
    sow: usize,
}

impl Window {
    #[must_use]
    pub fn new(k: u8) -> Self {
        Self {
            slots: vec![None; usize::from(k.max(1))],
            sow: 0,
        }
    }

    fn slot(&self, offset: u8) -> usize {
        (self.sow + usize::from(offset)) % self.slots.len()
    }

    /// Store a frame, returning whatever it displaced.
    pub fn put(&mut self, offset: u8, info: Info) -> Option<Info> {
        let i = self.slot(offset);
        self.slots[i].replace(info)
    }

    pub fn take(&mut self, offset: u8) -> Option<Info> {
        let i = self.slot(offset);
        self.slots[i].take()
    }

    /// Acknowledge the oldest frame.
    pub fn release_oldest(&mut self) -> Option<Info> {
        let ret = self.slots[self.sow].take();
        self.sow = (self.sow + 1) % self.slots.len();
        ret
    }

    /// Drop everything. Returns how many frames were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.occupied();
        self.slots.iter_mut().for_each(|s| *s = None);
        self.sow = 0;
        n
    }

    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
