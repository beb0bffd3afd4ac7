use std::fmt;

use serde::{Deserialize, Serialize};

/// Amount of TON in its smallest on-chain unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Nanoton(u64);

impl Nanoton {
    /// Nanoton per whole TON.
    pub const PER_TON: u64 = 1_000_000_000;

    const PER_CENT: u64 = Self::PER_TON / 100;

    pub const ZERO: Nanoton = Nanoton(0);

    pub const fn new(value: u64) -> Self {
        Nanoton(value)
    }

    pub const fn from_ton(ton: u64) -> Self {
        Nanoton(ton * Self::PER_TON)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Nanoton)
    }

    /// Render as whole TON with two decimals, rounding half up.
    pub fn to_ton_string(self) -> String {
        let cents = self.0 / Self::PER_CENT + u64::from(self.0 % Self::PER_CENT >= Self::PER_CENT / 2);
        format!("{}.{:02}", cents / 100, cents % 100)
    }
}

impl fmt::Display for Nanoton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Nanoton {
    fn from(value: u64) -> Self {
        Nanoton(value)
    }
}
