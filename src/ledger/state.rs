use crate::Nanoton;

/// A user's account as held by the ledger.
#[derive(Debug, Clone, Default)]
pub struct Account {
    balance: Nanoton,
}

impl Account {
    pub fn balance(&self) -> Nanoton {
        self.balance
    }

    /// Credit `amount`, or return `None` without mutating on overflow.
    pub fn credit(&mut self, amount: Nanoton) -> Option<Nanoton> {
        let balance = self.balance.checked_add(amount)?;
        self.balance = balance;
        Some(balance)
    }
}
