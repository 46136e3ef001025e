// actions module: operations that change the local clone.

pub mod checkout;
