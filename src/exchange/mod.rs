mod traits;

pub use traits::{ExchangeClient, ExchangeFactory};

#[cfg(test)]
pub use traits::{MockExchangeClient, MockExchangeFactory};
