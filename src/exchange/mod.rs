pub mod instruments;
pub mod paper;
mod traits;

pub use instruments::InstrumentCache;
pub use paper::{ExchangeCall, PaperExchange};
pub use traits::ExchangeClient;
