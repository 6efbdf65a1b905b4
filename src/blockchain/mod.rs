pub mod ethereum;
pub mod traits;

pub use ethereum::EthereumClient;
pub use traits::{BlockTag, ChainOracle, TransactionRecord};
