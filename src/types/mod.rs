pub mod ledger;

pub use ledger::{
    ContractEvent, ContractId, EventType, Hash32, LedgerCloseMeta, LedgerEntryChange,
    RawTransaction, TransactionHash, TransactionMeta, network_id, transaction_hash,
};
