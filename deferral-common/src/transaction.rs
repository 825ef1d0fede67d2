use serde::{Deserialize, Serialize};

/// How much transactional coordination an endpoint asks for.
///
/// The store and the dispatcher both look at this to decide whether a unit
/// of work spans fetch, dispatch and removal of an entry, or whether each
/// step stands on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    /// No transactions at all; each operation is applied as it happens
    None,
    /// Receives are transactional, sends are not enlisted
    ReceiveOnly,
    /// Sends commit or roll back together with the receive
    SendsAtomicWithReceive,
    /// Store writes and sends share one unit of work
    #[default]
    TransactionScope,
}

impl TransactionMode {
    /// Whether dispatch and store mutation share a single unit of work
    #[must_use]
    pub const fn spans_dispatch(self) -> bool {
        matches!(self, Self::TransactionScope | Self::SendsAtomicWithReceive)
    }
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::ReceiveOnly => "ReceiveOnly",
            Self::SendsAtomicWithReceive => "SendsAtomicWithReceive",
            Self::TransactionScope => "TransactionScope",
        };
        f.write_str(name)
    }
}
