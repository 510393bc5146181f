use thiserror::Error;

/// Error codes a node reports in JSON-RPC error objects.
pub mod codes {
    pub const RPC_MISC_ERROR: i64 = -1;
    pub const RPC_TYPE_ERROR: i64 = -3;
    pub const RPC_WALLET_ERROR: i64 = -4;
    pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
    pub const RPC_WALLET_INSUFFICIENT_FUNDS: i64 = -6;
    pub const RPC_INVALID_PARAMETER: i64 = -8;
    pub const RPC_WALLET_NOT_FOUND: i64 = -18;
    pub const RPC_DESERIALIZATION_ERROR: i64 = -22;
    pub const RPC_CLIENT_NODE_ALREADY_ADDED: i64 = -23;
    pub const RPC_CLIENT_NODE_NOT_ADDED: i64 = -24;
    pub const RPC_VERIFY_ERROR: i64 = -25;
    pub const RPC_VERIFY_REJECTED: i64 = -26;
    pub const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;
    pub const RPC_CLIENT_NODE_NOT_CONNECTED: i64 = -29;
    pub const RPC_CLIENT_NODE_CAPACITY_REACHED: i64 = -34;
    pub const RPC_WALLET_ALREADY_EXISTS: i64 = -35;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    /// Error object returned by the node, code and message untouched
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response to '{method}': {reason}")]
    InvalidResponse { method: String, reason: String },
}

impl RpcError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        RpcError::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_response(method: &str, reason: impl ToString) -> Self {
        RpcError::InvalidResponse {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Node-reported message, if this is a node-side error.
    pub fn message(&self) -> Option<&str> {
        match self {
            RpcError::Rpc { message, .. } => Some(message),
            _ => None,
        }
    }
}
