use serde::{Deserialize, Serialize};

/// Kind tag of a transaction message, carried as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum TransactionType {
    Invalid,
    Call,
    Reply,
    Handshake,
    Ack,
    Exit,
}

impl From<TransactionType> for u8 {
    fn from(kind: TransactionType) -> Self {
        match kind {
            TransactionType::Invalid => 0,
            TransactionType::Call => 1,
            TransactionType::Reply => 2,
            TransactionType::Handshake => 3,
            TransactionType::Ack => 4,
            TransactionType::Exit => 5,
        }
    }
}

impl From<u8> for TransactionType {
    fn from(tag: u8) -> Self {
        match tag {
            1 => TransactionType::Call,
            2 => TransactionType::Reply,
            3 => TransactionType::Handshake,
            4 => TransactionType::Ack,
            5 => TransactionType::Exit,
            // Unknown tags decode as Invalid so a bad datagram cannot be
            // mistaken for a call or reply.
            _ => TransactionType::Invalid,
        }
    }
}

/// One api-invocation message exchanged between harness and daemon.
///
/// A reply echoes the id of the call it answers; an ack echoes the id of the
/// handshake it answers. Handshake, ack and exit carry no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMessage {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    #[serde(rename = "data", default)]
    pub data_parcel: String,
}

impl TransactionMessage {
    pub fn call(id: u32, data_parcel: impl Into<String>) -> Self {
        Self {
            id,
            kind: TransactionType::Call,
            data_parcel: data_parcel.into(),
        }
    }

    pub fn reply_to(request_id: u32, data_parcel: impl Into<String>) -> Self {
        Self {
            id: request_id,
            kind: TransactionType::Reply,
            data_parcel: data_parcel.into(),
        }
    }

    pub fn handshake(id: u32) -> Self {
        Self {
            id,
            kind: TransactionType::Handshake,
            data_parcel: String::new(),
        }
    }

    pub fn ack_to(handshake_id: u32) -> Self {
        Self {
            id: handshake_id,
            kind: TransactionType::Ack,
            data_parcel: String::new(),
        }
    }

    pub fn exit(id: u32) -> Self {
        Self {
            id,
            kind: TransactionType::Exit,
            data_parcel: String::new(),
        }
    }
}
