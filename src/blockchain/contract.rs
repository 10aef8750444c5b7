//! Token contract bindings.
//!
//! Outbound contract calls go through a static table mapping a method name to
//! a typed encoder, inbound logs through a table keyed by event signature.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent, SolValue};
use serde::{Deserialize, Serialize};

use crate::blockchain::types::{LedgerError, LedgerResult, ObservedLog};

sol! {
    /// Token surface used by the keeper.
    #[derive(Debug)]
    interface IToken {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
        function approve(address spender, uint256 amount) external returns (bool);
        function transferOwnership(address newOwner) external;

        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);
        event OwnershipTransferred(address indexed previousOwner, address indexed newOwner);
    }
}

/// Event signature the watcher subscribes to.
pub const WATCHED_EVENT: B256 = IToken::Transfer::SIGNATURE_HASH;

/// Method and extra parameters of an outbound contract call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMethod {
    pub name: String,
    /// Token holder for `transferFrom`.
    #[serde(default)]
    pub owner: Option<Address>,
}

impl ContractMethod {
    pub fn transfer() -> Self {
        Self {
            name: "transfer".to_string(),
            owner: None,
        }
    }
}

/// Arguments shared by every dispatchable method.
#[derive(Debug, Clone, Copy)]
pub struct CallArguments {
    pub recipient: Address,
    pub amount: U256,
    pub owner: Option<Address>,
}

type Encoder = fn(&CallArguments) -> LedgerResult<Bytes>;

const CALL_TABLE: &[(&str, Encoder)] = &[
    ("transfer", encode_transfer),
    ("transferFrom", encode_transfer_from),
    ("approve", encode_approve),
    ("transferOwnership", encode_transfer_ownership),
];

fn encode_transfer(args: &CallArguments) -> LedgerResult<Bytes> {
    Ok(IToken::transferCall {
        to: args.recipient,
        amount: args.amount,
    }
    .abi_encode()
    .into())
}

fn encode_transfer_from(args: &CallArguments) -> LedgerResult<Bytes> {
    let from = args.owner.ok_or_else(|| {
        LedgerError::InvalidRequest("transferFrom requires a token owner".to_string())
    })?;
    Ok(IToken::transferFromCall {
        from,
        to: args.recipient,
        amount: args.amount,
    }
    .abi_encode()
    .into())
}

fn encode_approve(args: &CallArguments) -> LedgerResult<Bytes> {
    Ok(IToken::approveCall {
        spender: args.recipient,
        amount: args.amount,
    }
    .abi_encode()
    .into())
}

fn encode_transfer_ownership(args: &CallArguments) -> LedgerResult<Bytes> {
    Ok(IToken::transferOwnershipCall {
        newOwner: args.recipient,
    }
    .abi_encode()
    .into())
}

/// Encode a call by method name.
pub fn encode_call(method: &str, args: &CallArguments) -> LedgerResult<Bytes> {
    let (_, encoder) = CALL_TABLE
        .iter()
        .find(|(name, _)| *name == method)
        .ok_or_else(|| LedgerError::InvalidRequest(format!("unsupported contract method '{}'", method)))?;
    encoder(args)
}

pub fn is_supported_method(method: &str) -> bool {
    CALL_TABLE.iter().any(|(name, _)| *name == method)
}

pub fn balance_of_call(owner: Address) -> Bytes {
    IToken::balanceOfCall { owner }.abi_encode().into()
}

pub fn decode_balance(output: &[u8]) -> LedgerResult<U256> {
    U256::abi_decode(output)
        .map_err(|e| LedgerError::Connection(format!("malformed balanceOf result: {}", e)))
}

/// A decoded token event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    Transfer { from: Address, to: Address, value: U256 },
    Approval { owner: Address, spender: Address, value: U256 },
    OwnershipTransferred { previous: Address, new: Address },
}

impl TokenEvent {
    /// Method that produced this event, given the sender of the transaction.
    pub fn method_name(&self, tx_sender: Address) -> &'static str {
        match self {
            TokenEvent::Transfer { from, .. } if *from == tx_sender => "transfer",
            TokenEvent::Transfer { .. } => "transferFrom",
            TokenEvent::Approval { .. } => "approve",
            TokenEvent::OwnershipTransferred { .. } => "transferOwnership",
        }
    }

    pub fn amount(&self) -> U256 {
        match self {
            TokenEvent::Transfer { value, .. } | TokenEvent::Approval { value, .. } => *value,
            TokenEvent::OwnershipTransferred { .. } => U256::ZERO,
        }
    }

    /// The address the call was directed at (recipient, spender or new owner).
    pub fn counterparty(&self) -> Address {
        match self {
            TokenEvent::Transfer { to, .. } => *to,
            TokenEvent::Approval { spender, .. } => *spender,
            TokenEvent::OwnershipTransferred { new, .. } => *new,
        }
    }
}

type Decoder = fn(&ObservedLog) -> Option<TokenEvent>;

const EVENT_TABLE: &[(B256, Decoder)] = &[
    (IToken::Transfer::SIGNATURE_HASH, decode_transfer),
    (IToken::Approval::SIGNATURE_HASH, decode_approval),
    (IToken::OwnershipTransferred::SIGNATURE_HASH, decode_ownership),
];

fn decode_transfer(log: &ObservedLog) -> Option<TokenEvent> {
    let event = IToken::Transfer::decode_raw_log(log.topics.iter().copied(), &log.data).ok()?;
    Some(TokenEvent::Transfer {
        from: event.from,
        to: event.to,
        value: event.value,
    })
}

fn decode_approval(log: &ObservedLog) -> Option<TokenEvent> {
    let event = IToken::Approval::decode_raw_log(log.topics.iter().copied(), &log.data).ok()?;
    Some(TokenEvent::Approval {
        owner: event.owner,
        spender: event.spender,
        value: event.value,
    })
}

fn decode_ownership(log: &ObservedLog) -> Option<TokenEvent> {
    let event =
        IToken::OwnershipTransferred::decode_raw_log(log.topics.iter().copied(), &log.data).ok()?;
    Some(TokenEvent::OwnershipTransferred {
        previous: event.previousOwner,
        new: event.newOwner,
    })
}

/// Decode a log by its first topic. Unknown signatures yield `None`.
pub fn decode_log(log: &ObservedLog) -> Option<TokenEvent> {
    let topic0 = log.topics.first()?;
    let (_, decoder) = EVENT_TABLE.iter().find(|(signature, _)| signature == topic0)?;
    decoder(log)
}

#[cfg(test)]
pub(crate) fn transfer_log(
    tx_hash: alloy::primitives::TxHash,
    contract: Address,
    from: Address,
    to: Address,
    value: U256,
    block_number: u64,
) -> ObservedLog {
    ObservedLog {
        tx_hash,
        contract,
        data: value.abi_encode().into(),
        topics: vec![WATCHED_EVENT, from.into_word(), to.into_word()],
        block_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, TxHash};

    const HOLDER: Address = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
    const RECIPIENT: Address = address!("70997970c51812dc3a010c7d01b50e0d17dc79c8");

    #[test]
    fn test_encode_transfer_by_name() {
        let args = CallArguments {
            recipient: RECIPIENT,
            amount: U256::from(1_000u64),
            owner: None,
        };
        let input = encode_call("transfer", &args).unwrap();
        assert_eq!(&input[..4], IToken::transferCall::SELECTOR.as_slice());

        let decoded = IToken::transferCall::abi_decode(&input).unwrap();
        assert_eq!(decoded.to, RECIPIENT);
        assert_eq!(decoded.amount, U256::from(1_000u64));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let args = CallArguments {
            recipient: RECIPIENT,
            amount: U256::from(1u64),
            owner: None,
        };
        assert!(matches!(
            encode_call("mint", &args),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(matches!(
            encode_call("transferFrom", &args),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(!is_supported_method("mint"));
    }

    #[test]
    fn test_decode_transfer_log() {
        let log = transfer_log(
            TxHash::repeat_byte(1),
            Address::repeat_byte(9),
            HOLDER,
            RECIPIENT,
            U256::from(500u64),
            12,
        );

        let event = decode_log(&log).unwrap();
        assert_eq!(event.amount(), U256::from(500u64));
        assert_eq!(event.counterparty(), RECIPIENT);
        assert_eq!(event.method_name(HOLDER), "transfer");
        assert_eq!(event.method_name(RECIPIENT), "transferFrom");
    }

    #[test]
    fn test_unknown_topic_ignored() {
        let mut log = transfer_log(
            TxHash::repeat_byte(1),
            Address::repeat_byte(9),
            HOLDER,
            RECIPIENT,
            U256::from(1u64),
            1,
        );
        log.topics[0] = B256::repeat_byte(0xee);
        assert!(decode_log(&log).is_none());
    }

    #[test]
    fn test_balance_round_trip_through_abi() {
        let encoded = U256::from(77u64).abi_encode();
        assert_eq!(decode_balance(&encoded).unwrap(), U256::from(77u64));
        assert_eq!(&balance_of_call(HOLDER)[..4], IToken::balanceOfCall::SELECTOR.as_slice());
    }
}
