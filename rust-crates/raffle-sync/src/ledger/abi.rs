//! Just enough of the contract ABI to issue view calls and decode the handful
//! of return types the raffle contracts use.

use crate::{
    Error,
    Result,
    entity::Address,
    error::LedgerError,
};
use itertools::Itertools;
use sha3::{
    Digest,
    Keccak256,
};

pub const WORD: usize = 32;
const SELECTOR_LEN: usize = 4;
const ADDRESS_BYTES: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbiArg {
    Address(Address),
    Uint(u128),
}

impl AbiArg {
    fn type_name(&self) -> &'static str {
        match self {
            AbiArg::Address(_) => "address",
            AbiArg::Uint(_) => "uint256",
        }
    }

    fn encode_word(&self) -> Result<[u8; WORD]> {
        let mut word = [0u8; WORD];
        match self {
            AbiArg::Address(address) => {
                let body = address
                    .as_str()
                    .strip_prefix("0x")
                    .filter(|_| address.is_valid())
                    .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
                let bytes = hex::decode(body)
                    .map_err(|_| Error::InvalidAddress(address.to_string()))?;
                word[WORD - ADDRESS_BYTES..].copy_from_slice(&bytes);
            }
            AbiArg::Uint(value) => {
                word[WORD - 16..].copy_from_slice(&value.to_be_bytes());
            }
        }
        Ok(word)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodCall {
    name: String,
    args: Vec<AbiArg>,
}

impl MethodCall {
    pub fn new(name: impl Into<String>, args: Vec<AbiArg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical signature, e.g. `claimableFunds(address)`.
    pub fn signature(&self) -> String {
        format!(
            "{}({})",
            self.name,
            self.args.iter().map(AbiArg::type_name).join(",")
        )
    }

    pub fn selector(&self) -> [u8; SELECTOR_LEN] {
        let digest = Keccak256::digest(self.signature().as_bytes());
        let mut selector = [0u8; SELECTOR_LEN];
        selector.copy_from_slice(&digest[..SELECTOR_LEN]);
        selector
    }

    /// Selector followed by one word per (static) argument.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(SELECTOR_LEN + WORD * self.args.len());
        data.extend_from_slice(&self.selector());
        for arg in &self.args {
            data.extend_from_slice(&arg.encode_word()?);
        }
        Ok(data)
    }
}

/// Decodes a method's return data.
pub trait FromReturnData: Sized + Send {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self>;
}

fn decode_err(method: &str, reason: impl std::fmt::Display) -> Error {
    LedgerError::Decode(format!("{method}: {reason}")).into()
}

fn word_at<'a>(method: &str, data: &'a [u8], offset: usize) -> Result<&'a [u8]> {
    offset
        .checked_add(WORD)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| decode_err(method, format!("no word at byte {offset}")))
}

fn ensure_data(method: &str, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(LedgerError::EmptyReturnData {
            method: method.to_string(),
        }
        .into());
    }
    Ok(())
}

fn word_to_u128(method: &str, word: &[u8]) -> Result<u128> {
    let (high, low) = word.split_at(WORD - 16);
    if high.iter().any(|b| *b != 0) {
        return Err(decode_err(method, "value exceeds u128 range"));
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(low);
    Ok(u128::from_be_bytes(bytes))
}

fn word_to_usize(method: &str, word: &[u8]) -> Result<usize> {
    let value = word_to_u128(method, word)?;
    usize::try_from(value).map_err(|_| decode_err(method, "offset exceeds usize"))
}

fn word_to_address(method: &str, word: &[u8]) -> Result<Address> {
    let (padding, body) = word.split_at(WORD - ADDRESS_BYTES);
    if padding.iter().any(|b| *b != 0) {
        return Err(decode_err(method, "dirty address padding"));
    }
    Ok(Address::new(format!("0x{}", hex::encode(body))))
}

/// Resolves a dynamic value's head offset to the position of its length word.
fn dynamic_tail<'a>(method: &str, data: &'a [u8]) -> Result<(usize, &'a [u8])> {
    let offset = word_to_usize(method, word_at(method, data, 0)?)?;
    let length = word_to_usize(method, word_at(method, data, offset)?)?;
    let body = data
        .get(offset + WORD..)
        .ok_or_else(|| decode_err(method, "truncated dynamic value"))?;
    Ok((length, body))
}

impl FromReturnData for u128 {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        ensure_data(method, data)?;
        word_to_u128(method, word_at(method, data, 0)?)
    }
}

impl FromReturnData for u64 {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        let value = u128::from_return_data(method, data)?;
        u64::try_from(value).map_err(|_| decode_err(method, "value exceeds u64 range"))
    }
}

impl FromReturnData for i64 {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        let value = u128::from_return_data(method, data)?;
        i64::try_from(value).map_err(|_| decode_err(method, "value exceeds i64 range"))
    }
}

impl FromReturnData for u8 {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        let value = u128::from_return_data(method, data)?;
        u8::try_from(value).map_err(|_| decode_err(method, "value exceeds u8 range"))
    }
}

impl FromReturnData for bool {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        Ok(u128::from_return_data(method, data)? != 0)
    }
}

impl FromReturnData for Address {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        ensure_data(method, data)?;
        word_to_address(method, word_at(method, data, 0)?)
    }
}

impl FromReturnData for String {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        ensure_data(method, data)?;
        let (length, body) = dynamic_tail(method, data)?;
        let bytes = body
            .get(..length)
            .ok_or_else(|| decode_err(method, "truncated string"))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl FromReturnData for Vec<Address> {
    fn from_return_data(method: &str, data: &[u8]) -> Result<Self> {
        ensure_data(method, data)?;
        let (length, body) = dynamic_tail(method, data)?;
        (0..length)
            .map(|i| word_to_address(method, word_at(method, body, i * WORD)?))
            .collect()
    }
}
